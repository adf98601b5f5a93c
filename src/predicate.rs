//! Cell predicates: pure boolean tests over a single world cell.
//!
//! Predicates form a closed set ([`CellPredicate`]) so the matcher, the
//! template loader, and diagnostics can switch over every variant. They are
//! written in templates as short expressions:
//!
//! | Expression | Variant |
//! |---|---|
//! | `air` | [`CellPredicate::Air`] |
//! | `none` | [`CellPredicate::Nothing`] |
//! | `#casing` | [`CellPredicate::Tagged`] |
//! | `iron_block` | [`CellPredicate::Exact`] |
//! | `furnace[lit=true]` | [`CellPredicate::Shape`] |
//! | `stone \| cobblestone` | [`CellPredicate::AnyOf`] |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::TemplateError;
use crate::world::{AIR, Cell};

/// Outcome of [`CellPredicate::check`], carrying a reason on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateMatch {
    pub success: bool,
    pub reason: String,
}

impl PredicateMatch {
    fn ok() -> Self {
        Self {
            success: true,
            reason: String::new(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// A composable predicate over one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellPredicate {
    /// Cell kind equals the given key.
    Exact(String),
    /// Cell kind belongs to the named type group.
    Tagged(String),
    /// Cell kind equals `kind` and every declared property matches.
    ///
    /// Properties the cell carries but the predicate does not declare
    /// (for example `waterlogged`) are ignored.
    Shape {
        kind: String,
        properties: BTreeMap<String, String>,
    },
    /// Empty space.
    Air,
    /// Any of the alternatives; short-circuits on the first match.
    AnyOf(Vec<CellPredicate>),
    /// Never matches.
    Nothing,
}

impl CellPredicate {
    pub fn exact(kind: impl AsRef<str>) -> Self {
        Self::Exact(normalize(kind.as_ref()))
    }

    pub fn tagged(group: impl AsRef<str>) -> Self {
        Self::Tagged(normalize(group.as_ref()))
    }

    pub fn shape<K, V>(kind: impl AsRef<str>, properties: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::Shape {
            kind: normalize(kind.as_ref()),
            properties: properties
                .into_iter()
                .map(|(k, v)| (normalize(k.as_ref()), normalize(v.as_ref())))
                .collect(),
        }
    }

    pub fn matches(&self, cell: &Cell) -> bool {
        match self {
            Self::Exact(kind) => cell.kind.eq_ignore_ascii_case(kind),
            Self::Tagged(group) => cell.groups.iter().any(|g| g.eq_ignore_ascii_case(group)),
            Self::Shape { kind, properties } => {
                cell.kind.eq_ignore_ascii_case(kind)
                    && properties.iter().all(|(k, v)| {
                        cell.properties
                            .get(k)
                            .is_some_and(|actual| actual.eq_ignore_ascii_case(v))
                    })
            }
            Self::Air => cell.is_air(),
            Self::AnyOf(options) => options.iter().any(|p| p.matches(cell)),
            Self::Nothing => false,
        }
    }

    /// Like [`matches`](Self::matches) but explains a failure.
    pub fn check(&self, cell: &Cell) -> PredicateMatch {
        if self.matches(cell) {
            return PredicateMatch::ok();
        }
        let reason = match self {
            Self::Exact(kind) => format!("expected {kind}, found {}", cell.kind),
            Self::Tagged(group) => format!("{} is not in group #{group}", cell.kind),
            Self::Shape { kind, properties } => {
                if !cell.kind.eq_ignore_ascii_case(kind) {
                    format!("expected {kind}, found {}", cell.kind)
                } else {
                    let (key, want) = properties
                        .iter()
                        .find(|(k, v)| {
                            !cell
                                .properties
                                .get(*k)
                                .is_some_and(|actual| actual.eq_ignore_ascii_case(v))
                        })
                        .map(|(k, v)| (k.as_str(), v.as_str()))
                        .unwrap_or(("?", "?"));
                    let have = cell.properties.get(key).map(String::as_str).unwrap_or("unset");
                    format!("{kind}: expected {key}={want}, found {key}={have}")
                }
            }
            Self::Air => format!("expected air, found {}", cell.kind),
            Self::AnyOf(_) => format!("{} matches none of {self}", cell.kind),
            Self::Nothing => "predicate matches nothing".to_string(),
        };
        PredicateMatch::fail(reason)
    }

    /// Parse a predicate expression.
    pub fn parse(expression: &str) -> Result<Self, TemplateError> {
        let invalid = |message: &str| TemplateError::InvalidPredicate {
            expression: expression.to_string(),
            message: message.to_string(),
        };

        let alternatives: Vec<&str> = expression.split('|').map(str::trim).collect();
        if alternatives.len() > 1 {
            let options = alternatives
                .into_iter()
                .map(|alt| {
                    if alt.is_empty() {
                        Err(invalid("empty alternative"))
                    } else {
                        parse_term(alt).map_err(|m| invalid(&m))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::AnyOf(options));
        }

        let term = expression.trim();
        if term.is_empty() {
            return Err(invalid("expression is blank"));
        }
        parse_term(term).map_err(|m| invalid(&m))
    }
}

fn parse_term(term: &str) -> Result<CellPredicate, String> {
    let lower = normalize(term);
    match lower.as_str() {
        "air" => return Ok(CellPredicate::Air),
        "none" => return Ok(CellPredicate::Nothing),
        _ => {}
    }

    if let Some(group) = lower.strip_prefix('#') {
        if !is_key(group) {
            return Err(format!("invalid group name \"{group}\""));
        }
        return Ok(CellPredicate::Tagged(group.to_string()));
    }

    if let Some(open) = lower.find('[') {
        let kind = lower[..open].trim();
        let rest = lower[open + 1..]
            .strip_suffix(']')
            .ok_or_else(|| "missing closing `]`".to_string())?;
        if !is_key(kind) {
            return Err(format!("invalid cell kind \"{kind}\""));
        }
        let mut properties = BTreeMap::new();
        for pair in rest.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| format!("property \"{pair}\" is not key=value"))?;
            let (k, v) = (k.trim(), v.trim());
            if !is_key(k) || v.is_empty() {
                return Err(format!("invalid property \"{pair}\""));
            }
            properties.insert(k.to_string(), v.to_string());
        }
        return Ok(CellPredicate::Shape {
            kind: kind.to_string(),
            properties,
        });
    }

    if !is_key(&lower) {
        return Err(format!("invalid cell kind \"{lower}\""));
    }
    Ok(CellPredicate::Exact(lower))
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

fn is_key(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/'))
}

impl FromStr for CellPredicate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CellPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(kind) => f.write_str(kind),
            Self::Tagged(group) => write!(f, "#{group}"),
            Self::Shape { kind, properties } => {
                write!(f, "{kind}[")?;
                for (i, (k, v)) in properties.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_str("]")
            }
            Self::Air => f.write_str(AIR),
            Self::AnyOf(options) => {
                for (i, p) in options.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{p}")?;
                }
                Ok(())
            }
            Self::Nothing => f.write_str("none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_is_case_insensitive() {
        let p = CellPredicate::exact("IRON_BLOCK");
        assert!(p.matches(&Cell::new("iron_block")));
        assert!(!p.matches(&Cell::new("gold_block")));
    }

    #[test]
    fn tagged_checks_group_membership() {
        let p = CellPredicate::parse("#Casing").unwrap();
        assert!(p.matches(&Cell::new("steel_casing").with_group("casing")));
        assert!(!p.matches(&Cell::new("stone")));
    }

    #[test]
    fn shape_ignores_undeclared_properties() {
        let p = CellPredicate::parse("furnace[lit=true]").unwrap();
        let cell = Cell::new("furnace")
            .with_property("lit", "TRUE")
            .with_property("waterlogged", "true");
        assert!(p.matches(&cell));
    }

    #[test]
    fn shape_requires_declared_properties() {
        let p = CellPredicate::parse("furnace[lit=true, facing=north]").unwrap();
        let cell = Cell::new("furnace").with_property("lit", "true");
        let result = p.check(&cell);
        assert!(!result.success);
        assert!(result.reason.contains("facing=north"), "{}", result.reason);
    }

    #[test]
    fn shape_property_order_does_not_matter() {
        let a = CellPredicate::parse("lever[powered=true,face=wall]").unwrap();
        let b = CellPredicate::parse("lever[face=wall,powered=true]").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn any_of_and_air() {
        let p = CellPredicate::parse("stone | air").unwrap();
        assert!(p.matches(&Cell::new("stone")));
        assert!(p.matches(&Cell::air()));
        assert!(!p.matches(&Cell::new("dirt")));
    }

    #[test]
    fn nothing_never_matches() {
        let p = CellPredicate::parse("none").unwrap();
        assert!(!p.matches(&Cell::air()));
        assert!(!p.check(&Cell::new("stone")).success);
    }

    #[test]
    fn check_explains_kind_mismatch() {
        let result = CellPredicate::exact("stone").check(&Cell::new("dirt"));
        assert_eq!(result.reason, "expected stone, found dirt");
    }

    #[test]
    fn display_round_trips_through_parse() {
        for expr in ["air", "none", "#casing", "iron_block", "furnace[lit=true]", "a | #b"] {
            let p = CellPredicate::parse(expr).unwrap();
            assert_eq!(CellPredicate::parse(&p.to_string()).unwrap(), p, "{expr}");
        }
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["", "  ", "furnace[lit=true", "stone |", "#", "bad kind", "x[lit]"] {
            assert!(CellPredicate::parse(expr).is_err(), "{expr:?} should fail");
        }
    }
}
