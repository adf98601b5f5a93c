//! Namespace, domain and store identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Fallback segment for blank identifiers in lenient mode.
pub const UNKNOWN_SEGMENT: &str = "unknown";

/// How identifier violations are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdMode {
    /// Reject anything outside `[a-z0-9_.-]` and any `..`.
    Strict,
    /// Rewrite offending characters to `_` and collapse dot runs.
    #[default]
    Lenient,
}

fn allowed(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')
}

/// Normalize one identifier segment (trimmed, lower-cased).
pub fn normalize_segment(raw: &str, mode: IdMode, log: bool) -> StorageResult<String> {
    let lowered = raw.trim().to_lowercase();
    match mode {
        IdMode::Strict => {
            let reject = |reason: &str| StorageError::InvalidSegment {
                segment: raw.to_string(),
                reason: reason.to_string(),
            };
            if lowered.is_empty() {
                return Err(reject("identifier is blank"));
            }
            if lowered.contains("..") {
                return Err(reject("path traversal sequence `..`"));
            }
            if let Some(c) = lowered.chars().find(|c| !allowed(*c)) {
                return Err(reject(&format!("character {c:?} is not allowed")));
            }
            Ok(lowered)
        }
        IdMode::Lenient => {
            let mut out = String::with_capacity(lowered.len());
            for c in lowered.chars() {
                let c = if allowed(c) { c } else { '_' };
                if c == '.' && out.ends_with('.') {
                    continue;
                }
                out.push(c);
            }
            let out = if out.trim_matches(|c| c == '.' || c == '_').is_empty() {
                UNKNOWN_SEGMENT.to_string()
            } else {
                out
            };
            if log && out != raw {
                tracing::debug!(raw = %raw, normalized = %out, "storage identifier normalized");
            }
            Ok(out)
        }
    }
}

/// Fully normalized `namespace/domain/store` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreAddress {
    pub namespace: String,
    pub domain: String,
    pub store: String,
}

impl StoreAddress {
    /// Backend key prefix for this store's records.
    pub fn key_prefix(&self) -> String {
        format!("{self}:")
    }

    pub fn record_key(&self, key: &str) -> String {
        format!("{self}:{key}")
    }

    /// Split a backend key into its store address and record key.
    pub fn split_key(full: &str) -> Option<(StoreAddress, &str)> {
        let (address, key) = full.split_once(':')?;
        let mut parts = address.splitn(3, '/');
        Some((
            StoreAddress {
                namespace: parts.next()?.to_string(),
                domain: parts.next()?.to_string(),
                store: parts.next()?.to_string(),
            },
            key,
        ))
    }
}

impl fmt::Display for StoreAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.domain, self.store)
    }
}
