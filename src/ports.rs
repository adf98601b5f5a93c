//! Port resolution: declared logical connectors to concrete world cells.
//!
//! Block references are rotated by the instance's stored facing with the
//! same mapping the pattern matcher uses. Resolution never fails loudly:
//! an absent port or an unloaded cell yields `None` or an empty list.

use crate::geom::CellPos;
use crate::instance::MultiblockInstance;
use crate::template::{BlockRef, PortDefinition, PortDirection};
use crate::world::World;

/// A port of a live instance together with the cell it sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPort {
    pub id: String,
    pub definition: PortDefinition,
    pub position: CellPos,
}

/// Read-only resolver. With a world attached, ports whose cell lies in an
/// unloaded region resolve to nothing.
#[derive(Clone, Copy, Default)]
pub struct PortResolver<'w> {
    world: Option<&'w dyn World>,
}

impl<'w> PortResolver<'w> {
    pub fn new() -> Self {
        Self { world: None }
    }

    pub fn with_world(world: &'w dyn World) -> Self {
        Self { world: Some(world) }
    }

    pub fn resolve_block(&self, instance: &MultiblockInstance, block: BlockRef) -> Option<CellPos> {
        let pos = match block {
            BlockRef::Controller => instance.anchor(),
            BlockRef::Offset(o) => instance.anchor() + instance.facing().rotate(o),
        };
        match self.world {
            Some(world) if !world.is_loaded(pos) => None,
            _ => Some(pos),
        }
    }

    /// Resolve a declared port by id.
    pub fn resolve_port(&self, instance: &MultiblockInstance, id: &str) -> Option<ResolvedPort> {
        let definition = instance.template().ports().get(id)?;
        let position = self.resolve_definition(instance, definition)?;
        Some(ResolvedPort {
            id: id.to_string(),
            definition: definition.clone(),
            position,
        })
    }

    /// Resolve an ad-hoc port definition against an instance.
    pub fn resolve_definition(
        &self,
        instance: &MultiblockInstance,
        definition: &PortDefinition,
    ) -> Option<CellPos> {
        self.resolve_block(instance, definition.block)
    }

    /// Every resolvable port, ordered by port id.
    pub fn resolve_all(&self, instance: &MultiblockInstance) -> Vec<ResolvedPort> {
        self.resolve_where(instance, |_| true)
    }

    pub fn by_type(&self, instance: &MultiblockInstance, port_type: &str) -> Vec<ResolvedPort> {
        self.resolve_where(instance, |d| d.port_type.eq_ignore_ascii_case(port_type))
    }

    /// Ports usable in `direction`; bidirectional ports qualify for both.
    pub fn by_direction(&self, instance: &MultiblockInstance, direction: PortDirection) -> Vec<ResolvedPort> {
        self.resolve_where(instance, |d| d.direction.accepts(direction))
    }

    pub fn by_capability(&self, instance: &MultiblockInstance, tag: &str) -> Vec<ResolvedPort> {
        self.resolve_where(instance, |d| d.capabilities.contains(tag))
    }

    fn resolve_where(
        &self,
        instance: &MultiblockInstance,
        keep: impl Fn(&PortDefinition) -> bool,
    ) -> Vec<ResolvedPort> {
        instance
            .template()
            .ports()
            .iter()
            .filter(|(_, def)| keep(def))
            .filter_map(|(id, def)| {
                let position = self.resolve_definition(instance, def)?;
                Some(ResolvedPort {
                    id: id.clone(),
                    definition: def.clone(),
                    position,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for PortResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortResolver")
            .field("world", &self.world.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{Facing, Offset, WorldId};
    use crate::instance::InstanceId;
    use crate::predicate::CellPredicate;
    use crate::template::{MultiblockTemplate, TemplateDefinition, TemplateSource};
    use crate::world::GridWorld;
    use std::sync::Arc;

    fn pos(x: i32, y: i32, z: i32) -> CellPos {
        CellPos::new(WorldId(0), x, y, z)
    }

    fn furnace(facing: Facing) -> MultiblockInstance {
        let template = MultiblockTemplate::builder("furnace", CellPredicate::exact("iron_block"))
            .entry([1, 0, 0], CellPredicate::exact("stone"))
            .port(
                "fuel",
                PortDefinition::new(PortDirection::Input, "item", BlockRef::Offset(Offset::new(1, 0, 0)))
                    .with_capability("item_handler"),
            )
            .port(
                "power",
                PortDefinition::new(PortDirection::Both, "energy", BlockRef::Controller),
            )
            .port(
                "exhaust",
                PortDefinition::new(PortDirection::Output, "fluid", BlockRef::Offset(Offset::new(0, 1, 0))),
            )
            .build()
            .unwrap();
        MultiblockInstance::new(InstanceId::new(1), Arc::new(template), pos(10, 64, 10), facing)
    }

    #[test]
    fn controller_reference_is_the_anchor() {
        let inst = furnace(Facing::West);
        let r = PortResolver::new();
        assert_eq!(r.resolve_block(&inst, BlockRef::Controller), Some(pos(10, 64, 10)));
    }

    #[test]
    fn offsets_follow_instance_facing() {
        let r = PortResolver::new();
        let cases = [
            (Facing::North, pos(11, 64, 10)),
            (Facing::East, pos(10, 64, 11)),
            (Facing::South, pos(9, 64, 10)),
            (Facing::West, pos(10, 64, 9)),
        ];
        for (facing, expected) in cases {
            let inst = furnace(facing);
            assert_eq!(r.resolve_port(&inst, "fuel").unwrap().position, expected, "{facing}");
        }
    }

    #[test]
    fn unknown_port_is_none() {
        let inst = furnace(Facing::North);
        assert!(PortResolver::new().resolve_port(&inst, "missing").is_none());
    }

    #[test]
    fn filters_by_type_direction_and_capability() {
        let inst = furnace(Facing::North);
        let r = PortResolver::new();

        let ids = |ports: Vec<ResolvedPort>| ports.into_iter().map(|p| p.id).collect::<Vec<_>>();
        assert_eq!(ids(r.resolve_all(&inst)), ["exhaust", "fuel", "power"]);
        assert_eq!(ids(r.by_type(&inst, "ENERGY")), ["power"]);
        assert_eq!(ids(r.by_direction(&inst, PortDirection::Input)), ["fuel", "power"]);
        assert_eq!(ids(r.by_direction(&inst, PortDirection::Output)), ["exhaust", "power"]);
        assert_eq!(ids(r.by_capability(&inst, "item_handler")), ["fuel"]);
    }

    #[test]
    fn unloaded_cells_do_not_resolve() {
        let inst = furnace(Facing::North);
        let mut world = GridWorld::new();
        world.unload_region(pos(10, 64, 10));
        let r = PortResolver::with_world(&world);
        assert!(r.resolve_port(&inst, "power").is_none());
        assert!(r.resolve_all(&inst).is_empty());
    }

    #[test]
    fn legacy_shorthands_resolve() {
        let def = TemplateDefinition::from_toml(
            r#"
            id = "legacy"
            controller = "iron_block"
            [roles]
            input = [[1, 0, 0]]
            [inputs.energy]
            block = "controller"
            "#,
            "legacy.toml",
        )
        .unwrap();
        let template = Arc::new(def.into_template(TemplateSource::User, 20).unwrap());
        let inst = MultiblockInstance::new(InstanceId::new(3), template, pos(0, 0, 0), Facing::North);
        let r = PortResolver::new();

        let port_in = r.resolve_port(&inst, "port_in_1").unwrap();
        assert_eq!(port_in.definition.direction, PortDirection::Input);
        assert_eq!(port_in.position, pos(1, 0, 0));
        assert_eq!(r.resolve_port(&inst, "input_energy").unwrap().position, pos(0, 0, 0));
    }
}
