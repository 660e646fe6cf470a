//! Minimal local world for the standalone client and tests.
//!
//! Keeps the last movement applied to each car and a proxy per spawned
//! entity. Tracked fields come from an optional factory so tests can
//! mirror whatever the host registered.

use std::collections::BTreeMap;

use replica_shared::identity::{EntityHandle, EntityKind, NetId};
use replica_shared::tracked::ReplicatedField;
use replica_shared::trainset::{KinematicState, MovementPart, RigidBodySnapshot, VehicleSink};

use crate::session::{ClientWorld, LocalProxy};

/// Builds the tracked fields for a freshly spawned entity.
pub type FieldFactory = Box<dyn FnMut(NetId, EntityKind, &str) -> Vec<Box<dyn ReplicatedField>> + Send>;

/// Last movement applied to one car.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CarMirror {
    pub tick: u32,
    pub kinematics: Option<KinematicState>,
    pub rigid_body: Option<RigidBodySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredEntity {
    pub handle: EntityHandle,
    pub game_id: String,
}

#[derive(Default)]
pub struct MirrorWorld {
    cars: BTreeMap<NetId, CarMirror>,
    entities: BTreeMap<NetId, MirroredEntity>,
    next_local: u64,
    fields: Option<FieldFactory>,
}

impl MirrorWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields(
        factory: impl FnMut(NetId, EntityKind, &str) -> Vec<Box<dyn ReplicatedField>> + Send + 'static,
    ) -> Self {
        Self {
            fields: Some(Box::new(factory)),
            ..Self::default()
        }
    }

    pub fn car(&self, car: NetId) -> Option<&CarMirror> {
        self.cars.get(&car)
    }

    pub fn entity(&self, id: NetId) -> Option<&MirroredEntity> {
        self.entities.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

impl VehicleSink for MirrorWorld {
    fn apply_movement(&mut self, car: NetId, part: &MovementPart, tick: u32) {
        let mirror = self.cars.entry(car).or_default();
        mirror.tick = tick;
        if let Some(k) = part.kinematics() {
            mirror.kinematics = Some(*k);
        }
        if let Some(rb) = part.rigid_body() {
            mirror.rigid_body = Some(*rb);
        }
    }
}

impl ClientWorld for MirrorWorld {
    fn spawn(&mut self, id: NetId, kind: EntityKind, game_id: &str) -> Option<LocalProxy> {
        self.next_local += 1;
        let handle = EntityHandle::new(kind, self.next_local);
        self.entities.insert(
            id,
            MirroredEntity {
                handle,
                game_id: game_id.to_string(),
            },
        );
        let fields = match self.fields.as_mut() {
            Some(factory) => factory(id, kind, game_id),
            None => Vec::new(),
        };
        Some(LocalProxy { handle, fields })
    }

    fn despawn(&mut self, id: NetId, _handle: EntityHandle) {
        self.entities.remove(&id);
        self.cars.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinematic_update_keeps_last_rigid_body() {
        let mut world = MirrorWorld::new();
        let rb = RigidBodySnapshot::default();
        let k = KinematicState {
            speed: 3.0,
            ..Default::default()
        };
        world.apply_movement(NetId(4), &MovementPart::RigidBody(rb), 10);
        world.apply_movement(NetId(4), &MovementPart::Kinematic(k), 11);

        let car = world.car(NetId(4)).unwrap();
        assert_eq!(car.tick, 11);
        assert_eq!(car.kinematics.unwrap().speed, 3.0);
        assert!(car.rigid_body.is_some());
    }

    #[test]
    fn spawn_hands_out_distinct_handles() {
        let mut world = MirrorWorld::new();
        let a = world.spawn(NetId(1), EntityKind::Car, "L-001").unwrap();
        let b = world.spawn(NetId(2), EntityKind::Car, "L-002").unwrap();
        assert_ne!(a.handle, b.handle);
        assert_eq!(world.entity(NetId(1)).unwrap().game_id, "L-001");

        world.despawn(NetId(1), a.handle);
        assert_eq!(world.entity_count(), 1);
    }
}
