//! Minimal host world for the standalone server and tests.
//!
//! Cars roll along their track at constant speed; nothing collides and
//! nothing derails on its own. The game proper plugs in its own
//! [`HostWorld`].

use std::collections::BTreeMap;

use replica_shared::identity::NetId;
use replica_shared::trainset::{TrainsetView, VehicleSource, VehicleState};

use crate::session::HostWorld;

#[derive(Debug, Default)]
pub struct SimWorld {
    cars: BTreeMap<NetId, VehicleState>,
    trainsets: BTreeMap<NetId, Vec<NetId>>,
    time: f32,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_car(&mut self, car: NetId, state: VehicleState) {
        self.cars.insert(car, state);
    }

    pub fn car(&self, car: NetId) -> Option<&VehicleState> {
        self.cars.get(&car)
    }

    pub fn car_mut(&mut self, car: NetId) -> Option<&mut VehicleState> {
        self.cars.get_mut(&car)
    }

    /// Removes the car from the world and from whichever trainset held it.
    pub fn remove_car(&mut self, car: NetId) -> Option<VehicleState> {
        for members in self.trainsets.values_mut() {
            members.retain(|m| *m != car);
        }
        self.trainsets.retain(|_, members| !members.is_empty());
        self.cars.remove(&car)
    }

    /// Sets `trainset`'s members in coupling order.
    pub fn couple(&mut self, trainset: NetId, members: Vec<NetId>) {
        self.trainsets.insert(trainset, members);
    }

    pub fn uncouple(&mut self, trainset: NetId) -> Option<Vec<NetId>> {
        self.trainsets.remove(&trainset)
    }

    pub fn time(&self) -> f32 {
        self.time
    }
}

impl VehicleSource for SimWorld {
    fn vehicle(&self, car: NetId) -> Option<VehicleState> {
        self.cars.get(&car).copied()
    }
}

impl HostWorld for SimWorld {
    fn trainsets(&self) -> Vec<TrainsetView> {
        self.trainsets
            .iter()
            .map(|(id, members)| TrainsetView {
                id: *id,
                members: members.iter().map(|m| Some(*m)).collect(),
            })
            .collect()
    }

    fn game_time(&self) -> f32 {
        self.time
    }

    /// Moves every car by `speed * dt` along its bogies' tracks.
    fn advance(&mut self, dt: f32) {
        self.time += dt;
        for car in self.cars.values_mut() {
            let speed = car.kinematics.speed;
            car.stationary = speed.abs() < f32::EPSILON;
            if car.stationary || car.derailed {
                continue;
            }
            for bogie in car.kinematics.bogies.iter_mut() {
                bogie.position_along_track += f64::from(speed * dt) * f64::from(bogie.direction);
            }
            car.rigid_body.position.x += speed * dt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_shared::trainset::{BogieState, KinematicState, RigidBodySnapshot};

    fn rolling(speed: f32) -> VehicleState {
        VehicleState {
            active: true,
            stationary: false,
            derailed: false,
            kinematics: KinematicState {
                speed,
                brake_stress: 0.0,
                bogies: [
                    BogieState {
                        track: Some(NetId(500)),
                        position_along_track: 10.0,
                        direction: 1,
                    },
                    BogieState {
                        track: Some(NetId(500)),
                        position_along_track: 4.0,
                        direction: -1,
                    },
                ],
            },
            rigid_body: RigidBodySnapshot::default(),
        }
    }

    #[test]
    fn advance_moves_rolling_cars() {
        let mut world = SimWorld::new();
        world.add_car(NetId(1), rolling(2.0));
        world.add_car(NetId(2), rolling(0.0));
        world.advance(0.5);

        let moving = world.car(NetId(1)).unwrap();
        assert_eq!(moving.kinematics.bogies[0].position_along_track, 11.0);
        assert_eq!(moving.kinematics.bogies[1].position_along_track, 3.0);
        assert!(world.car(NetId(2)).unwrap().stationary);
        assert_eq!(world.game_time(), 0.5);
    }

    #[test]
    fn removing_last_car_drops_trainset() {
        let mut world = SimWorld::new();
        world.add_car(NetId(1), rolling(1.0));
        world.couple(NetId(9), vec![NetId(1)]);
        assert_eq!(world.trainsets().len(), 1);
        world.remove_car(NetId(1));
        assert!(world.trainsets().is_empty());
    }
}
