//! Trainset physics synchronisation.
//!
//! The host evaluates every trainset once per tick and emits one movement
//! aggregate per set that needs it, one part per member in trainset order.
//! Clients match aggregates to the member list they were last told about.

use std::collections::{HashMap, HashSet};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
use crate::error::ProtocolError;
use crate::identity::NetId;
use crate::math::{Quat, Vec3};

bitflags! {
    /// Which movement sections follow. Only `1`, `2` and `3` are valid.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MovementTag: u8 {
        const KINEMATIC = 1;
        const RIGID_BODY = 2;
    }
}

/// Where one bogie sits on the track graph.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BogieState {
    /// `None` while the bogie is off the rails.
    pub track: Option<NetId>,
    pub position_along_track: f64,
    /// `1` or `-1` relative to the track's direction.
    pub direction: i8,
}

impl Encode for BogieState {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.track.unwrap_or(NetId::UNASSIGNED));
        w.put_f64(self.position_along_track);
        w.put_i8(self.direction);
    }
}

impl Decode for BogieState {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let track: NetId = r.get()?;
        Ok(Self {
            track: track.assigned(),
            position_along_track: r.get_f64()?,
            direction: r.get_i8()?,
        })
    }
}

/// Bogie-level motion of one car.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KinematicState {
    pub speed: f32,
    pub brake_stress: f32,
    pub bogies: [BogieState; 2],
}

impl Encode for KinematicState {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_f32(self.speed);
        w.put_f32(self.brake_stress);
        w.put(&self.bogies[0]);
        w.put(&self.bogies[1]);
    }
}

impl Decode for KinematicState {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            speed: r.get_f32()?,
            brake_stress: r.get_f32()?,
            bogies: [r.get()?, r.get()?],
        })
    }
}

/// Full rigid-body state of one car.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RigidBodySnapshot {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl Encode for RigidBodySnapshot {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.position);
        w.put(&self.rotation);
        w.put(&self.velocity);
        w.put(&self.angular_velocity);
    }
}

impl Decode for RigidBodySnapshot {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            position: r.get()?,
            rotation: r.get()?,
            velocity: r.get()?,
            angular_velocity: r.get()?,
        })
    }
}

/// One member's representation in an aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MovementPart {
    Kinematic(KinematicState),
    RigidBody(RigidBodySnapshot),
    Both(KinematicState, RigidBodySnapshot),
}

impl MovementPart {
    pub fn tag(&self) -> MovementTag {
        match self {
            MovementPart::Kinematic(_) => MovementTag::KINEMATIC,
            MovementPart::RigidBody(_) => MovementTag::RIGID_BODY,
            MovementPart::Both(..) => MovementTag::KINEMATIC | MovementTag::RIGID_BODY,
        }
    }

    pub fn rigid_body(&self) -> Option<&RigidBodySnapshot> {
        match self {
            MovementPart::RigidBody(rb) | MovementPart::Both(_, rb) => Some(rb),
            MovementPart::Kinematic(_) => None,
        }
    }

    pub fn kinematics(&self) -> Option<&KinematicState> {
        match self {
            MovementPart::Kinematic(k) | MovementPart::Both(k, _) => Some(k),
            MovementPart::RigidBody(_) => None,
        }
    }
}

impl Encode for MovementPart {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u8(self.tag().bits());
        match self {
            MovementPart::Kinematic(k) => w.put(k),
            MovementPart::RigidBody(rb) => w.put(rb),
            MovementPart::Both(k, rb) => {
                w.put(k);
                w.put(rb);
            }
        }
    }
}

impl Decode for MovementPart {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let bits = r.get_u8()?;
        let tag = MovementTag::from_bits(bits)
            .filter(|t| !t.is_empty())
            .ok_or(DecodeError::UnknownVariant {
                kind: "movement tag",
                value: bits,
            })?;
        if tag == MovementTag::RIGID_BODY {
            return Ok(MovementPart::RigidBody(r.get()?));
        }
        let kinematics: KinematicState = r.get()?;
        if tag.contains(MovementTag::RIGID_BODY) {
            Ok(MovementPart::Both(kinematics, r.get()?))
        } else {
            Ok(MovementPart::Kinematic(kinematics))
        }
    }
}

/// Movement aggregate for one trainset on one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainsetPhysics {
    pub tick: u32,
    pub trainset: NetId,
    pub parts: Vec<MovementPart>,
}

impl Encode for TrainsetPhysics {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u32(self.tick);
        w.put(&self.trainset);
        w.put_array(&self.parts);
    }
}

impl Decode for TrainsetPhysics {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            tick: r.get_u32()?,
            trainset: r.get()?,
            parts: r.get_array()?,
        })
    }
}

/// Ordered member list of a trainset, as aggregates will index it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainsetDescribe {
    pub trainset: NetId,
    pub members: Vec<NetId>,
}

impl Encode for TrainsetDescribe {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.trainset);
        w.put_array(&self.members);
    }
}

impl Decode for TrainsetDescribe {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            trainset: r.get()?,
            members: r.get_array()?,
        })
    }
}

/// What the host simulation reports about one car.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleState {
    /// Inactive cars (being loaded or torn down) abort their trainset's update.
    pub active: bool,
    pub stationary: bool,
    pub derailed: bool,
    pub kinematics: KinematicState,
    pub rigid_body: RigidBodySnapshot,
}

/// Host-side read access to the vehicle simulation.
pub trait VehicleSource {
    /// `None` if the car no longer exists.
    fn vehicle(&self, car: NetId) -> Option<VehicleState>;
}

/// Client-side write access to the vehicle simulation.
pub trait VehicleSink {
    fn apply_movement(&mut self, car: NetId, part: &MovementPart, tick: u32);
}

/// A trainset as the host simulation sees it this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainsetView {
    pub id: NetId,
    /// In coupling order. `None` marks a car without a network identity.
    pub members: Vec<Option<NetId>>,
}

/// Messages the watcher wants sent for one trainset.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainsetOutput {
    /// Membership changed since last described; send reliably, first.
    pub describe: Option<TrainsetDescribe>,
    pub physics: TrainsetPhysics,
    /// A threshold-triggered full snapshot is included, so the whole
    /// aggregate goes reliable.
    pub reliable: bool,
}

/// Why a trainset produced nothing this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainsetSkip {
    /// Nothing moving and every counter under the threshold.
    Settled,
    /// A member is missing, inactive or has no identity.
    InvalidMember { position: usize },
}

/// Host-side per-tick evaluator.
#[derive(Debug)]
pub struct TrainsetWatcher {
    full_sync_ticks: u32,
    ticks_since_full: HashMap<NetId, u32>,
    described: HashMap<NetId, Vec<NetId>>,
}

impl TrainsetWatcher {
    pub fn new(full_sync_ticks: u32) -> Self {
        Self {
            full_sync_ticks: full_sync_ticks.max(1),
            ticks_since_full: HashMap::new(),
            described: HashMap::new(),
        }
    }

    /// Evaluates every trainset and forgets state for sets and cars that
    /// are gone.
    pub fn tick(
        &mut self,
        tick: u32,
        sets: &[TrainsetView],
        source: &dyn VehicleSource,
    ) -> Vec<TrainsetOutput> {
        let mut out = Vec::new();
        for set in sets {
            match self.tick_set(tick, set, source) {
                Ok(output) => out.push(output),
                Err(TrainsetSkip::Settled) => {}
                Err(TrainsetSkip::InvalidMember { position }) => {
                    warn!(trainset = %set.id, position, "Abandoned trainset update: invalid member");
                }
            }
        }

        let live_sets: HashSet<NetId> = sets.iter().map(|s| s.id).collect();
        let live_cars: HashSet<NetId> = sets
            .iter()
            .flat_map(|s| s.members.iter().flatten().copied())
            .collect();
        self.described.retain(|id, _| live_sets.contains(id));
        self.ticks_since_full.retain(|id, _| live_cars.contains(id));
        out
    }

    pub fn tick_set(
        &mut self,
        tick: u32,
        set: &TrainsetView,
        source: &dyn VehicleSource,
    ) -> Result<TrainsetOutput, TrainsetSkip> {
        // Validate every member before touching any counter.
        let mut members = Vec::with_capacity(set.members.len());
        for (position, member) in set.members.iter().enumerate() {
            let state = member
                .and_then(|id| source.vehicle(id).map(|state| (id, state)))
                .filter(|(_, state)| state.active)
                .ok_or(TrainsetSkip::InvalidMember { position })?;
            members.push(state);
        }
        if !set.id.is_assigned() || members.is_empty() {
            return Err(TrainsetSkip::InvalidMember { position: 0 });
        }

        let mut any_moving = false;
        let mut max_ticks_reached = false;
        for (id, state) in &members {
            let counter = self.ticks_since_full.entry(*id).or_insert(0);
            *counter = counter.saturating_add(1);
            if any_moving && max_ticks_reached {
                continue;
            }
            any_moving |= !state.stationary;
            max_ticks_reached |= *counter >= self.full_sync_ticks;
        }
        if !any_moving && !max_ticks_reached {
            return Err(TrainsetSkip::Settled);
        }

        let mut reliable = false;
        let mut parts = Vec::with_capacity(members.len());
        for (id, state) in &members {
            if state.derailed {
                parts.push(MovementPart::RigidBody(state.rigid_body));
                continue;
            }
            let counter = self.ticks_since_full.entry(*id).or_insert(0);
            if *counter >= self.full_sync_ticks {
                *counter = 0;
                reliable = true;
                parts.push(MovementPart::Both(state.kinematics, state.rigid_body));
            } else {
                parts.push(MovementPart::Kinematic(state.kinematics));
            }
        }

        let ids: Vec<NetId> = members.iter().map(|(id, _)| *id).collect();
        let describe = if self.described.get(&set.id) != Some(&ids) {
            self.described.insert(set.id, ids.clone());
            Some(TrainsetDescribe {
                trainset: set.id,
                members: ids,
            })
        } else {
            None
        };

        Ok(TrainsetOutput {
            describe,
            physics: TrainsetPhysics {
                tick,
                trainset: set.id,
                parts,
            },
            reliable,
        })
    }

    /// Current membership descriptions, for a late joiner.
    pub fn descriptions(&self) -> Vec<TrainsetDescribe> {
        let mut out: Vec<_> = self
            .described
            .iter()
            .map(|(id, members)| TrainsetDescribe {
                trainset: *id,
                members: members.clone(),
            })
            .collect();
        out.sort_by_key(|d| d.trainset);
        out
    }

    pub fn ticks_since_full(&self, car: NetId) -> Option<u32> {
        self.ticks_since_full.get(&car).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainsetApply {
    Applied(usize),
    /// A reliable aggregate older than one already applied: only its
    /// rigid-body sections were written.
    RigidBodiesOnly(usize),
    /// Older than an aggregate already applied for this set.
    Stale,
}

#[derive(Debug)]
struct KnownSet {
    members: Vec<NetId>,
    last_tick: Option<u32>,
}

/// Client-side matcher for incoming aggregates.
#[derive(Debug, Default)]
pub struct TrainsetReceiver {
    sets: HashMap<NetId, KnownSet>,
}

impl TrainsetReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_describe(&mut self, describe: TrainsetDescribe) {
        debug!(trainset = %describe.trainset, members = describe.members.len(), "Trainset described");
        let last_tick = self.sets.get(&describe.trainset).and_then(|s| s.last_tick);
        self.sets.insert(
            describe.trainset,
            KnownSet {
                members: describe.members,
                last_tick,
            },
        );
    }

    pub fn forget(&mut self, trainset: NetId) {
        self.sets.remove(&trainset);
    }

    pub fn members(&self, trainset: NetId) -> Option<&[NetId]> {
        self.sets.get(&trainset).map(|s| s.members.as_slice())
    }

    /// Applies a sequenced aggregate. Anything older than the newest applied
    /// aggregate is dropped.
    pub fn apply(
        &mut self,
        update: &TrainsetPhysics,
        sink: &mut dyn VehicleSink,
    ) -> Result<TrainsetApply, ProtocolError> {
        self.apply_inner(update, false, sink)
    }

    /// Applies a reliable aggregate. A late one still writes its rigid-body
    /// sections; its kinematics are older than what the cars already have.
    pub fn apply_reliable(
        &mut self,
        update: &TrainsetPhysics,
        sink: &mut dyn VehicleSink,
    ) -> Result<TrainsetApply, ProtocolError> {
        self.apply_inner(update, true, sink)
    }

    fn apply_inner(
        &mut self,
        update: &TrainsetPhysics,
        reliable: bool,
        sink: &mut dyn VehicleSink,
    ) -> Result<TrainsetApply, ProtocolError> {
        let set = self
            .sets
            .get_mut(&update.trainset)
            .ok_or(ProtocolError::UnknownIdentity(update.trainset))?;
        if set.members.len() != update.parts.len() {
            return Err(ProtocolError::LengthMismatch {
                target: update.trainset,
                expected: set.members.len(),
                got: update.parts.len(),
            });
        }
        if set.last_tick.is_some_and(|last| update.tick < last) {
            if !reliable {
                return Ok(TrainsetApply::Stale);
            }
            let mut written = 0;
            for (car, part) in set.members.iter().zip(&update.parts) {
                let body = match part {
                    MovementPart::Kinematic(_) => continue,
                    MovementPart::RigidBody(body) | MovementPart::Both(_, body) => *body,
                };
                sink.apply_movement(*car, &MovementPart::RigidBody(body), update.tick);
                written += 1;
            }
            return Ok(if written == 0 {
                TrainsetApply::Stale
            } else {
                TrainsetApply::RigidBodiesOnly(written)
            });
        }
        set.last_tick = Some(update.tick);
        for (car, part) in set.members.iter().zip(&update.parts) {
            sink.apply_movement(*car, part, update.tick);
        }
        Ok(TrainsetApply::Applied(update.parts.len()))
    }
}
