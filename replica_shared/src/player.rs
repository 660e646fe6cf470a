//! Host-side player roster and per-player entity ownership.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info};
use uuid::Uuid;

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
use crate::identity::NetId;
use crate::math::Vec3;

/// Id the host uses for itself when it plays too.
pub const HOST_PLAYER_ID: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerTransform {
    /// Relative to `car` when standing on one, world space otherwise.
    pub position: Vec3,
    pub rotation_y: f32,
    pub car: Option<NetId>,
}

impl Encode for PlayerTransform {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.position);
        w.put_f32(self.rotation_y);
        w.put(&self.car.unwrap_or(NetId::UNASSIGNED));
    }
}

impl Decode for PlayerTransform {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let position = r.get()?;
        let rotation_y = r.get_f32()?;
        let car: NetId = r.get()?;
        Ok(Self {
            position,
            rotation_y,
            car: car.assigned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerPlayer {
    pub id: u8,
    /// Deduplicated display name.
    pub username: String,
    pub original_username: String,
    pub guid: Uuid,
    pub transform: PlayerTransform,
    pub ping_ms: u32,
    /// Set once the client finished loading the world.
    pub is_loaded: bool,
    owned: HashSet<NetId>,
}

impl ServerPlayer {
    pub fn owns(&self, id: NetId) -> bool {
        self.owned.contains(&id)
    }

    pub fn owned(&self) -> impl Iterator<Item = NetId> + '_ {
        self.owned.iter().copied()
    }
}

impl std::fmt::Display for ServerPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.id, self.username, self.guid)
    }
}

/// Connected players and who may write which entities.
#[derive(Debug, Default)]
pub struct PlayerRoster {
    players: BTreeMap<u8, ServerPlayer>,
    owners: HashMap<NetId, u8>,
}

impl PlayerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a player; a name already in use gets a ` (n)` suffix.
    pub fn add(&mut self, id: u8, username: &str, guid: Uuid) -> &ServerPlayer {
        let assigned_name = self.unique_name(username);
        if assigned_name != username {
            debug!(player = id, requested = %username, assigned = %assigned_name, "Renamed duplicate player");
        }
        info!(player = id, username = %assigned_name, "Player joined");
        self.players.insert(
            id,
            ServerPlayer {
                id,
                username: assigned_name,
                original_username: username.to_string(),
                guid,
                transform: PlayerTransform::default(),
                ping_ms: 0,
                is_loaded: false,
                owned: HashSet::new(),
            },
        );
        &self.players[&id]
    }

    fn unique_name(&self, wanted: &str) -> String {
        let taken = |name: &str| self.players.values().any(|p| p.username == name);
        if !taken(wanted) {
            return wanted.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{wanted} ({n})");
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Removes a player and releases everything they owned.
    pub fn remove(&mut self, id: u8) -> Option<ServerPlayer> {
        let player = self.players.remove(&id)?;
        for entity in &player.owned {
            self.owners.remove(entity);
        }
        info!(player = id, username = %player.username, "Player left");
        Some(player)
    }

    pub fn get(&self, id: u8) -> Option<&ServerPlayer> {
        self.players.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut ServerPlayer> {
        self.players.get_mut(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ServerPlayer> {
        self.players
            .values()
            .find(|p| p.username.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerPlayer> {
        self.players.values()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Gives `player` write access to `entity`, moving it from any previous
    /// owner. Returns the previous owner.
    pub fn take_ownership(&mut self, player: u8, entity: NetId) -> Option<u8> {
        if !self.players.contains_key(&player) {
            return None;
        }
        let previous = self.owners.insert(entity, player);
        if let Some(prev) = previous.filter(|p| *p != player) {
            if let Some(p) = self.players.get_mut(&prev) {
                p.owned.remove(&entity);
            }
        }
        if let Some(p) = self.players.get_mut(&player) {
            p.owned.insert(entity);
        }
        previous
    }

    pub fn release_ownership(&mut self, player: u8, entity: NetId) -> bool {
        if self.owners.get(&entity) != Some(&player) {
            return false;
        }
        self.owners.remove(&entity);
        if let Some(p) = self.players.get_mut(&player) {
            p.owned.remove(&entity);
        }
        true
    }

    pub fn owner_of(&self, entity: NetId) -> Option<u8> {
        self.owners.get(&entity).copied()
    }

    /// The host may always write; otherwise only the owner.
    pub fn may_write(&self, player: u8, entity: NetId) -> bool {
        player == HOST_PLAYER_ID || self.owner_of(entity) == Some(player)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_get_suffixes() {
        let mut roster = PlayerRoster::new();
        roster.add(1, "Ada", Uuid::nil());
        assert_eq!(roster.add(2, "Ada", Uuid::nil()).username, "Ada (1)");
        assert_eq!(roster.add(3, "Ada", Uuid::nil()).username, "Ada (2)");
        assert_eq!(roster.get(3).unwrap().original_username, "Ada");
        roster.remove(2);
        assert_eq!(roster.add(4, "Ada", Uuid::nil()).username, "Ada (1)");
    }

    #[test]
    fn ownership_moves_and_releases() {
        let mut roster = PlayerRoster::new();
        roster.add(1, "Ada", Uuid::nil());
        roster.add(2, "Bo", Uuid::nil());
        let car = NetId(40);

        assert_eq!(roster.take_ownership(1, car), None);
        assert!(roster.may_write(1, car));
        assert!(!roster.may_write(2, car));
        assert!(roster.may_write(HOST_PLAYER_ID, car));

        assert_eq!(roster.take_ownership(2, car), Some(1));
        assert!(!roster.get(1).unwrap().owns(car));
        assert!(!roster.release_ownership(1, car));
        assert!(roster.release_ownership(2, car));
        assert_eq!(roster.owner_of(car), None);
    }

    #[test]
    fn leaving_releases_owned_entities() {
        let mut roster = PlayerRoster::new();
        roster.add(1, "Ada", Uuid::nil());
        roster.take_ownership(1, NetId(5));
        roster.take_ownership(1, NetId(6));
        let gone = roster.remove(1).unwrap();
        assert_eq!(gone.owned().count(), 2);
        assert_eq!(roster.owner_of(NetId(5)), None);
    }
}
