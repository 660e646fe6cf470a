//! Network identities and the per-session identity registry.
//!
//! The host mints identities; clients mirror whatever the host announces.
//! Identities are never reused within a session, so a packet still in
//! flight for a destroyed entity can only miss, never hit a newcomer.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};

/// Small integer naming one replicated entity for one session.
///
/// `0` means "unassigned" and never resolves.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct NetId(pub u16);

impl NetId {
    pub const UNASSIGNED: NetId = NetId(0);

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }

    /// `None` for the unassigned id.
    pub fn assigned(self) -> Option<NetId> {
        self.is_assigned().then_some(self)
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Encode for NetId {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u16(self.0);
    }
}

impl Decode for NetId {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(NetId(r.get_u16()?))
    }
}

/// What kind of game object an identity names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Car = 0,
    Job = 1,
    Item = 2,
    Station = 3,
    Track = 4,
    Junction = 5,
    Trainset = 6,
}

impl EntityKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EntityKind::Car),
            1 => Some(EntityKind::Job),
            2 => Some(EntityKind::Item),
            3 => Some(EntityKind::Station),
            4 => Some(EntityKind::Track),
            5 => Some(EntityKind::Junction),
            6 => Some(EntityKind::Trainset),
            _ => None,
        }
    }
}

impl Encode for EntityKind {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u8(*self as u8);
    }
}

impl Decode for EntityKind {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let v = r.get_u8()?;
        EntityKind::from_u8(v).ok_or(DecodeError::UnknownVariant {
            kind: "entity kind",
            value: v,
        })
    }
}

/// Opaque handle into the local simulation, supplied by the game layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle {
    pub kind: EntityKind,
    pub local: u64,
}

impl EntityHandle {
    pub const fn new(kind: EntityKind, local: u64) -> Self {
        Self { kind, local }
    }
}

/// Whether this registry mints identities or mirrors a remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Host,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("network identity space exhausted")]
    Exhausted,
    #[error("only the host may allocate network identities")]
    NotAuthority,
    #[error("network identity 0 is reserved")]
    Reserved,
    #[error("{0} is already bound to another handle")]
    AlreadyBound(NetId),
}

/// Bidirectional `NetId ↔ handle` map plus a game-id side table.
///
/// Owned by one session; dropping the session drops every binding.
#[derive(Debug)]
pub struct IdentityRegistry<H> {
    authority: Authority,
    /// Next identity to mint. Goes past `u16::MAX` once exhausted.
    next: u32,
    by_id: HashMap<NetId, H>,
    by_handle: HashMap<H, NetId>,
    by_game_id: HashMap<String, NetId>,
    game_id_of: HashMap<NetId, String>,
}

impl<H: Clone + Eq + Hash> IdentityRegistry<H> {
    fn with_authority(authority: Authority) -> Self {
        Self {
            authority,
            next: 1,
            by_id: HashMap::new(),
            by_handle: HashMap::new(),
            by_game_id: HashMap::new(),
            game_id_of: HashMap::new(),
        }
    }

    /// Registry for the session host.
    pub fn host() -> Self {
        Self::with_authority(Authority::Host)
    }

    /// Registry for a client mirroring the host.
    pub fn mirror() -> Self {
        Self::with_authority(Authority::Mirror)
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    /// Mints a fresh identity. Never returns `0`, never repeats.
    pub fn allocate(&mut self) -> Result<NetId, RegistryError> {
        if self.authority != Authority::Host {
            return Err(RegistryError::NotAuthority);
        }
        if self.next > u16::MAX as u32 {
            return Err(RegistryError::Exhausted);
        }
        let id = NetId(self.next as u16);
        self.next += 1;
        Ok(id)
    }

    /// Binds `handle` to `id`, replacing any previous handle for the same id
    /// only if it is the same handle.
    pub fn register(&mut self, id: NetId, handle: H) -> Result<(), RegistryError> {
        if !id.is_assigned() {
            return Err(RegistryError::Reserved);
        }
        if let Some(existing) = self.by_id.get(&id) {
            if *existing != handle {
                return Err(RegistryError::AlreadyBound(id));
            }
            return Ok(());
        }
        // A handle moving to a new identity drops its old binding.
        if let Some(old) = self.by_handle.insert(handle.clone(), id) {
            self.by_id.remove(&old);
        }
        self.by_id.insert(id, handle);
        // Ids announced from elsewhere (e.g. restored state) must never be
        // minted again.
        self.next = self.next.max(id.0 as u32 + 1);
        Ok(())
    }

    /// Unbinds `id`. Unknown ids are ignored.
    pub fn unregister(&mut self, id: NetId) -> Option<H> {
        if let Some(game_id) = self.game_id_of.remove(&id) {
            self.by_game_id.remove(&game_id);
        }
        let handle = self.by_id.remove(&id)?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    /// Total lookup: unknown and unassigned ids yield `None`.
    pub fn resolve(&self, id: NetId) -> Option<&H> {
        if !id.is_assigned() {
            return None;
        }
        self.by_id.get(&id)
    }

    pub fn id_of(&self, handle: &H) -> Option<NetId> {
        self.by_handle.get(handle).copied()
    }

    /// Correlates a stable game-side id with a network identity. May happen
    /// before or after a handle is registered.
    pub fn bind_game_id(&mut self, game_id: impl Into<String>, id: NetId) {
        if !id.is_assigned() {
            return;
        }
        let game_id = game_id.into();
        if let Some(previous) = self.game_id_of.insert(id, game_id.clone()) {
            self.by_game_id.remove(&previous);
        }
        self.by_game_id.insert(game_id, id);
    }

    pub fn resolve_game_id(&self, game_id: &str) -> Option<NetId> {
        self.by_game_id.get(game_id).copied()
    }

    pub fn game_id_of(&self, id: NetId) -> Option<&str> {
        self.game_id_of.get(&id).map(String::as_str)
    }

    pub fn contains(&self, id: NetId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetId, &H)> {
        self.by_id.iter().map(|(id, h)| (*id, h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn car(n: u64) -> EntityHandle {
        EntityHandle::new(EntityKind::Car, n)
    }

    #[test]
    fn zero_never_resolves() {
        let mut reg = IdentityRegistry::host();
        assert_eq!(reg.register(NetId(0), car(1)), Err(RegistryError::Reserved));
        assert!(reg.resolve(NetId::UNASSIGNED).is_none());
    }

    #[test]
    fn mirror_cannot_allocate() {
        let mut reg = IdentityRegistry::<EntityHandle>::mirror();
        assert_eq!(reg.allocate(), Err(RegistryError::NotAuthority));
        reg.register(NetId(7), car(7)).unwrap();
        assert_eq!(reg.resolve(NetId(7)), Some(&car(7)));
    }

    #[test]
    fn unregister_then_resolve_misses() {
        let mut reg = IdentityRegistry::host();
        let id = reg.allocate().unwrap();
        reg.register(id, car(1)).unwrap();
        reg.bind_game_id("L-001", id);
        assert_eq!(reg.unregister(id), Some(car(1)));
        assert!(reg.resolve(id).is_none());
        assert!(reg.id_of(&car(1)).is_none());
        assert!(reg.resolve_game_id("L-001").is_none());
        // Unregistering again is harmless.
        assert_eq!(reg.unregister(id), None);
    }

    #[test]
    fn ids_are_not_reused_after_unregister() {
        let mut reg = IdentityRegistry::host();
        let a = reg.allocate().unwrap();
        reg.register(a, car(1)).unwrap();
        reg.unregister(a);
        let b = reg.allocate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn registering_a_restored_id_advances_the_allocator() {
        let mut reg = IdentityRegistry::host();
        reg.register(NetId(40), car(40)).unwrap();
        assert_eq!(reg.allocate().unwrap(), NetId(41));
    }

    #[test]
    fn conflicting_handle_is_rejected() {
        let mut reg = IdentityRegistry::host();
        reg.register(NetId(3), car(1)).unwrap();
        assert_eq!(
            reg.register(NetId(3), car(2)),
            Err(RegistryError::AlreadyBound(NetId(3)))
        );
        // Same pair is idempotent.
        assert!(reg.register(NetId(3), car(1)).is_ok());
    }

    #[test]
    fn game_id_can_be_bound_before_handle() {
        let mut reg = IdentityRegistry::<EntityHandle>::mirror();
        reg.bind_game_id("FF-042", NetId(12));
        assert_eq!(reg.resolve_game_id("FF-042"), Some(NetId(12)));
        assert!(reg.resolve(NetId(12)).is_none());
        reg.register(NetId(12), car(99)).unwrap();
        assert_eq!(reg.game_id_of(NetId(12)), Some("FF-042"));
    }

    #[test]
    fn allocation_exhausts_instead_of_wrapping() {
        let mut reg = IdentityRegistry::<EntityHandle>::host();
        for _ in 0..u16::MAX {
            reg.allocate().unwrap();
        }
        assert_eq!(reg.allocate(), Err(RegistryError::Exhausted));
    }

    proptest! {
        #[test]
        fn allocate_is_unique_and_nonzero(ops in proptest::collection::vec(any::<bool>(), 1..512)) {
            let mut reg = IdentityRegistry::host();
            let mut seen = HashSet::new();
            let mut live = Vec::new();
            for (n, allocate) in ops.into_iter().enumerate() {
                if allocate || live.is_empty() {
                    let id = reg.allocate().unwrap();
                    prop_assert!(id.is_assigned());
                    prop_assert!(seen.insert(id));
                    reg.register(id, car(n as u64)).unwrap();
                    live.push(id);
                } else {
                    let id = live.swap_remove(n % live.len());
                    reg.unregister(id);
                }
            }
        }
    }
}
