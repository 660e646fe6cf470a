//! World item replication: per-item updates, batched and optionally
//! compressed, applied to a local item table.

use std::collections::HashMap;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
use crate::compression;
use crate::error::ProtocolError;
use crate::identity::NetId;
use crate::math::{Quat, Vec3};
use crate::property::PropertyBag;

bitflags! {
    /// Which optional sections follow an item id on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ItemUpdateFlags: u8 {
        const CREATE = 1;
        const DESTROY = 2;
        const POSITION_CHANGED = 4;
        const DROPPED = 8;
        const EQUIPPED = 16;
        const OBJECT_STATE_CHANGED = 32;
    }
}

/// Batches with more entries than this are compressed.
pub const DEFAULT_COMPRESS_AFTER: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdate {
    pub item: NetId,
    pub flags: ItemUpdateFlags,
    /// `CREATE`
    pub prefab: String,
    /// `POSITION_CHANGED` or `DROPPED`
    pub position: Vec3,
    pub rotation: Quat,
    /// `DROPPED`
    pub throw_direction: Vec3,
    /// `EQUIPPED`: player holding the item, and whether it is in hand or
    /// stowed.
    pub holder: u8,
    pub in_hand: bool,
    /// `CREATE` or `OBJECT_STATE_CHANGED`
    pub state: PropertyBag,
}

impl ItemUpdate {
    fn empty(item: NetId, flags: ItemUpdateFlags) -> Self {
        Self {
            item,
            flags,
            prefab: String::new(),
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            throw_direction: Vec3::ZERO,
            holder: 0,
            in_hand: false,
            state: PropertyBag::new(),
        }
    }

    pub fn create(item: NetId, prefab: impl Into<String>, position: Vec3, rotation: Quat) -> Self {
        let mut u = Self::empty(
            item,
            ItemUpdateFlags::CREATE | ItemUpdateFlags::POSITION_CHANGED,
        );
        u.prefab = prefab.into();
        u.position = position;
        u.rotation = rotation;
        u
    }

    pub fn destroy(item: NetId) -> Self {
        Self::empty(item, ItemUpdateFlags::DESTROY)
    }

    /// An update with no sections yet; add them with the builder methods.
    pub fn change(item: NetId) -> Self {
        Self::empty(item, ItemUpdateFlags::empty())
    }

    pub fn moved(mut self, position: Vec3, rotation: Quat) -> Self {
        self.flags |= ItemUpdateFlags::POSITION_CHANGED;
        self.position = position;
        self.rotation = rotation;
        self
    }

    pub fn dropped(mut self, position: Vec3, rotation: Quat, throw_direction: Vec3) -> Self {
        self.flags |= ItemUpdateFlags::DROPPED;
        self.flags.remove(ItemUpdateFlags::EQUIPPED);
        self.position = position;
        self.rotation = rotation;
        self.throw_direction = throw_direction;
        self
    }

    pub fn equipped(mut self, holder: u8, in_hand: bool) -> Self {
        self.flags |= ItemUpdateFlags::EQUIPPED;
        self.flags.remove(ItemUpdateFlags::DROPPED);
        self.holder = holder;
        self.in_hand = in_hand;
        self
    }

    pub fn with_state(mut self, state: PropertyBag) -> Self {
        self.flags |= ItemUpdateFlags::OBJECT_STATE_CHANGED;
        self.state = state;
        self
    }

    pub fn is_destroy(&self) -> bool {
        self.flags.contains(ItemUpdateFlags::DESTROY)
    }

    fn has_transform(&self) -> bool {
        self.flags
            .intersects(ItemUpdateFlags::POSITION_CHANGED | ItemUpdateFlags::DROPPED)
    }

    fn has_state(&self) -> bool {
        self.flags
            .intersects(ItemUpdateFlags::CREATE | ItemUpdateFlags::OBJECT_STATE_CHANGED)
    }

    /// Folds a later update for the same item into this one. Sections the
    /// later update carries win; a destroy replaces everything.
    pub fn merge(&mut self, later: ItemUpdate) {
        if later.is_destroy() {
            *self = later;
            return;
        }
        if self.is_destroy() {
            // Item was destroyed then recreated under the same id; only the
            // host can do that and it never reuses ids, so keep the latest.
            *self = later;
            return;
        }
        if later.flags.contains(ItemUpdateFlags::CREATE) {
            self.prefab = later.prefab.clone();
        }
        if later.has_transform() {
            self.position = later.position;
            self.rotation = later.rotation;
        }
        if later.flags.contains(ItemUpdateFlags::DROPPED) {
            self.throw_direction = later.throw_direction;
            self.flags.remove(ItemUpdateFlags::EQUIPPED);
        }
        if later.flags.contains(ItemUpdateFlags::EQUIPPED) {
            self.holder = later.holder;
            self.in_hand = later.in_hand;
            self.flags.remove(ItemUpdateFlags::DROPPED);
        }
        if later.flags.contains(ItemUpdateFlags::OBJECT_STATE_CHANGED) {
            self.state.merge(later.state);
        }
        self.flags |= later.flags;
    }
}

impl Encode for ItemUpdate {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u8(self.flags.bits());
        w.put(&self.item);
        if self.is_destroy() {
            return;
        }
        if self.flags.contains(ItemUpdateFlags::CREATE) {
            w.put_str(&self.prefab);
        }
        if self.has_transform() {
            w.put(&self.position);
            w.put(&self.rotation);
        }
        if self.flags.contains(ItemUpdateFlags::DROPPED) {
            w.put(&self.throw_direction);
        }
        if self.flags.contains(ItemUpdateFlags::EQUIPPED) {
            w.put_u8(self.holder);
            w.put_bool(self.in_hand);
        }
        if self.has_state() {
            w.put(&self.state);
        }
    }
}

impl Decode for ItemUpdate {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let bits = r.get_u8()?;
        let flags = ItemUpdateFlags::from_bits(bits).ok_or(DecodeError::UnknownVariant {
            kind: "item update flags",
            value: bits,
        })?;
        let item: NetId = r.get()?;
        let mut u = ItemUpdate::empty(item, flags);
        if u.is_destroy() {
            return Ok(u);
        }
        if flags.contains(ItemUpdateFlags::CREATE) {
            u.prefab = r.get_str()?;
        }
        if u.has_transform() {
            u.position = r.get()?;
            u.rotation = r.get()?;
        }
        if flags.contains(ItemUpdateFlags::DROPPED) {
            u.throw_direction = r.get()?;
        }
        if flags.contains(ItemUpdateFlags::EQUIPPED) {
            u.holder = r.get_u8()?;
            u.in_hand = r.get_bool()?;
        }
        if u.has_state() {
            u.state = r.get()?;
        }
        Ok(u)
    }
}

/// Writes `compressed: bool`, `count: u32`, then the items either inline or
/// as one gzip blob.
pub fn write_item_batch(
    w: &mut PacketWriter,
    items: &[ItemUpdate],
    compress_after: usize,
) -> Result<(), ProtocolError> {
    let count = u32::try_from(items.len()).map_err(|_| ProtocolError::TooMany {
        what: "item batch",
        count: items.len(),
        limit: u32::MAX as usize,
    })?;
    let compressed = items.len() > compress_after;
    w.put_bool(compressed);
    w.put_u32(count);
    if compressed {
        let mut inner = PacketWriter::new();
        for item in items {
            item.encode(&mut inner);
        }
        inner.check_limits()?;
        let packed = compression::compress(inner.as_slice())?;
        debug!(
            items = items.len(),
            raw = inner.len(),
            packed = packed.len(),
            "Compressed item batch"
        );
        w.put_blob(&packed);
    } else {
        for item in items {
            item.encode(w);
        }
    }
    Ok(())
}

pub fn read_item_batch(r: &mut PacketReader<'_>) -> Result<Vec<ItemUpdate>, DecodeError> {
    let compressed = r.get_bool()?;
    let count = r.get_u32()? as usize;
    if compressed {
        let inflated = compression::decompress(r.get_blob()?)?;
        let mut inner = PacketReader::new(&inflated);
        let items = read_items(&mut inner, count)?;
        if !inner.is_empty() {
            return Err(DecodeError::invalid(
                "item batch",
                format!("{} trailing bytes after {count} items", inner.remaining()),
            ));
        }
        Ok(items)
    } else {
        read_items(r, count)
    }
}

fn read_items(r: &mut PacketReader<'_>, count: usize) -> Result<Vec<ItemUpdate>, DecodeError> {
    // A destroy is the smallest entry at three bytes.
    let mut out = Vec::with_capacity(count.min(r.remaining() / 3));
    for _ in 0..count {
        out.push(ItemUpdate::decode(r)?);
    }
    Ok(out)
}

/// Local view of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub prefab: String,
    pub position: Vec3,
    pub rotation: Quat,
    pub holder: Option<(u8, bool)>,
    pub state: PropertyBag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Created,
    Updated,
    Destroyed,
    /// Destroy for an item already gone; a no-op.
    AlreadyGone,
    /// Update (not create) for an item never seen; dropped.
    UnknownItem,
}

/// Items known to this peer, keyed by identity.
#[derive(Debug, Default)]
pub struct ItemStore {
    items: HashMap<NetId, ItemRecord>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: &ItemUpdate) -> ItemOutcome {
        if update.is_destroy() {
            return match self.items.remove(&update.item) {
                Some(_) => ItemOutcome::Destroyed,
                None => ItemOutcome::AlreadyGone,
            };
        }
        let outcome = if update.flags.contains(ItemUpdateFlags::CREATE) {
            match self.items.get_mut(&update.item) {
                // A repeated create refreshes the record; holder and state
                // carry over unless the update itself changes them.
                Some(existing) => {
                    existing.prefab.clone_from(&update.prefab);
                    existing.position = update.position;
                    existing.rotation = update.rotation;
                    ItemOutcome::Updated
                }
                None => {
                    self.items.insert(
                        update.item,
                        ItemRecord {
                            prefab: update.prefab.clone(),
                            position: update.position,
                            rotation: update.rotation,
                            holder: None,
                            state: PropertyBag::new(),
                        },
                    );
                    ItemOutcome::Created
                }
            }
        } else if self.items.contains_key(&update.item) {
            ItemOutcome::Updated
        } else {
            warn!(item = %update.item, "Item update before creation");
            return ItemOutcome::UnknownItem;
        };

        let Some(record) = self.items.get_mut(&update.item) else {
            return ItemOutcome::UnknownItem;
        };
        if update.has_transform() {
            record.position = update.position;
            record.rotation = update.rotation;
        }
        if update.flags.contains(ItemUpdateFlags::DROPPED) {
            record.holder = None;
        }
        if update.flags.contains(ItemUpdateFlags::EQUIPPED) {
            record.holder = Some((update.holder, update.in_hand));
        }
        if update.has_state() {
            record.state.merge(update.state.clone());
        }
        outcome
    }

    pub fn get(&self, item: NetId) -> Option<&ItemRecord> {
        self.items.get(&item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Full-state updates for every known item, for a late joiner.
    pub fn snapshot(&self) -> Vec<ItemUpdate> {
        let mut ids: Vec<_> = self.items.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| {
                let rec = self.items.get(&id)?;
                let mut u = ItemUpdate::create(id, rec.prefab.clone(), rec.position, rec.rotation);
                if let Some((holder, in_hand)) = rec.holder {
                    u = u.equipped(holder, in_hand);
                }
                u.state = rec.state.clone();
                Some(u)
            })
            .collect()
    }
}

/// Outgoing item updates, one merged entry per item, in first-queued order.
#[derive(Debug, Default)]
pub struct ItemReplicator {
    pending: Vec<ItemUpdate>,
    index: HashMap<NetId, usize>,
}

impl ItemReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, update: ItemUpdate) {
        match self.index.get(&update.item) {
            Some(&i) => self.pending[i].merge(update),
            None => {
                self.index.insert(update.item, self.pending.len());
                self.pending.push(update);
            }
        }
    }

    pub fn drain(&mut self) -> Vec<ItemUpdate> {
        self.index.clear();
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
