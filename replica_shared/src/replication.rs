//! Dirty-state replication engine.
//!
//! Holds the tracked fields of every replicated entity and decides, once per
//! tick, what goes out: a full snapshot (every field) when an entity's
//! resync counter reaches the threshold, otherwise a partial snapshot of
//! the dirty fields, otherwise nothing.
//!
//! Snapshot payload: `u8` field count, then `(u8 ordinal, value)` pairs.
//! Ordinals are registration order, identical on host and clients.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
use crate::error::ProtocolError;
use crate::identity::NetId;
use crate::tracked::ReplicatedField;

/// Which side is collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    /// Counts resync ticks and sends every field.
    Host,
    /// Sends only dirty, non-server-authoritative fields; never forces fulls.
    Client,
}

/// Who produced a snapshot being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Taken by the host on `tick`.
    Host { tick: u32 },
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    pub id: NetId,
    pub payload: Bytes,
}

impl Encode for EntitySnapshot {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.id);
        w.put_blob(&self.payload);
    }
}

impl Decode for EntitySnapshot {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: r.get()?,
            payload: Bytes::copy_from_slice(r.get_blob()?),
        })
    }
}

/// Snapshots of one kind (full or partial) taken on one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotBatch {
    pub tick: u32,
    pub snapshots: Vec<EntitySnapshot>,
}

impl SnapshotBatch {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl Encode for SnapshotBatch {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u32(self.tick);
        w.put_array(&self.snapshots);
    }
}

impl Decode for SnapshotBatch {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            tick: r.get_u32()?,
            snapshots: r.get_array()?,
        })
    }
}

/// Output of one [`ReplicationEngine::collect`].
#[derive(Debug, Default)]
pub struct ReplicationFrame {
    pub full: SnapshotBatch,
    pub delta: SnapshotBatch,
    included: Vec<(NetId, Vec<u8>)>,
}

impl ReplicationFrame {
    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.delta.is_empty()
    }
}

struct Entity {
    fields: Vec<Box<dyn ReplicatedField>>,
    /// Host tick of the newest value applied to each field.
    applied_ticks: Vec<Option<u32>>,
    ticks_since_full: u32,
    reported_dirty: bool,
}

pub struct ReplicationEngine {
    entities: BTreeMap<NetId, Entity>,
    full_sync_ticks: u32,
}

impl ReplicationEngine {
    /// `full_sync_ticks` is the resync interval divided by the tick duration.
    pub fn new(full_sync_ticks: u32) -> Self {
        Self {
            entities: BTreeMap::new(),
            full_sync_ticks: full_sync_ticks.max(1),
        }
    }

    pub fn full_sync_ticks(&self) -> u32 {
        self.full_sync_ticks
    }

    /// Adds a field to `entity`, creating the entity on first use. Returns the
    /// field's ordinal.
    pub fn register_field(
        &mut self,
        entity: NetId,
        field: Box<dyn ReplicatedField>,
    ) -> Result<u8, ProtocolError> {
        if !entity.is_assigned() {
            return Err(ProtocolError::UnknownIdentity(entity));
        }
        let e = self.entities.entry(entity).or_insert_with(|| Entity {
            fields: Vec::new(),
            applied_ticks: Vec::new(),
            ticks_since_full: 0,
            reported_dirty: false,
        });
        // The snapshot header counts fields in one byte.
        if e.fields.len() >= u8::MAX as usize {
            return Err(ProtocolError::TooMany {
                what: "tracked fields",
                count: e.fields.len() + 1,
                limit: u8::MAX as usize,
            });
        }
        e.fields.push(field);
        e.applied_ticks.push(None);
        Ok((e.fields.len() - 1) as u8)
    }

    /// Hint from the simulation that `entity` changed. Every field whose raw
    /// value differs from the last sent one goes out on the next collect,
    /// even below its threshold.
    pub fn report_dirty(&mut self, entity: NetId) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.reported_dirty = true;
        }
    }

    pub fn remove(&mut self, entity: NetId) -> bool {
        self.entities.remove(&entity).is_some()
    }

    pub fn contains(&self, entity: NetId) -> bool {
        self.entities.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ticks_since_full(&self, entity: NetId) -> Option<u32> {
        self.entities.get(&entity).map(|e| e.ticks_since_full)
    }

    /// Takes this tick's snapshots. Nothing is marked clean until
    /// [`ReplicationEngine::mark_sent`].
    pub fn collect(&mut self, tick: u32, mode: CollectMode) -> ReplicationFrame {
        let mut frame = ReplicationFrame {
            full: SnapshotBatch {
                tick,
                snapshots: Vec::new(),
            },
            delta: SnapshotBatch {
                tick,
                snapshots: Vec::new(),
            },
            included: Vec::new(),
        };

        for (&id, e) in self.entities.iter_mut() {
            let reported = std::mem::take(&mut e.reported_dirty);
            let full = match mode {
                CollectMode::Host => {
                    e.ticks_since_full = e.ticks_since_full.saturating_add(1);
                    e.ticks_since_full >= self.full_sync_ticks
                }
                CollectMode::Client => false,
            };

            let ordinals: Vec<u8> = e
                .fields
                .iter()
                .enumerate()
                .filter(|(_, f)| mode == CollectMode::Host || !f.is_server_authoritative())
                .filter(|(_, f)| full || f.is_dirty() || (reported && f.has_changed()))
                .map(|(i, _)| i as u8)
                .collect();

            if ordinals.is_empty() {
                continue;
            }
            if full {
                e.ticks_since_full = 0;
            }

            let mut w = PacketWriter::new();
            w.put_u8(ordinals.len() as u8);
            for &ord in &ordinals {
                w.put_u8(ord);
                e.fields[ord as usize].encode_current(&mut w);
            }
            let snapshot = EntitySnapshot {
                id,
                payload: w.freeze(),
            };
            trace!(entity = %id, full, fields = ordinals.len(), "Collected snapshot");
            if full {
                frame.full.snapshots.push(snapshot);
            } else {
                frame.delta.snapshots.push(snapshot);
            }
            frame.included.push((id, ordinals));
        }
        frame
    }

    /// Full snapshot of one entity outside the tick cycle, e.g. right after
    /// it spawned. Leaves dirty state and resync counters untouched.
    pub fn snapshot_entity(&self, entity: NetId) -> Option<EntitySnapshot> {
        let e = self.entities.get(&entity)?;
        if e.fields.is_empty() {
            return None;
        }
        let mut w = PacketWriter::new();
        w.put_u8(e.fields.len() as u8);
        for (ord, field) in e.fields.iter().enumerate() {
            w.put_u8(ord as u8);
            field.encode_current(&mut w);
        }
        Some(EntitySnapshot {
            id: entity,
            payload: w.freeze(),
        })
    }

    /// Snapshot of the given fields' current values.
    pub fn snapshot_fields(&self, entity: NetId, ordinals: &[u8]) -> Option<EntitySnapshot> {
        let e = self.entities.get(&entity)?;
        if ordinals.is_empty() || ordinals.len() > u8::MAX as usize {
            return None;
        }
        let mut w = PacketWriter::new();
        w.put_u8(ordinals.len() as u8);
        for &ord in ordinals {
            w.put_u8(ord);
            e.fields.get(ord as usize)?.encode_current(&mut w);
        }
        Some(EntitySnapshot {
            id: entity,
            payload: w.freeze(),
        })
    }

    /// Full snapshot of every entity for a late joiner.
    pub fn snapshot_all(&self, tick: u32) -> SnapshotBatch {
        SnapshotBatch {
            tick,
            snapshots: self
                .entities
                .keys()
                .filter_map(|&id| self.snapshot_entity(id))
                .collect(),
        }
    }

    /// Marks every field included in `frame` clean. Call after the frame has
    /// been handed to the channel layer.
    pub fn mark_sent(&mut self, frame: &ReplicationFrame) {
        for (id, ordinals) in &frame.included {
            // The entity may have been removed since collect.
            let Some(e) = self.entities.get_mut(id) else {
                continue;
            };
            for &ord in ordinals {
                if let Some(field) = e.fields.get_mut(ord as usize) {
                    field.mark_clean();
                }
            }
        }
    }

    /// Writes a received snapshot through the entity's setters. Returns the
    /// ordinals applied.
    ///
    /// A host applying a client snapshot skips server-authoritative fields.
    /// A client skips host values older than one already applied to the
    /// same field, so a late full snapshot cannot undo a newer partial one.
    pub fn apply_remote_snapshot(
        &mut self,
        entity: NetId,
        payload: &[u8],
        source: SnapshotSource,
    ) -> Result<Vec<u8>, ProtocolError> {
        let e = self
            .entities
            .get_mut(&entity)
            .ok_or(ProtocolError::UnknownIdentity(entity))?;
        let mut r = PacketReader::new(payload);
        let count = r.get_u8()?;
        let mut applied = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let ordinal = r.get_u8()?;
            let field = e
                .fields
                .get_mut(ordinal as usize)
                .ok_or(ProtocolError::UnknownField { entity, ordinal })?;
            let last_tick = &mut e.applied_ticks[ordinal as usize];
            match source {
                SnapshotSource::Client if field.is_server_authoritative() => {
                    debug!(entity = %entity, key = field.key(), "Ignored client write to host-owned field");
                    field.skip_encoded(&mut r)?;
                    continue;
                }
                SnapshotSource::Host { tick } if last_tick.is_some_and(|last| tick < last) => {
                    trace!(entity = %entity, key = field.key(), tick, "Skipped stale field value");
                    field.skip_encoded(&mut r)?;
                    continue;
                }
                SnapshotSource::Host { tick } => *last_tick = Some(tick),
                SnapshotSource::Client => {}
            }
            field.apply_encoded(&mut r)?;
            applied.push(ordinal);
        }
        if !r.is_empty() {
            return Err(DecodeError::invalid("snapshot", format!("{} trailing bytes", r.remaining())).into());
        }
        Ok(applied)
    }

    /// Debug dump of one entity's fields.
    pub fn describe(&self, entity: NetId) -> Vec<String> {
        self.entities
            .get(&entity)
            .map(|e| e.fields.iter().map(|f| f.describe()).collect())
            .unwrap_or_default()
    }
}
