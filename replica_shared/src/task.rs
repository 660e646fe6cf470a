//! Job task trees and their tagged, depth-first wire form.
//!
//! Every node is written as `tag: u8`, the common task fields, then the
//! variant payload. Composite nodes write `count: u8` and their children;
//! a sequential node then writes its cursor (`255` = none). Tags `0..=3` are
//! the built-in variants; anything else must be registered with a
//! [`TaskCodec`] before it can be sent or received.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
use crate::error::ProtocolError;
use crate::identity::NetId;
use crate::property::PropertyBag;

pub const TAG_WAREHOUSE: u8 = 0;
pub const TAG_TRANSPORT: u8 = 1;
pub const TAG_SEQUENTIAL: u8 = 2;
pub const TAG_PARALLEL: u8 = 3;

/// Wire value of a sequential task with no current sub-task.
pub const CURSOR_NONE: u8 = u8::MAX;

/// Deepest task nesting accepted from the wire.
pub const MAX_TASK_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    InProgress = 0,
    Done = 1,
    Failed = 2,
}

impl Encode for TaskState {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u8(*self as u8);
    }
}

impl Decode for TaskState {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            0 => Ok(TaskState::InProgress),
            1 => Ok(TaskState::Done),
            2 => Ok(TaskState::Failed),
            other => Err(DecodeError::UnknownVariant {
                kind: "task state",
                value: other,
            }),
        }
    }
}

/// Fields every task carries.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TaskCommon {
    pub state: TaskState,
    pub start_time: f32,
    pub finish_time: f32,
    pub is_last: bool,
    pub time_limit: f32,
}

impl Encode for TaskCommon {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.state);
        w.put_f32(self.start_time);
        w.put_f32(self.finish_time);
        w.put_bool(self.is_last);
        w.put_f32(self.time_limit);
    }
}

impl Decode for TaskCommon {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            state: r.get()?,
            start_time: r.get_f32()?,
            finish_time: r.get_f32()?,
            is_last: r.get_bool()?,
            time_limit: r.get_f32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarehouseKind {
    #[default]
    Loading = 0,
    Unloading = 1,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WarehouseTask {
    pub common: TaskCommon,
    pub cars: Vec<NetId>,
    pub kind: WarehouseKind,
    pub machine: String,
    pub cargo: i32,
    pub amount: f32,
    pub ready_for_machine: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransportTask {
    pub common: TaskCommon,
    pub cars: Vec<NetId>,
    pub starting_track: String,
    pub destination_track: String,
    pub cargo_per_car: Option<Vec<i32>>,
    pub coupling_required: bool,
    pub handbrake_required: bool,
}

/// A task variant contributed from outside the built-in set.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionTask {
    pub tag: u8,
    pub common: TaskCommon,
    pub fields: PropertyBag,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Warehouse(WarehouseTask),
    Transport(TransportTask),
    Sequential {
        common: TaskCommon,
        tasks: Vec<Task>,
        /// Index into `tasks`, rebuilt by position on the receiver.
        current: Option<usize>,
    },
    Parallel {
        common: TaskCommon,
        tasks: Vec<Task>,
    },
    Extension(ExtensionTask),
}

impl Task {
    pub fn tag(&self) -> u8 {
        match self {
            Task::Warehouse(_) => TAG_WAREHOUSE,
            Task::Transport(_) => TAG_TRANSPORT,
            Task::Sequential { .. } => TAG_SEQUENTIAL,
            Task::Parallel { .. } => TAG_PARALLEL,
            Task::Extension(e) => e.tag,
        }
    }

    pub fn common(&self) -> &TaskCommon {
        match self {
            Task::Warehouse(t) => &t.common,
            Task::Transport(t) => &t.common,
            Task::Sequential { common, .. } | Task::Parallel { common, .. } => common,
            Task::Extension(e) => &e.common,
        }
    }

    pub fn children(&self) -> &[Task] {
        match self {
            Task::Sequential { tasks, .. } | Task::Parallel { tasks, .. } => tasks,
            _ => &[],
        }
    }

    /// The sub-task a sequential task is on.
    pub fn current_task(&self) -> Option<&Task> {
        match self {
            Task::Sequential { tasks, current, .. } => current.and_then(|i| tasks.get(i)),
            _ => None,
        }
    }

    /// Nodes in this tree, including itself.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(Task::node_count).sum::<usize>()
    }
}

/// (De)serializer for one extension tag.
pub trait TaskCodec: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, task: &ExtensionTask, w: &mut PacketWriter) -> Result<(), ProtocolError>;
    fn decode(&self, r: &mut PacketReader<'_>) -> Result<PropertyBag, DecodeError>;
}

/// Codec that sends an extension task's fields as a tagged property bag.
#[derive(Debug, Clone)]
pub struct PropertyBagTaskCodec {
    name: String,
}

impl PropertyBagTaskCodec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TaskCodec for PropertyBagTaskCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, task: &ExtensionTask, w: &mut PacketWriter) -> Result<(), ProtocolError> {
        w.put(&task.fields);
        Ok(())
    }

    fn decode(&self, r: &mut PacketReader<'_>) -> Result<PropertyBag, DecodeError> {
        r.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterTaskError {
    #[error("task tag {0} is built in")]
    BuiltIn(u8),
    #[error("task tag {0} already registered")]
    Duplicate(u8),
}

/// Tag → codec table. Built-in variants are always present.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    extensions: HashMap<u8, Arc<dyn TaskCodec>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.extensions.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("TaskRegistry")
            .field("extension_tags", &tags)
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        tag: u8,
        codec: Arc<dyn TaskCodec>,
    ) -> Result<(), RegisterTaskError> {
        if tag <= TAG_PARALLEL {
            return Err(RegisterTaskError::BuiltIn(tag));
        }
        if self.extensions.contains_key(&tag) {
            return Err(RegisterTaskError::Duplicate(tag));
        }
        self.extensions.insert(tag, codec);
        Ok(())
    }

    pub fn is_registered(&self, tag: u8) -> bool {
        tag <= TAG_PARALLEL || self.extensions.contains_key(&tag)
    }

    pub fn write_task(&self, task: &Task, w: &mut PacketWriter) -> Result<(), ProtocolError> {
        self.write_node(task, w, 1)
    }

    fn write_node(&self, task: &Task, w: &mut PacketWriter, depth: usize) -> Result<(), ProtocolError> {
        if depth > MAX_TASK_DEPTH {
            return Err(ProtocolError::TooMany {
                what: "task nesting",
                count: depth,
                limit: MAX_TASK_DEPTH,
            });
        }
        w.put_u8(task.tag());
        w.put(task.common());
        match task {
            Task::Warehouse(t) => {
                w.put_array(&t.cars);
                w.put_u8(t.kind as u8);
                w.put_str(&t.machine);
                w.put_i32(t.cargo);
                w.put_f32(t.amount);
                w.put_bool(t.ready_for_machine);
            }
            Task::Transport(t) => {
                w.put_array(&t.cars);
                w.put_str(&t.starting_track);
                w.put_str(&t.destination_track);
                w.put(&t.cargo_per_car);
                w.put_bool(t.coupling_required);
                w.put_bool(t.handbrake_required);
            }
            Task::Sequential { tasks, current, .. } => {
                self.write_children(tasks, w, depth)?;
                let cursor = match current {
                    Some(i) if *i < tasks.len() => *i as u8,
                    _ => CURSOR_NONE,
                };
                w.put_u8(cursor);
            }
            Task::Parallel { tasks, .. } => self.write_children(tasks, w, depth)?,
            Task::Extension(e) => {
                let codec = self
                    .extensions
                    .get(&e.tag)
                    .ok_or(ProtocolError::UnregisteredTaskTag(e.tag))?;
                codec.encode(e, w)?;
            }
        }
        Ok(())
    }

    fn write_children(
        &self,
        tasks: &[Task],
        w: &mut PacketWriter,
        depth: usize,
    ) -> Result<(), ProtocolError> {
        // 255 is the cursor sentinel, so a composite holds at most 254.
        if tasks.len() >= CURSOR_NONE as usize {
            return Err(ProtocolError::TooMany {
                what: "sub-tasks",
                count: tasks.len(),
                limit: CURSOR_NONE as usize - 1,
            });
        }
        w.put_u8(tasks.len() as u8);
        for t in tasks {
            self.write_node(t, w, depth + 1)?;
        }
        Ok(())
    }

    pub fn read_task(&self, r: &mut PacketReader<'_>) -> Result<Task, DecodeError> {
        self.read_node(r, 1)
    }

    fn read_node(&self, r: &mut PacketReader<'_>, depth: usize) -> Result<Task, DecodeError> {
        if depth > MAX_TASK_DEPTH {
            return Err(DecodeError::invalid(
                "task tree",
                format!("nesting deeper than {MAX_TASK_DEPTH}"),
            ));
        }
        let tag = r.get_u8()?;
        let common: TaskCommon = r.get()?;
        Ok(match tag {
            TAG_WAREHOUSE => Task::Warehouse(WarehouseTask {
                common,
                cars: r.get_array()?,
                kind: match r.get_u8()? {
                    0 => WarehouseKind::Loading,
                    1 => WarehouseKind::Unloading,
                    other => {
                        return Err(DecodeError::UnknownVariant {
                            kind: "warehouse task kind",
                            value: other,
                        })
                    }
                },
                machine: r.get_str()?,
                cargo: r.get_i32()?,
                amount: r.get_f32()?,
                ready_for_machine: r.get_bool()?,
            }),
            TAG_TRANSPORT => Task::Transport(TransportTask {
                common,
                cars: r.get_array()?,
                starting_track: r.get_str()?,
                destination_track: r.get_str()?,
                cargo_per_car: r.get()?,
                coupling_required: r.get_bool()?,
                handbrake_required: r.get_bool()?,
            }),
            TAG_SEQUENTIAL => {
                let tasks = self.read_children(r, depth)?;
                let cursor = r.get_u8()?;
                let current = match cursor {
                    CURSOR_NONE => None,
                    i if (i as usize) < tasks.len() => Some(i as usize),
                    i => {
                        warn!(cursor = i, tasks = tasks.len(), "Sequential task cursor out of range");
                        None
                    }
                };
                Task::Sequential {
                    common,
                    tasks,
                    current,
                }
            }
            TAG_PARALLEL => Task::Parallel {
                common,
                tasks: self.read_children(r, depth)?,
            },
            other => {
                let codec = self.extensions.get(&other).ok_or(DecodeError::UnknownVariant {
                    kind: "task",
                    value: other,
                })?;
                Task::Extension(ExtensionTask {
                    tag: other,
                    common,
                    fields: codec.decode(r)?,
                })
            }
        })
    }

    fn read_children(&self, r: &mut PacketReader<'_>, depth: usize) -> Result<Vec<Task>, DecodeError> {
        let count = r.get_u8()? as usize;
        let mut tasks = Vec::with_capacity(count);
        for _ in 0..count {
            tasks.push(self.read_node(r, depth + 1)?);
        }
        Ok(tasks)
    }

    /// `count: u8` then each task.
    pub fn write_task_list(&self, tasks: &[Task], w: &mut PacketWriter) -> Result<(), ProtocolError> {
        if tasks.len() > u8::MAX as usize {
            return Err(ProtocolError::TooMany {
                what: "job tasks",
                count: tasks.len(),
                limit: u8::MAX as usize,
            });
        }
        w.put_u8(tasks.len() as u8);
        for t in tasks {
            self.write_task(t, w)?;
        }
        Ok(())
    }

    pub fn read_task_list(&self, r: &mut PacketReader<'_>) -> Result<Vec<Task>, DecodeError> {
        let count = r.get_u8()? as usize;
        let mut tasks = Vec::with_capacity(count);
        for _ in 0..count {
            tasks.push(self.read_task(r)?);
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropValue;

    fn warehouse(machine: &str) -> Task {
        Task::Warehouse(WarehouseTask {
            cars: vec![NetId(11), NetId(12)],
            machine: machine.to_string(),
            cargo: 7,
            amount: 40.0,
            ..Default::default()
        })
    }

    fn round_trip(registry: &TaskRegistry, task: &Task) -> Task {
        let mut w = PacketWriter::new();
        registry.write_task(task, &mut w).unwrap();
        let bytes = w.freeze();
        let mut r = PacketReader::new(&bytes);
        let back = registry.read_task(&mut r).unwrap();
        assert!(r.is_empty());
        back
    }

    #[test]
    fn sequential_cursor_survives_by_position() {
        let registry = TaskRegistry::new();
        let seq = Task::Sequential {
            common: TaskCommon::default(),
            tasks: vec![warehouse("WM-A"), warehouse("WM-B")],
            current: Some(1),
        };
        let back = round_trip(&registry, &seq);
        assert_eq!(back.children().len(), 2);
        assert_eq!(back.current_task(), Some(&warehouse("WM-B")));
        assert_eq!(back, seq);
    }

    #[test]
    fn cursor_none_is_sentinel() {
        let registry = TaskRegistry::new();
        let seq = Task::Sequential {
            common: TaskCommon::default(),
            tasks: vec![warehouse("WM-A")],
            current: None,
        };
        let mut w = PacketWriter::new();
        registry.write_task(&seq, &mut w).unwrap();
        assert_eq!(*w.as_slice().last().unwrap(), CURSOR_NONE);
        assert_eq!(round_trip(&registry, &seq).current_task(), None);
    }

    #[test]
    fn out_of_range_cursor_decodes_as_none() {
        let registry = TaskRegistry::new();
        let seq = Task::Sequential {
            common: TaskCommon::default(),
            tasks: vec![warehouse("WM-A")],
            current: Some(0),
        };
        let mut w = PacketWriter::new();
        registry.write_task(&seq, &mut w).unwrap();
        let mut bytes = w.as_slice().to_vec();
        *bytes.last_mut().unwrap() = 5;
        let back = registry.read_task(&mut PacketReader::new(&bytes)).unwrap();
        assert_eq!(back.current_task(), None);
    }

    #[test]
    fn nested_tree_keeps_shape() {
        let registry = TaskRegistry::new();
        let tree = Task::Parallel {
            common: TaskCommon {
                time_limit: 3600.0,
                ..Default::default()
            },
            tasks: vec![
                Task::Transport(TransportTask {
                    cars: vec![NetId(3)],
                    starting_track: "SM-A1".into(),
                    destination_track: "FF-B2".into(),
                    cargo_per_car: Some(vec![4]),
                    ..Default::default()
                }),
                Task::Sequential {
                    common: TaskCommon::default(),
                    tasks: vec![warehouse("WM-C")],
                    current: Some(0),
                },
            ],
        };
        let back = round_trip(&registry, &tree);
        assert_eq!(back, tree);
        assert_eq!(back.node_count(), 4);
    }

    #[test]
    fn unknown_tag_fails_the_payload() {
        let registry = TaskRegistry::new();
        let mut w = PacketWriter::new();
        w.put_u8(9);
        w.put(&TaskCommon::default());
        let bytes = w.freeze();
        assert!(matches!(
            registry.read_task(&mut PacketReader::new(&bytes)),
            Err(DecodeError::UnknownVariant { kind: "task", value: 9 })
        ));
    }

    #[test]
    fn registered_extension_round_trips() {
        let mut registry = TaskRegistry::new();
        registry
            .register(10, Arc::new(PropertyBagTaskCodec::new("passenger")))
            .unwrap();
        assert_eq!(
            registry.register(2, Arc::new(PropertyBagTaskCodec::new("x"))),
            Err(RegisterTaskError::BuiltIn(2))
        );
        let duplicate = registry
            .register(10, Arc::new(PropertyBagTaskCodec::new("again")))
            .unwrap_err();
        assert_eq!(duplicate, RegisterTaskError::Duplicate(10));
        assert_eq!(duplicate.to_string(), "task tag 10 already registered");

        let mut fields = PropertyBag::new();
        fields.insert("passengers", PropValue::UInt(40));
        let ext = Task::Extension(ExtensionTask {
            tag: 10,
            common: TaskCommon::default(),
            fields,
        });
        assert_eq!(round_trip(&registry, &ext), ext);

        let plain = TaskRegistry::new();
        let mut w = PacketWriter::new();
        assert_eq!(
            plain.write_task(&ext, &mut w),
            Err(ProtocolError::UnregisteredTaskTag(10))
        );
    }

    #[test]
    fn runaway_nesting_is_rejected() {
        let registry = TaskRegistry::new();
        let mut task = warehouse("deep");
        for _ in 0..MAX_TASK_DEPTH {
            task = Task::Parallel {
                common: TaskCommon::default(),
                tasks: vec![task],
            };
        }
        let mut w = PacketWriter::new();
        assert!(matches!(
            registry.write_task(&task, &mut w),
            Err(ProtocolError::TooMany { what: "task nesting", .. })
        ));
    }
}
