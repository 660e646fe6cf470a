//! Tracked fields: a live value behind accessors plus the last value sent.

use std::fmt;

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};

type Getter<T> = Box<dyn Fn() -> T + Send>;
type Setter<T> = Box<dyn FnMut(T) + Send>;
type Comparer<T> = Box<dyn Fn(&T, &T) -> bool + Send>;

/// A value owned by the simulation, read and written through accessors.
///
/// Dirty means "differs from what was last sent" under the field's
/// comparer. The comparer answers "has it changed enough to send?" and
/// defaults to `!=`.
pub struct TrackedField<T> {
    key: String,
    getter: Getter<T>,
    setter: Setter<T>,
    last_sent: T,
    changed: Comparer<T>,
    server_authoritative: bool,
}

impl<T: Clone + PartialEq + 'static> TrackedField<T> {
    /// Starts clean: the current value counts as already sent.
    pub fn new(
        key: impl Into<String>,
        getter: impl Fn() -> T + Send + 'static,
        setter: impl FnMut(T) + Send + 'static,
    ) -> Self {
        let last_sent = getter();
        Self {
            key: key.into(),
            getter: Box::new(getter),
            setter: Box::new(setter),
            last_sent,
            changed: Box::new(|last: &T, current: &T| last != current),
            server_authoritative: false,
        }
    }

    /// Replaces the comparer, e.g. an epsilon for floats.
    pub fn with_threshold(mut self, changed: impl Fn(&T, &T) -> bool + Send + 'static) -> Self {
        self.changed = Box::new(changed);
        self
    }

    /// Clients never report this field; only the host writes it.
    pub fn server_authoritative(mut self) -> Self {
        self.server_authoritative = true;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn current(&self) -> T {
        (self.getter)()
    }

    pub fn last_sent(&self) -> &T {
        &self.last_sent
    }

    /// Writes through the setter. The value came from the authority, so it
    /// also becomes the last-sent value and does not read as dirty.
    pub fn set(&mut self, value: T) {
        self.last_sent = value.clone();
        (self.setter)(value);
    }

    pub fn is_dirty(&self) -> bool {
        (self.changed)(&self.last_sent, &self.current())
    }

    /// Raw inequality, ignoring any threshold.
    pub fn has_changed(&self) -> bool {
        self.last_sent != self.current()
    }

    pub fn mark_clean(&mut self) {
        self.last_sent = self.current();
    }
}

impl<T: fmt::Debug> fmt::Debug for TrackedField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedField")
            .field("key", &self.key)
            .field("last_sent", &self.last_sent)
            .field("server_authoritative", &self.server_authoritative)
            .finish_non_exhaustive()
    }
}

/// Type-erased view of a [`TrackedField`] for the replication engine.
pub trait ReplicatedField: Send {
    fn key(&self) -> &str;
    fn is_dirty(&self) -> bool;
    fn has_changed(&self) -> bool;
    fn mark_clean(&mut self);
    fn is_server_authoritative(&self) -> bool;
    fn encode_current(&self, w: &mut PacketWriter);
    /// Decodes a value and writes it through the setter.
    fn apply_encoded(&mut self, r: &mut PacketReader<'_>) -> Result<(), DecodeError>;
    /// Decodes a value and drops it.
    fn skip_encoded(&self, r: &mut PacketReader<'_>) -> Result<(), DecodeError>;
    fn describe(&self) -> String;
}

impl<T> ReplicatedField for TrackedField<T>
where
    T: Encode + Decode + Clone + PartialEq + fmt::Debug + Send + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn is_dirty(&self) -> bool {
        TrackedField::is_dirty(self)
    }

    fn has_changed(&self) -> bool {
        TrackedField::has_changed(self)
    }

    fn mark_clean(&mut self) {
        TrackedField::mark_clean(self)
    }

    fn is_server_authoritative(&self) -> bool {
        self.server_authoritative
    }

    fn encode_current(&self, w: &mut PacketWriter) {
        self.current().encode(w);
    }

    fn apply_encoded(&mut self, r: &mut PacketReader<'_>) -> Result<(), DecodeError> {
        let value = T::decode(r)?;
        self.set(value);
        Ok(())
    }

    fn skip_encoded(&self, r: &mut PacketReader<'_>) -> Result<(), DecodeError> {
        T::decode(r).map(drop)
    }

    fn describe(&self) -> String {
        format!("{}: {:?} -> {:?}", self.key, self.last_sent, self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn shared<T: Clone + PartialEq + Send + 'static>(
        key: &str,
        init: T,
    ) -> (Arc<Mutex<T>>, TrackedField<T>) {
        let cell = Arc::new(Mutex::new(init));
        let (r, w) = (cell.clone(), cell.clone());
        let field = TrackedField::new(
            key,
            move || r.lock().unwrap().clone(),
            move |v| *w.lock().unwrap() = v,
        );
        (cell, field)
    }

    #[test]
    fn dirty_until_marked_clean() {
        let (cell, mut field) = shared("wage", 100u32);
        assert!(!field.is_dirty());
        *cell.lock().unwrap() = 120;
        assert!(field.is_dirty());
        field.mark_clean();
        assert!(!field.is_dirty());
        assert_eq!(*field.last_sent(), 120);
    }

    #[test]
    fn set_does_not_read_as_dirty() {
        let (cell, mut field) = shared("state", 0u8);
        field.set(3);
        assert_eq!(*cell.lock().unwrap(), 3);
        assert!(!field.is_dirty());
    }

    #[test]
    fn threshold_comparer_suppresses_small_changes() {
        let (cell, field) = shared("speed", 10.0f32);
        let field = field.with_threshold(|a: &f32, b: &f32| (a - b).abs() > 0.5);
        *cell.lock().unwrap() = 10.2;
        assert!(!field.is_dirty());
        assert!(field.has_changed());
        *cell.lock().unwrap() = 11.0;
        assert!(field.is_dirty());
    }

    #[test]
    fn erased_field_applies_wire_values() {
        let (cell, field) = shared("brake", 0.0f32);
        let mut erased: Box<dyn ReplicatedField> = Box::new(field);
        let mut w = PacketWriter::new();
        w.put_f32(0.75);
        let bytes = w.freeze();
        erased.apply_encoded(&mut PacketReader::new(&bytes)).unwrap();
        assert_eq!(*cell.lock().unwrap(), 0.75);
        assert!(!erased.is_dirty());
    }
}
