//! Tagged property values for item object state and extension tasks.

use std::collections::BTreeMap;
use std::fmt;

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};

/// One value in a [`PropertyBag`]. Each carries an explicit tag on the wire:
/// `0` bool, `1` int, `2` uint, `3` float, `4` string.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Int(i32),
    UInt(u32),
    Float(f32),
    Str(String),
}

impl PropValue {
    pub fn tag(&self) -> u8 {
        match self {
            PropValue::Bool(_) => 0,
            PropValue::Int(_) => 1,
            PropValue::UInt(_) => 2,
            PropValue::Float(_) => 3,
            PropValue::Str(_) => 4,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            PropValue::Float(v) => Some(*v),
            PropValue::Int(v) => Some(*v as f32),
            PropValue::UInt(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::UInt(v) => write!(f, "{v}u"),
            PropValue::Float(v) => write!(f, "{v}f"),
            PropValue::Str(v) => write!(f, "{v:?}"),
        }
    }
}

impl Encode for PropValue {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u8(self.tag());
        match self {
            PropValue::Bool(v) => w.put_bool(*v),
            PropValue::Int(v) => w.put_i32(*v),
            PropValue::UInt(v) => w.put_u32(*v),
            PropValue::Float(v) => w.put_f32(*v),
            PropValue::Str(v) => w.put_str(v),
        }
    }
}

impl Decode for PropValue {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(match r.get_u8()? {
            0 => PropValue::Bool(r.get_bool()?),
            1 => PropValue::Int(r.get_i32()?),
            2 => PropValue::UInt(r.get_u32()?),
            3 => PropValue::Float(r.get_f32()?),
            4 => PropValue::Str(r.get_str()?),
            other => {
                return Err(DecodeError::UnknownVariant {
                    kind: "property value",
                    value: other,
                })
            }
        })
    }
}

/// String-keyed property map. Ordered so the same bag always encodes to the
/// same bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag(pub BTreeMap<String, PropValue>);

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: PropValue) -> Option<PropValue> {
        self.0.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrites entries present in `other`, keeps the rest.
    pub fn merge(&mut self, other: PropertyBag) {
        self.0.extend(other.0);
    }
}

impl FromIterator<(String, PropValue)> for PropertyBag {
    fn from_iter<I: IntoIterator<Item = (String, PropValue)>>(iter: I) -> Self {
        PropertyBag(iter.into_iter().collect())
    }
}

impl Encode for PropertyBag {
    fn encode(&self, w: &mut PacketWriter) {
        let count = self.0.len().min(u16::MAX as usize);
        w.put_u16(count as u16);
        for (key, value) in self.0.iter().take(count) {
            w.put_str(key);
            value.encode(w);
        }
    }
}

impl Decode for PropertyBag {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let count = r.get_u16()?;
        let mut bag = BTreeMap::new();
        for _ in 0..count {
            let key = r.get_str()?;
            let value = PropValue::decode(r)?;
            bag.insert(key, value);
        }
        Ok(PropertyBag(bag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{from_bytes, to_bytes};

    #[test]
    fn every_value_kind_keeps_its_tag() {
        let bag: PropertyBag = [
            ("lit".to_string(), PropValue::Bool(true)),
            ("fuel".to_string(), PropValue::Float(0.25)),
            ("charges".to_string(), PropValue::Int(-3)),
            ("serial".to_string(), PropValue::UInt(4_000_000_000)),
            ("label".to_string(), PropValue::Str("Brake".into())),
        ]
        .into_iter()
        .collect();
        let back: PropertyBag = from_bytes(&to_bytes(&bag)).unwrap();
        assert_eq!(back, bag);
        assert_eq!(back.get("serial").map(PropValue::tag), Some(2));
    }

    #[test]
    fn unknown_value_tag_is_rejected() {
        // One entry, key "k", tag 7.
        let bytes = [1, 0, 1, 0, b'k', 7, 0];
        assert!(matches!(
            from_bytes::<PropertyBag>(&bytes),
            Err(DecodeError::UnknownVariant { value: 7, .. })
        ));
    }
}
