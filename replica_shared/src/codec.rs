//! Binary wire codec.
//!
//! Numerics are fixed-width little-endian. Strings and arrays carry a `u16`
//! length prefix, opaque blobs a `u32` one. Nothing is self-describing: a
//! reader consumes fields in exactly the order the writer produced them, and
//! the only tags on the wire are the flag/variant bytes the message types add
//! themselves.
//!
//! Reading past the end of a packet is a [`DecodeError`], never a panic; the
//! caller drops the packet and carries on.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::ProtocolError;

/// Failure to decode a packet. The packet is dropped; the connection is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of packet: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("unknown {kind} discriminator {value}")]
    UnknownVariant { kind: &'static str, value: u8 },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("decompression failed: {0}")]
    Decompress(String),
}

impl DecodeError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Types with a fixed wire representation.
pub trait Encode {
    fn encode(&self, w: &mut PacketWriter);
}

/// Types that can be read back from their [`Encode`] representation.
pub trait Decode: Sized {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError>;
}

/// Growable output buffer for one packet.
///
/// Strings and arrays longer than their `u16` prefix allows are cut, and the
/// first such cut is remembered; [`PacketWriter::check_limits`] turns it
/// into an error before the packet is sent.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buf: BytesMut,
    overflow: Option<(&'static str, usize)>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            overflow: None,
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    /// Writes a `u16` length-prefixed UTF-8 string.
    ///
    /// Strings longer than `u16::MAX` bytes are cut at the last char boundary
    /// that fits, and the writer records the overflow.
    pub fn put_str(&mut self, s: &str) {
        if s.len() > u16::MAX as usize {
            self.note_overflow("string bytes", s.len());
        }
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.put_u16_le(end as u16);
        self.buf.put_slice(&s.as_bytes()[..end]);
    }

    /// Writes a `u32` length-prefixed blob.
    pub fn put_blob(&mut self, bytes: &[u8]) {
        self.buf.put_u32_le(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    /// Appends bytes with no prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn put<T: Encode + ?Sized>(&mut self, value: &T) {
        value.encode(self);
    }

    /// Writes a `u16` element count followed by each element.
    ///
    /// Elements past `u16::MAX` are not written; the writer records the
    /// overflow.
    pub fn put_array<T: Encode>(&mut self, items: &[T]) {
        if items.len() > u16::MAX as usize {
            self.note_overflow("array elements", items.len());
        }
        let count = items.len().min(u16::MAX as usize);
        self.buf.put_u16_le(count as u16);
        for item in &items[..count] {
            item.encode(self);
        }
    }

    fn note_overflow(&mut self, what: &'static str, count: usize) {
        self.overflow.get_or_insert((what, count));
    }

    /// Fails if anything written so far was cut to fit its length prefix.
    pub fn check_limits(&self) -> Result<(), ProtocolError> {
        match self.overflow {
            Some((what, count)) => Err(ProtocolError::TooMany {
                what,
                count,
                limit: u16::MAX as usize,
            }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over one received packet.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::UnexpectedEof {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_i8(&mut self) -> Result<i8, DecodeError> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn get_u16(&mut self) -> Result<u16, DecodeError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_u64(&mut self) -> Result<u64, DecodeError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_i32(&mut self) -> Result<i32, DecodeError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn get_f32(&mut self) -> Result<f32, DecodeError> {
        self.ensure(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn get_f64(&mut self) -> Result<f64, DecodeError> {
        self.ensure(8)?;
        Ok(self.buf.get_f64_le())
    }

    pub fn get_bool(&mut self) -> Result<bool, DecodeError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::UnknownVariant {
                kind: "bool",
                value: other,
            }),
        }
    }

    pub fn get_str(&mut self) -> Result<String, DecodeError> {
        let len = self.get_u16()? as usize;
        let bytes = self.get_slice(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Reads a `u32` length-prefixed blob without copying.
    pub fn get_blob(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.get_u32()? as usize;
        self.get_slice(len)
    }

    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn get<T: Decode>(&mut self) -> Result<T, DecodeError> {
        T::decode(self)
    }

    pub fn get_array<T: Decode>(&mut self) -> Result<Vec<T>, DecodeError> {
        let count = self.get_u16()? as usize;
        // Every element takes at least one byte; don't trust the count for
        // the allocation.
        let mut out = Vec::with_capacity(count.min(self.buf.remaining()));
        for _ in 0..count {
            out.push(T::decode(self)?);
        }
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes and returns everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

macro_rules! impl_codec_primitive {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, w: &mut PacketWriter) {
                    w.$put(*self);
                }
            }

            impl Decode for $ty {
                fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
                    r.$get()
                }
            }
        )*
    };
}

impl_codec_primitive! {
    u8 => put_u8, get_u8;
    i8 => put_i8, get_i8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
    i32 => put_i32, get_i32;
    f32 => put_f32, get_f32;
    f64 => put_f64, get_f64;
    bool => put_bool, get_bool;
}

impl Encode for str {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_str(self);
    }
}

impl Encode for String {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_str(self);
    }
}

impl Decode for String {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        r.get_str()
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_array(self);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        r.get_array()
    }
}

/// `Option<T>` is a presence bool followed by the value.
impl<T: Encode> Encode for Option<T> {
    fn encode(&self, w: &mut PacketWriter) {
        match self {
            Some(v) => {
                w.put_bool(true);
                v.encode(w);
            }
            None => w.put_bool(false),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        if r.get_bool()? {
            Ok(Some(T::decode(r)?))
        } else {
            Ok(None)
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_raw(self);
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(r.get_slice(N)?);
        Ok(out)
    }
}

/// Encodes a single value into a fresh buffer.
pub fn to_bytes<T: Encode + ?Sized>(value: &T) -> Bytes {
    let mut w = PacketWriter::new();
    value.encode(&mut w);
    w.freeze()
}

/// Decodes a single value, requiring the whole buffer to be consumed.
pub fn from_bytes<T: Decode>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut r = PacketReader::new(bytes);
    let value = T::decode(&mut r)?;
    if !r.is_empty() {
        return Err(DecodeError::invalid(
            "packet",
            format!("{} trailing bytes", r.remaining()),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_little_endian_fixed_width() {
        let mut w = PacketWriter::new();
        w.put_u16(0x0102);
        w.put_i32(-2);
        w.put_bool(true);
        assert_eq!(w.as_slice(), &[0x02, 0x01, 0xFE, 0xFF, 0xFF, 0xFF, 0x01]);
    }

    #[test]
    fn strings_and_arrays_are_length_prefixed() {
        let mut w = PacketWriter::new();
        w.put_str("ab");
        w.put_array(&[7u16, 9u16]);
        assert_eq!(w.as_slice(), &[2, 0, b'a', b'b', 2, 0, 7, 0, 9, 0]);

        let bytes = w.freeze();
        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.get_str().unwrap(), "ab");
        assert_eq!(r.get_array::<u16>().unwrap(), vec![7, 9]);
        assert!(r.is_empty());
    }

    #[test]
    fn reading_past_end_is_an_error_not_a_panic() {
        let mut r = PacketReader::new(&[1, 0]);
        assert_eq!(
            r.get_u32(),
            Err(DecodeError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn truncated_string_is_rejected() {
        // Claims 10 bytes, carries 3.
        let mut r = PacketReader::new(&[10, 0, b'a', b'b', b'c']);
        assert!(matches!(r.get_str(), Err(DecodeError::UnexpectedEof { .. })));
    }

    #[test]
    fn huge_array_count_does_not_overallocate() {
        let mut r = PacketReader::new(&[0xFF, 0xFF, 1]);
        assert!(r.get_array::<u32>().is_err());
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let mut r = PacketReader::new(&[2]);
        assert!(matches!(
            r.get_bool(),
            Err(DecodeError::UnknownVariant { kind: "bool", value: 2 })
        ));
    }

    #[test]
    fn long_string_is_cut_on_char_boundary() {
        let s = "é".repeat(40_000); // 80_000 bytes
        let mut w = PacketWriter::new();
        w.put_str(&s);
        assert!(w.check_limits().is_err());
        let bytes = w.freeze();
        let back = PacketReader::new(&bytes).get_str().unwrap();
        assert!(back.len() <= u16::MAX as usize);
        assert!(back.chars().all(|c| c == 'é'));
    }

    #[test]
    fn oversized_fields_are_reported() {
        let mut w = PacketWriter::new();
        w.put_str("short");
        w.put_array(&[1u8, 2, 3]);
        assert!(w.check_limits().is_ok());

        w.put_str(&"x".repeat(70_000));
        w.put_array(&vec![0u8; 70_000]);
        assert_eq!(
            w.check_limits(),
            Err(ProtocolError::TooMany {
                what: "string bytes",
                count: 70_000,
                limit: u16::MAX as usize,
            })
        );
    }

    #[test]
    fn from_bytes_rejects_trailing_data() {
        assert!(from_bytes::<u8>(&[1, 2]).is_err());
        assert_eq!(from_bytes::<Option<u16>>(&[1, 5, 0]).unwrap(), Some(5));
    }
}
