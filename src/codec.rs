//! Deterministic binary serialization with a versioned type registry.
//!
//! Every container on the wire and in the database uses the same format:
//! big-endian integers, `u32` length prefixes on collections, `u16` length
//! prefixes on strings, no prefix on fixed-size arrays, and a leading `u16`
//! codec version. Polymorphic fields (outputs, inputs, credentials, unsigned
//! transactions) are preceded by a `u32` type ID assigned in registration
//! order, so the registry itself defines the wire numbering.
//!
//! Decoding consumes the exact byte slice: trailing bytes are an error, which
//! keeps `id = hash(bytes)` canonical — two encodings of the same value
//! cannot differ.

use std::collections::HashMap;

/// Current codec version, prepended to every marshalled container.
pub const CODEC_VERSION: u16 = 0;

/// Hard cap on any length prefix. Prevents a crafted prefix from driving a
/// multi-gigabyte allocation before the buffer length is consulted.
pub const MAX_LEN: u32 = 1 << 21;

/// Errors from the codec.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown type id {0}")]
    UnknownType(u32),
    #[error("type {0:?} is not registered")]
    UnregisteredType(&'static str),
    #[error("declared length {0} exceeds maximum {1}")]
    LengthOverflow(u32, u32),
    #[error("{0} trailing bytes after decode")]
    TrailingBytes(usize),
    #[error("codec version mismatch: got {got}, want {want}")]
    VersionMismatch { got: u16, want: u16 },
    #[error("unexpected end of buffer")]
    ShortBuffer,
    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Append-only encoder over big-endian primitives.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Start a container encoding: the codec version comes first.
    pub fn new() -> Self {
        let mut w = Writer { buf: Vec::new() };
        w.write_u16(CODEC_VERSION);
        w
    }

    /// Start an encoder without the version prefix, for nested fields that
    /// are framed by their container.
    pub fn bare() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Fixed-size field: no length prefix.
    pub fn write_fixed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Variable-size field: `u32` length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// String: `u16` length prefix over the UTF-8 bytes.
    pub fn write_str(&mut self, s: &str) {
        self.write_u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_id(&mut self, id: &crate::ids::Id) {
        self.write_fixed(id.as_bytes());
    }

    pub fn write_short_id(&mut self, id: &crate::ids::ShortId) {
        self.write_fixed(id.as_bytes());
    }

    /// Collection length prefix. Callers then write each element.
    pub fn write_len(&mut self, len: usize) {
        self.write_u32(len as u32);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Cursor-based decoder matching [`Writer`].
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start decoding a container: checks the version prefix.
    pub fn new(bytes: &'a [u8]) -> Result<Self, CodecError> {
        let mut r = Reader { buf: bytes, pos: 0 };
        let got = r.read_u16()?;
        if got != CODEC_VERSION {
            return Err(CodecError::VersionMismatch {
                got,
                want: CODEC_VERSION,
            });
        }
        Ok(r)
    }

    /// Decoder without a version prefix, for nested fields.
    pub fn bare(bytes: &'a [u8]) -> Self {
        Reader { buf: bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::ShortBuffer);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::Malformed("bool")),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_fixed(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_u32()?;
        if len > MAX_LEN {
            return Err(CodecError::LengthOverflow(len, MAX_LEN));
        }
        self.take(len as usize)
    }

    pub fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Malformed("utf-8 string"))
    }

    pub fn read_id(&mut self) -> Result<crate::ids::Id, CodecError> {
        let bytes = self.take(crate::ids::ID_LEN)?;
        Ok(crate::ids::Id(bytes.try_into().unwrap()))
    }

    pub fn read_short_id(&mut self) -> Result<crate::ids::ShortId, CodecError> {
        let bytes = self.take(crate::ids::SHORT_ID_LEN)?;
        Ok(crate::ids::ShortId(bytes.try_into().unwrap()))
    }

    /// Collection length prefix, bounds-checked against both [`MAX_LEN`] and
    /// the bytes actually remaining (an element is at least one byte).
    pub fn read_len(&mut self) -> Result<usize, CodecError> {
        let len = self.read_u32()?;
        if len > MAX_LEN {
            return Err(CodecError::LengthOverflow(len, MAX_LEN));
        }
        if len as usize > self.remaining() {
            return Err(CodecError::ShortBuffer);
        }
        Ok(len as usize)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Enforce that the whole input was consumed.
    pub fn done(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

type DecodeFn<T, C> = fn(&mut Reader<'_>, &C) -> Result<T, CodecError>;

/// A registry of polymorphic variants for one family of types.
///
/// `register` assigns the next `u32` type ID; both sides of the wire must
/// register the same constructors in the same order. Encoding looks the
/// type ID up by the variant's static name; decoding dispatches on the ID
/// read from the wire. `C` is a decode context threaded through to the
/// constructors so nested polymorphic fields can recurse into their own
/// registries.
pub struct Registry<T, C = ()> {
    decoders: Vec<DecodeFn<T, C>>,
    ids: HashMap<&'static str, u32>,
}

impl<T, C> Default for Registry<T, C> {
    fn default() -> Self {
        Registry {
            decoders: Vec::new(),
            ids: HashMap::new(),
        }
    }
}

impl<T, C> Registry<T, C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variant; returns its assigned type ID.
    pub fn register(&mut self, name: &'static str, decode: DecodeFn<T, C>) -> u32 {
        let id = self.decoders.len() as u32;
        self.decoders.push(decode);
        self.ids.insert(name, id);
        id
    }

    /// The type ID assigned to `name`.
    pub fn type_id(&self, name: &'static str) -> Result<u32, CodecError> {
        self.ids
            .get(name)
            .copied()
            .ok_or(CodecError::UnregisteredType(name))
    }

    /// Write the type ID for `name`, then let the caller append the body.
    pub fn write_tag(&self, w: &mut Writer, name: &'static str) -> Result<(), CodecError> {
        w.write_u32(self.type_id(name)?);
        Ok(())
    }

    /// Read a type ID and dispatch to the registered decoder.
    pub fn decode(&self, r: &mut Reader<'_>, ctx: &C) -> Result<T, CodecError> {
        let type_id = r.read_u32()?;
        let decode = self
            .decoders
            .get(type_id as usize)
            .ok_or(CodecError::UnknownType(type_id))?;
        decode(r, ctx)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Id;

    #[test]
    fn primitives_roundtrip() {
        let mut w = Writer::new();
        w.write_bool(true);
        w.write_u8(7);
        w.write_u16(513);
        w.write_u32(70_000);
        w.write_u64(1 << 40);
        w.write_bytes(b"varlen");
        w.write_str("a string");
        w.write_id(&Id([3u8; 32]));
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes).unwrap();
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u16().unwrap(), 513);
        assert_eq!(r.read_u32().unwrap(), 70_000);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_bytes().unwrap(), b"varlen");
        assert_eq!(r.read_str().unwrap(), "a string");
        assert_eq!(r.read_id().unwrap(), Id([3u8; 32]));
        r.done().unwrap();
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut w = Writer::bare();
        w.write_u16(CODEC_VERSION + 1);
        let bytes = w.into_bytes();
        assert_eq!(
            Reader::new(&bytes).unwrap_err(),
            CodecError::VersionMismatch {
                got: CODEC_VERSION + 1,
                want: CODEC_VERSION
            }
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut w = Writer::new();
        w.write_u8(1);
        let mut bytes = w.into_bytes();
        bytes.push(0xFF);

        let mut r = Reader::new(&bytes).unwrap();
        r.read_u8().unwrap();
        assert_eq!(r.done(), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn short_buffer_rejected() {
        let mut w = Writer::new();
        w.write_u16(300);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes).unwrap();
        assert_eq!(r.read_u64(), Err(CodecError::ShortBuffer));
    }

    #[test]
    fn length_overflow_rejected() {
        let mut w = Writer::new();
        w.write_u32(u32::MAX); // absurd collection length
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes).unwrap();
        assert_eq!(
            r.read_len(),
            Err(CodecError::LengthOverflow(u32::MAX, MAX_LEN))
        );
    }

    #[test]
    fn declared_len_beyond_buffer_rejected() {
        let mut w = Writer::new();
        w.write_u32(100); // claims 100 elements, buffer ends here
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes).unwrap();
        assert_eq!(r.read_len(), Err(CodecError::ShortBuffer));
    }

    #[derive(Debug, PartialEq)]
    enum Shape {
        Dot,
        Line(u64),
    }

    fn decode_dot(_r: &mut Reader<'_>, _ctx: &()) -> Result<Shape, CodecError> {
        Ok(Shape::Dot)
    }

    fn decode_line(r: &mut Reader<'_>, _ctx: &()) -> Result<Shape, CodecError> {
        Ok(Shape::Line(r.read_u64()?))
    }

    #[test]
    fn registry_assigns_ids_in_registration_order() {
        let mut reg = Registry::new();
        assert_eq!(reg.register("dot", decode_dot), 0);
        assert_eq!(reg.register("line", decode_line), 1);
        assert_eq!(reg.type_id("line").unwrap(), 1);
        assert_eq!(
            reg.type_id("arc"),
            Err(CodecError::UnregisteredType("arc"))
        );
    }

    #[test]
    fn registry_dispatch_roundtrip() {
        let mut reg = Registry::new();
        reg.register("dot", decode_dot);
        reg.register("line", decode_line);

        let mut w = Writer::new();
        reg.write_tag(&mut w, "line").unwrap();
        w.write_u64(99);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes).unwrap();
        assert_eq!(reg.decode(&mut r, &()).unwrap(), Shape::Line(99));
        r.done().unwrap();
    }

    #[test]
    fn registry_unknown_type_id_rejected() {
        let reg: Registry<Shape> = Registry::new();
        let mut w = Writer::new();
        w.write_u32(5);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes).unwrap();
        assert_eq!(reg.decode(&mut r, &()), Err(CodecError::UnknownType(5)));
    }
}
