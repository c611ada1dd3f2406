//! Big-endian binary framing primitives.
//!
//! Every integer on the wire is big-endian. Strings and byte arrays carry a
//! `u32` length prefix, UUIDs are 16 raw bytes and header sets are a `u16`
//! count followed by `(u16 code, bytes)` pairs.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Headers
// ============================================================================

/// Protocol header set attached to most messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(SmallVec<[(u16, Bytes); 4]>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header. Codes may repeat; `get` returns the first.
    pub fn insert(&mut self, code: u16, value: impl Into<Bytes>) {
        self.0.push((code, value.into()));
    }

    pub fn get(&self, code: u16) -> Option<&Bytes> {
        self.0.iter().find(|(c, _)| *c == code).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Bytes)> {
        self.0.iter().map(|(c, v)| (*c, v))
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Cursor over one message body or one length-delimited block.
#[derive(Debug, Clone)]
pub struct PacketReader {
    buf: Bytes,
}

impl PacketReader {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(Error::EndOfStream {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        self.ensure(16)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    /// Take exactly `len` raw bytes.
    pub fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// `u32` length-prefixed byte array.
    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        self.read_exact(len)
    }

    /// `u32` length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::Protocol(format!("Invalid UTF-8 in string: {}", e)))
    }

    pub fn read_headers(&mut self) -> Result<Headers> {
        let count = self.read_u16()?;
        let mut headers = Headers::new();
        for _ in 0..count {
            let code = self.read_u16()?;
            let value = self.read_bytes()?;
            headers.insert(code, value);
        }
        Ok(headers)
    }

    /// Split off a reader bounded to the next `len` bytes. Reads on the
    /// returned reader cannot run past the declared length.
    pub fn sub_reader(&mut self, len: usize) -> Result<PacketReader> {
        Ok(PacketReader::new(self.read_exact(len)?))
    }

    /// Pre-allocation for `count` items read from the wire, bounded by how
    /// many items of at least `min_item_size` bytes the buffer can still hold.
    #[inline]
    pub fn capacity_for(&self, count: usize, min_item_size: usize) -> usize {
        count.min(self.remaining() / min_item_size.max(1))
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.ensure(len)?;
        self.buf.advance(len);
        Ok(())
    }

    /// Consume whatever is left.
    pub fn read_rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Growable big-endian output buffer.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    pub fn write_uuid(&mut self, id: &Uuid) {
        self.buf.put_slice(id.as_bytes());
    }

    /// Raw bytes, no prefix.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// `u32` length-prefixed byte array.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    pub fn write_headers(&mut self, headers: &Headers) {
        self.buf.put_u16(headers.len() as u16);
        for (code, value) in headers.iter() {
            self.buf.put_u16(code);
            self.write_bytes(value);
        }
    }

    /// Run `f` and prefix whatever it wrote with its `i32` length.
    pub fn write_length_prefixed<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let start = self.buf.len();
        self.buf.put_i32(0);
        f(self)?;
        let len = self.buf.len() - start - 4;
        let len = i32::try_from(len)
            .map_err(|_| Error::Type(format!("Encoded block too large: {} bytes", len)))?;
        self.buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_big_endian() {
        let mut w = PacketWriter::new();
        w.write_u16(0x0102);
        w.write_i32(-2);
        w.write_u64(1);
        assert_eq!(
            w.as_slice(),
            &[1, 2, 0xff, 0xff, 0xff, 0xfe, 0, 0, 0, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_string_and_headers_layout() {
        let mut headers = Headers::new();
        headers.insert(0xFF01, Bytes::from_static(b"10"));

        let mut w = PacketWriter::new();
        w.write_string("ab");
        w.write_headers(&headers);

        assert_eq!(
            w.as_slice(),
            &[0, 0, 0, 2, b'a', b'b', 0, 1, 0xff, 0x01, 0, 0, 0, 2, b'1', b'0']
        );

        let mut r = PacketReader::new(w.freeze());
        assert_eq!(r.read_string().unwrap(), "ab");
        let decoded = r.read_headers().unwrap();
        assert_eq!(decoded.get(0xFF01).map(|b| b.as_ref()), Some(&b"10"[..]));
        assert!(r.is_empty());
    }

    #[test]
    fn test_uuid_is_raw_big_endian() {
        let id = Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0105);
        let mut w = PacketWriter::new();
        w.write_uuid(&id);
        assert_eq!(w.as_slice()[15], 0x05);
        assert_eq!(w.as_slice()[14], 0x01);
        let mut r = PacketReader::new(w.freeze());
        assert_eq!(r.read_uuid().unwrap(), id);
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut r = PacketReader::new(Bytes::from_static(&[0, 1]));
        assert!(matches!(
            r.read_u32(),
            Err(Error::EndOfStream {
                needed: 4,
                remaining: 2
            })
        ));
    }

    #[test]
    fn test_declared_length_past_end_fails() {
        // String claims 10 bytes but only 3 follow
        let mut r = PacketReader::new(Bytes::from_static(&[0, 0, 0, 10, b'a', b'b', b'c']));
        assert!(matches!(r.read_string(), Err(Error::EndOfStream { .. })));
    }

    #[test]
    fn test_sub_reader_is_bounded() {
        let mut r = PacketReader::new(Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 2]));
        let mut inner = r.sub_reader(4).unwrap();
        assert_eq!(inner.read_u32().unwrap(), 1);
        assert!(inner.read_u8().is_err());
        assert_eq!(r.read_u32().unwrap(), 2);
    }

    #[test]
    fn test_capacity_for_is_bounded_by_buffer() {
        let mut r = PacketReader::new(Bytes::from_static(&[0; 12]));
        assert_eq!(r.capacity_for(usize::MAX, 4), 3);
        assert_eq!(r.capacity_for(2, 4), 2);
        assert_eq!(r.capacity_for(10, 0), 10);
        r.skip(10).unwrap();
        assert_eq!(r.capacity_for(10, 4), 0);
        assert!(r.skip(3).is_err());
    }

    #[test]
    fn test_length_prefixed_block() {
        let mut w = PacketWriter::new();
        w.write_length_prefixed(|w| {
            w.write_i16(7);
            Ok(())
        })
        .unwrap();
        assert_eq!(w.as_slice(), &[0, 0, 0, 2, 0, 7]);
    }

    #[test]
    fn test_writers_compose_byte_exact() {
        let mut a = PacketWriter::new();
        a.write_u8(1);
        a.write_bytes(b"xy");

        let mut b = PacketWriter::new();
        b.write_raw(a.as_slice());
        b.write_i16(-1);

        assert_eq!(b.as_slice(), &[1, 0, 0, 0, 2, b'x', b'y', 0xff, 0xff]);
    }
}
