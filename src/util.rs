//! Binary codec helpers and secure byte buffers.
//!
//! Every record persisted by the wallet uses a hand-rolled byte layout:
//! big-endian integers for identifiers, Bitcoin varints for lengths, and
//! length-prefixed byte strings. `BinaryWriter` and `BinaryReader` are the
//! only two types that touch raw layout; everything above them works with
//! typed fields.

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors from reading malformed byte layouts.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of data")]
    UnexpectedEnd,

    #[error("trailing bytes after record")]
    TrailingBytes,

    #[error("invalid varint encoding")]
    BadVarInt,

    #[error("unexpected tag byte: {0:#04x}")]
    BadTag(u8),

    #[error("length field out of range: {0}")]
    BadLength(u64),
}

// ----------------------------- BinaryWriter -----------------------------

/// Append-only byte sink with the wallet's integer conventions.
#[derive(Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16_le(&mut self, v: u16) {
        self.buf.write_u16::<LittleEndian>(v).expect("vec write");
    }

    pub fn put_u32_be(&mut self, v: u32) {
        self.buf.write_u32::<BigEndian>(v).expect("vec write");
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.buf.write_u32::<LittleEndian>(v).expect("vec write");
    }

    pub fn put_u64_le(&mut self, v: u64) {
        self.buf.write_u64::<LittleEndian>(v).expect("vec write");
    }

    /// Bitcoin variable-length integer.
    pub fn put_var_int(&mut self, v: u64) {
        match v {
            0..=0xfc => self.put_u8(v as u8),
            0xfd..=0xffff => {
                self.put_u8(0xfd);
                self.put_u16_le(v as u16);
            }
            0x10000..=0xffff_ffff => {
                self.put_u8(0xfe);
                self.put_u32_le(v as u32);
            }
            _ => {
                self.put_u8(0xff);
                self.buf.write_u64::<LittleEndian>(v).expect("vec write");
            }
        }
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// varint length prefix followed by the bytes.
    pub fn put_var_bytes(&mut self, data: &[u8]) {
        self.put_var_int(data.len() as u64);
        self.put_bytes(data);
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

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ----------------------------- BinaryReader -----------------------------

/// Cursor over a byte slice with checked reads.
pub struct BinaryReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        (len - self.cursor.position()) as usize
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Fails unless every byte has been consumed.
    pub fn expect_exhausted(&self) -> Result<(), CodecError> {
        if self.is_exhausted() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes)
        }
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        self.cursor.read_u8().map_err(|_| CodecError::UnexpectedEnd)
    }

    pub fn get_u16_le(&mut self) -> Result<u16, CodecError> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| CodecError::UnexpectedEnd)
    }

    pub fn get_u32_be(&mut self) -> Result<u32, CodecError> {
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| CodecError::UnexpectedEnd)
    }

    pub fn get_u32_le(&mut self) -> Result<u32, CodecError> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| CodecError::UnexpectedEnd)
    }

    pub fn get_u64_le(&mut self) -> Result<u64, CodecError> {
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| CodecError::UnexpectedEnd)
    }

    pub fn get_var_int(&mut self) -> Result<u64, CodecError> {
        let first = self.get_u8()?;
        let v = match first {
            0xfd => self.get_u16_le()? as u64,
            0xfe => self.get_u32_le()? as u64,
            0xff => self
                .cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| CodecError::UnexpectedEnd)?,
            _ => first as u64,
        };
        Ok(v)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEnd);
        }
        let mut out = vec![0u8; len];
        self.cursor
            .read_exact(&mut out)
            .map_err(|_| CodecError::UnexpectedEnd)?;
        Ok(out)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        if N > self.remaining() {
            return Err(CodecError::UnexpectedEnd);
        }
        let mut out = [0u8; N];
        self.cursor
            .read_exact(&mut out)
            .map_err(|_| CodecError::UnexpectedEnd)?;
        Ok(out)
    }

    /// Length-prefixed byte string, bounded by the remaining input.
    pub fn get_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.get_var_int()?;
        if len > self.remaining() as u64 {
            return Err(CodecError::BadLength(len));
        }
        self.get_bytes(len as usize)
    }

    /// All bytes left in the input.
    pub fn get_rest(&mut self) -> Vec<u8> {
        let rest = self.remaining();
        self.get_bytes(rest).expect("bounded read")
    }
}

// ----------------------------- SecureBytes -----------------------------

/// Heap buffer for secret material, zeroized on drop.
///
/// Equality is constant-time so key-id and MAC comparisons never leak
/// timing. Debug output is redacted.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecureBytes(Vec<u8>);

impl SecureBytes {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.clone()
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for SecureBytes {
    fn from(v: &[u8]) -> Self {
        Self(v.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for SecureBytes {
    fn from(v: [u8; N]) -> Self {
        Self(v.to_vec())
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for SecureBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for SecureBytes {}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        let values = [0u64, 1, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, u64::MAX];
        for v in values {
            let mut bw = BinaryWriter::new();
            bw.put_var_int(v);
            let bytes = bw.into_bytes();
            let mut br = BinaryReader::new(&bytes);
            assert_eq!(br.get_var_int().unwrap(), v);
            assert!(br.is_exhausted());
        }
    }

    #[test]
    fn var_bytes_rejects_overlong_length() {
        let mut bw = BinaryWriter::new();
        bw.put_var_int(1000);
        bw.put_bytes(&[1, 2, 3]);
        let bytes = bw.into_bytes();
        let mut br = BinaryReader::new(&bytes);
        assert!(matches!(br.get_var_bytes(), Err(CodecError::BadLength(_))));
    }

    #[test]
    fn reader_detects_trailing_bytes() {
        let data = [1u8, 2, 3];
        let mut br = BinaryReader::new(&data);
        br.get_u8().unwrap();
        assert!(matches!(
            br.expect_exhausted(),
            Err(CodecError::TrailingBytes)
        ));
    }

    #[test]
    fn secure_bytes_constant_time_eq() {
        let a = SecureBytes::from(vec![1u8, 2, 3]);
        let b = SecureBytes::from(vec![1u8, 2, 3]);
        let c = SecureBytes::from(vec![1u8, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
