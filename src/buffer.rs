//! Bounds-checked byte buffer underlying packet encode and decode.

use crate::error::ProtocolError;

/// Growable byte buffer with bounds-checked typed reads.
///
/// Every read validates `offset + width <= len` and returns
/// `ProtocolError::Truncated` instead of reading past the end. All
/// multi-byte integers are big-endian on the wire.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    d: Vec<u8>,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { d: Vec::new() }
    }

    /// Create an empty buffer with reserved capacity.
    pub fn with_capacity(n: usize) -> Self {
        Self { d: Vec::with_capacity(n) }
    }

    /// Create a buffer holding a copy of `b`.
    pub fn from_bytes(b: &[u8]) -> Self {
        Self { d: b.to_vec() }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.d.len()
    }

    /// True if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.d.is_empty()
    }

    /// Entire contents as a slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.d
    }

    /// Entire contents as a mutable slice (in-place crypto).
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.d
    }

    /// Read one byte at `off`.
    pub fn u8_at(&self, off: usize) -> Result<u8, ProtocolError> {
        self.d.get(off).copied().ok_or(ProtocolError::Truncated)
    }

    /// Read a big-endian u16 at `off`.
    pub fn u16_at(&self, off: usize) -> Result<u16, ProtocolError> {
        let b = self.bytes_at(off, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32 at `off`.
    pub fn u32_at(&self, off: usize) -> Result<u32, ProtocolError> {
        let b = self.bytes_at(off, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian u64 at `off`.
    pub fn u64_at(&self, off: usize) -> Result<u64, ProtocolError> {
        let b = self.bytes_at(off, 8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    /// Borrow `len` bytes starting at `off`.
    pub fn bytes_at(&self, off: usize, len: usize) -> Result<&[u8], ProtocolError> {
        let end = off.checked_add(len).ok_or(ProtocolError::Truncated)?;
        self.d.get(off..end).ok_or(ProtocolError::Truncated)
    }

    /// Append one byte.
    pub fn append_u8(&mut self, v: u8) {
        self.d.push(v);
    }

    /// Append a big-endian u16.
    pub fn append_u16(&mut self, v: u16) {
        self.d.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a big-endian u32.
    pub fn append_u32(&mut self, v: u32) {
        self.d.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a big-endian u64.
    pub fn append_u64(&mut self, v: u64) {
        self.d.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a byte slice.
    pub fn append_bytes(&mut self, b: &[u8]) {
        self.d.extend_from_slice(b);
    }

    /// Append `n` zero bytes (placeholder fields patched later).
    pub fn append_zeroes(&mut self, n: usize) {
        self.d.resize(self.d.len() + n, 0);
    }

    /// Overwrite a big-endian u16 at `off`.
    pub fn set_u16_at(&mut self, off: usize, v: u16) -> Result<(), ProtocolError> {
        self.set_bytes_at(off, &v.to_be_bytes())
    }

    /// Overwrite a big-endian u64 at `off`.
    pub fn set_u64_at(&mut self, off: usize, v: u64) -> Result<(), ProtocolError> {
        self.set_bytes_at(off, &v.to_be_bytes())
    }

    /// Overwrite bytes at `off`; fails rather than growing the buffer.
    pub fn set_bytes_at(&mut self, off: usize, b: &[u8]) -> Result<(), ProtocolError> {
        let end = off.checked_add(b.len()).ok_or(ProtocolError::Truncated)?;
        let dst = self.d.get_mut(off..end).ok_or(ProtocolError::Truncated)?;
        dst.copy_from_slice(b);
        Ok(())
    }

    /// Shorten the buffer to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.d.truncate(len);
    }
}
