//! Owned byte storage for I/O operations.
//!
//! A `Buffer` owns a fixed allocation (`capacity`) and tracks how much of it
//! holds valid data (`size`). The invariant `size <= capacity` always holds.
//!
//! Buffers move along the operation/handler chain and are never shared, so
//! there is no `Clone`: callers that need a second copy build one with
//! `Buffer::from_slice(buf.as_slice())`.
//!
//! Growth (`append`, `reserve`) reallocates and copies the valid prefix, so
//! any slice obtained before the call is invalidated by the borrow checker.

use std::fmt;
use std::os::unix::io::RawFd;

/// Growth factor applied when `append` runs out of room.
const GROWTH_FACTOR: usize = 2;

pub struct Buffer {
    data: Box<[u8]>,
    size: usize,
}

impl Buffer {
    /// Empty buffer with no allocation.
    pub fn new() -> Self {
        Self {
            data: Box::default(),
            size: 0,
        }
    }

    /// Zero-filled storage of `capacity` bytes, `size` 0.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            size: 0,
        }
    }

    /// Copy `bytes` into a new buffer whose size and capacity both equal
    /// `bytes.len()`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
            size: bytes.len(),
        }
    }

    /// Encode a descriptor handed over by an accept completion.
    ///
    /// The receiver owns the descriptor from then on.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self::from_slice(&fd.to_ne_bytes())
    }

    /// Decode a descriptor written by `from_raw_fd`.
    ///
    /// Returns `None` unless the buffer holds exactly one descriptor.
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        let bytes: [u8; std::mem::size_of::<RawFd>()] = self.as_slice().try_into().ok()?;
        Some(RawFd::from_ne_bytes(bytes))
    }

    /// Valid bytes, `[0, size)`.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Valid bytes, mutable.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.size]
    }

    /// The whole allocation, `[0, capacity)`. Used as a read target; follow
    /// up with `set_size` once the byte count is known.
    #[inline]
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Set the valid length, clamped to capacity.
    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(self.capacity());
    }

    /// Grow the allocation to at least `capacity` bytes, keeping content.
    /// Never shrinks.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity <= self.capacity() {
            return;
        }
        let mut grown = vec![0u8; capacity].into_boxed_slice();
        grown[..self.size].copy_from_slice(&self.data[..self.size]);
        self.data = grown;
    }

    /// Append `bytes`, growing geometrically when the allocation is full.
    pub fn append(&mut self, bytes: &[u8]) {
        let needed = self.size + bytes.len();
        if needed > self.capacity() {
            let target = needed.max(self.capacity() * GROWTH_FACTOR);
            self.reserve(target);
        }
        self.data[self.size..needed].copy_from_slice(bytes);
        self.size = needed;
    }

    /// Drop the content, keep the allocation.
    pub fn clear(&mut self) {
        self.size = 0;
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_slice()).into_owned()
    }

    /// Valid bytes as a `Vec`, releasing the spare capacity.
    pub fn into_vec(self) -> Vec<u8> {
        let mut v = self.data.into_vec();
        v.truncate(self.size);
        v
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(v: Vec<u8>) -> Self {
        let size = v.len();
        Self {
            data: v.into_boxed_slice(),
            size,
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from_slice(bytes)
    }
}

impl From<&str> for Buffer {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<String> for Buffer {
    fn from(s: String) -> Self {
        Self::from(s.into_bytes())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty() {
        let buf = Buffer::new();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.capacity(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_from_slice_copies() {
        let src = b"hello".to_vec();
        let buf = Buffer::from_slice(&src);
        drop(src);
        assert_eq!(buf.as_slice(), b"hello");
        assert_eq!(buf.size(), 5);
        assert_eq!(buf.capacity(), 5);
    }

    #[test]
    fn test_set_size_clamps_to_capacity() {
        let mut buf = Buffer::with_capacity(8);
        buf.set_size(100);
        assert_eq!(buf.size(), 8);
        buf.set_size(3);
        assert_eq!(buf.size(), 3);
    }

    #[test]
    fn test_append_grows_and_preserves() {
        let mut buf = Buffer::with_capacity(4);
        buf.append(b"abcd");
        assert_eq!(buf.capacity(), 4);

        buf.append(b"e");
        assert_eq!(buf.as_slice(), b"abcde");
        // Geometric: doubled rather than grown by one byte
        assert_eq!(buf.capacity(), 8);

        buf.append(&[b'x'; 20]);
        assert_eq!(buf.size(), 25);
        assert!(buf.capacity() >= 25);
        assert_eq!(&buf.as_slice()[..5], b"abcde");
    }

    #[test]
    fn test_append_to_empty() {
        let mut buf = Buffer::new();
        buf.append(b"");
        assert!(buf.is_empty());
        buf.append(b"xyz");
        assert_eq!(buf.as_slice(), b"xyz");
    }

    #[test]
    fn test_storage_then_set_size() {
        let mut buf = Buffer::with_capacity(16);
        buf.storage_mut()[..4].copy_from_slice(b"ping");
        assert!(buf.is_empty());
        buf.set_size(4);
        assert_eq!(buf.to_string_lossy(), "ping");
    }

    #[test]
    fn test_raw_fd_roundtrip() {
        let buf = Buffer::from_raw_fd(42);
        assert_eq!(buf.as_raw_fd(), Some(42));
        assert_eq!(Buffer::from("no").as_raw_fd(), None);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = Buffer::from("data");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn test_into_vec_truncates() {
        let mut buf = Buffer::with_capacity(10);
        buf.append(b"abc");
        assert_eq!(buf.into_vec(), b"abc".to_vec());
    }
}
