//! Growable byte buffer for one message body.

use crate::codec::CodecError;

/// Largest capacity a buffer may reach (1 GiB - 1).
pub const MAX_ALLOC_SIZE: usize = 0x3fff_ffff;

const INITIAL_CAPACITY: usize = 1024;

/// Owned byte container with a tracked capacity.
///
/// The live bytes are always followed by one NUL that is not part of
/// [`len`](Self::len), so a body read off the wire can be handed to code
/// expecting a terminated string. Capacity doubles on growth and never
/// shrinks.
#[derive(Clone)]
pub struct ExpandableBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl ExpandableBuffer {
    pub fn new() -> Self {
        let mut data = Vec::with_capacity(INITIAL_CAPACITY);
        data.push(0);
        Self {
            data,
            capacity: INITIAL_CAPACITY,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes available (including the terminator) before the next growth.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len();
        &mut self.data[..len]
    }

    /// Live bytes plus the trailing NUL.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.data
    }

    /// Drop the contents, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.data.push(0);
    }

    /// Make room for `needed` more bytes beyond the current length.
    pub fn reserve(&mut self, needed: usize) -> Result<(), CodecError> {
        let too_large = || CodecError::TooLarge {
            current: self.len(),
            requested: needed,
        };
        // +1 for the terminator.
        let required = self
            .data
            .len()
            .checked_add(needed)
            .filter(|total| *total <= MAX_ALLOC_SIZE)
            .ok_or_else(too_large)?;
        if required <= self.capacity {
            return Ok(());
        }

        let mut new_capacity = self.capacity;
        while new_capacity < required {
            new_capacity = new_capacity.saturating_mul(2);
        }
        // Doubling may overshoot the cap while the request itself fits.
        let new_capacity = new_capacity.min(MAX_ALLOC_SIZE);
        self.data.reserve_exact(new_capacity - self.data.len());
        self.capacity = new_capacity;
        Ok(())
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.reserve(bytes.len())?;
        self.data.pop();
        self.data.extend_from_slice(bytes);
        self.data.push(0);
        Ok(())
    }

    pub fn append_byte(&mut self, byte: u8) -> Result<(), CodecError> {
        self.append(&[byte])
    }

    /// Extend by `count` zero bytes and return them for the caller to fill.
    pub fn grow_by(&mut self, count: usize) -> Result<&mut [u8], CodecError> {
        self.reserve(count)?;
        let start = self.len();
        self.data.pop();
        self.data.resize(start + count, 0);
        self.data.push(0);
        Ok(&mut self.data[start..start + count])
    }
}

impl Default for ExpandableBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExpandableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpandableBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_a_trailing_nul() {
        let mut buf = ExpandableBuffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.as_bytes_with_nul(), b"\0");

        buf.append(b"abc").expect("append");
        assert_eq!(buf.as_bytes(), b"abc");
        assert_eq!(buf.as_bytes_with_nul(), b"abc\0");

        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.as_bytes_with_nul(), b"\0");
    }

    #[test]
    fn capacity_doubles_and_never_shrinks() {
        let mut buf = ExpandableBuffer::new();
        assert_eq!(buf.capacity(), 1024);
        buf.grow_by(1023).expect("fits");
        assert_eq!(buf.capacity(), 1024);
        buf.append_byte(b'x').expect("one more");
        assert_eq!(buf.capacity(), 2048);
        buf.grow_by(5000).expect("bigger");
        assert_eq!(buf.capacity(), 8192);

        buf.clear();
        assert_eq!(buf.capacity(), 8192);
    }

    #[test]
    fn refuses_to_exceed_the_cap() {
        let mut buf = ExpandableBuffer::new();
        buf.append(b"hi").expect("append");
        match buf.reserve(MAX_ALLOC_SIZE) {
            Err(CodecError::TooLarge { current, requested }) => {
                assert_eq!(current, 2);
                assert_eq!(requested, MAX_ALLOC_SIZE);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        assert_eq!(buf.as_bytes(), b"hi");
        assert!(buf.reserve(usize::MAX).is_err());
    }

    #[test]
    fn grow_by_returns_zeroed_tail() {
        let mut buf = ExpandableBuffer::new();
        buf.append(b"ab").expect("append");
        let tail = buf.grow_by(3).expect("grow");
        assert_eq!(tail, &[0, 0, 0]);
        tail.copy_from_slice(b"cde");
        assert_eq!(buf.as_bytes_with_nul(), b"abcde\0");
    }
}
