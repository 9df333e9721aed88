//! Fixed-capacity byte buffer with explicit position and limit.
//!
//! The buffer alternates between two modes:
//!
//! - **fill mode**: `position` is the number of bytes written so far and
//!   `limit` equals the capacity;
//! - **drain mode**: after [`ByteBuffer::flip`], `position` is the read
//!   cursor and `limit` marks the end of valid data.
//!
//! [`ByteBuffer::compact`] moves the unread tail to the front and returns to
//! fill mode, which is how partially received frames survive across reads.

/// Errors raised when a put or get would cross the buffer's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// Not enough room left to write.
    #[error("buffer overflow: need {needed} bytes, {remaining} remaining")]
    Overflow {
        /// Bytes the caller tried to write.
        needed: usize,
        /// Bytes available before the limit.
        remaining: usize,
    },

    /// Not enough data left to read.
    #[error("buffer underflow: need {needed} bytes, {remaining} remaining")]
    Underflow {
        /// Bytes the caller tried to read.
        needed: usize,
        /// Bytes available before the limit.
        remaining: usize,
    },
}

/// Owned byte buffer with `position`/`limit` cursors.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl ByteBuffer {
    /// Allocate a zeroed buffer in fill mode.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between `position` and `limit`.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Discard all content and return to fill mode.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Switch from fill mode to drain mode.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Move unread bytes to the front and switch back to fill mode.
    pub fn compact(&mut self) {
        let remaining = self.remaining();
        self.data.copy_within(self.position..self.limit, 0);
        self.position = remaining;
        self.limit = self.data.len();
    }

    /// The bytes between `position` and `limit`.
    pub fn chunk(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Writable space between `position` and `limit`.
    pub fn chunk_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// Move `position` forward by `count` bytes, clamped to `limit`.
    pub fn advance(&mut self, count: usize) {
        self.position = (self.position + count).min(self.limit);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if bytes.len() > self.remaining() {
            return Err(BufferError::Overflow {
                needed: bytes.len(),
                remaining: self.remaining(),
            });
        }
        self.data[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    /// Write a big-endian `u16`.
    pub fn put_u16(&mut self, value: u16) -> Result<(), BufferError> {
        self.put_slice(&value.to_be_bytes())
    }

    /// Read a big-endian `u16`.
    pub fn get_u16(&mut self) -> Result<u16, BufferError> {
        let bytes = self.get_slice(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read `len` bytes and advance past them.
    pub fn get_slice(&mut self, len: usize) -> Result<&[u8], BufferError> {
        if len > self.remaining() {
            return Err(BufferError::Underflow {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let start = self.position;
        self.position += len;
        Ok(&self.data[start..start + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_exposes_written_bytes() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.put_slice(b"abc").unwrap();
        assert_eq!(buf.position(), 3);

        buf.flip();
        assert_eq!(buf.chunk(), b"abc");
        assert_eq!(buf.remaining(), 3);
    }

    #[test]
    fn test_compact_keeps_unread_tail() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.put_slice(b"hello").unwrap();
        buf.flip();
        buf.get_slice(2).unwrap();
        buf.compact();

        assert_eq!(buf.position(), 3);
        assert_eq!(buf.limit(), 8);
        buf.flip();
        assert_eq!(buf.chunk(), b"llo");
    }

    #[test]
    fn test_u16_is_big_endian() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.put_u16(0x0102).unwrap();
        buf.flip();
        assert_eq!(buf.chunk(), &[0x01, 0x02]);
        assert_eq!(buf.get_u16().unwrap(), 0x0102);
    }

    #[test]
    fn test_overflow_is_reported_without_writing() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.put_slice(b"abc").unwrap();
        let err = buf.put_slice(b"de").unwrap_err();
        assert_eq!(
            err,
            BufferError::Overflow {
                needed: 2,
                remaining: 1
            }
        );
        assert_eq!(buf.position(), 3);
    }

    #[test]
    fn test_underflow_is_reported() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.put_slice(&[7]).unwrap();
        buf.flip();
        assert!(matches!(
            buf.get_u16(),
            Err(BufferError::Underflow { needed: 2, .. })
        ));
    }

    #[test]
    fn test_advance_is_clamped_to_limit() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.put_slice(b"ab").unwrap();
        buf.flip();
        buf.advance(10);
        assert!(!buf.has_remaining());
    }
}
