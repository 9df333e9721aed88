//! Length-prefixed framing for stream channels.
//!
//! Every message on a stream channel is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------------+
//! | length (2 bytes)  |   body                   |
//! | u16 big-endian    |   (type tag + payload)   |
//! +-------------------+--------------------------+
//! ```
//!
//! The length does **not** include the 2 prefix bytes. A body must fit the
//! channel's buffer together with its prefix, so the largest body is
//! `buffer_capacity - 2` (and never more than `u16::MAX`). Oversized bodies
//! are rejected before any byte is written.

use crate::buffer::ByteBuffer;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 2;

/// Default capacity of per-channel read, staging and scratch buffers.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16 * 1024;

/// Configuration for the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// Capacity of each channel buffer in bytes. Default: 16 KiB.
    pub buffer_capacity: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl FrameConfig {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity: buffer_capacity.max(LENGTH_PREFIX + 1),
        }
    }

    /// Largest body that can be framed with this configuration.
    pub fn max_body_len(&self) -> usize {
        (self.buffer_capacity - LENGTH_PREFIX).min(u16::MAX as usize)
    }
}

/// Errors raised while framing or parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The body (outgoing) or declared length (incoming) exceeds the maximum.
    #[error("frame body of {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Offending size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame declared a zero-length body.
    #[error("empty frame")]
    EmptyFrame,
}

/// Frame `body` into a freshly allocated buffer.
pub fn encode_frame(body: &[u8], max_body: usize) -> Result<Vec<u8>, FrameError> {
    check_body_len(body.len(), max_body)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Append a frame for `body` to `buf` (fill mode).
///
/// Returns `Ok(false)` and leaves `buf` untouched when the frame does not fit
/// the space that is left.
pub fn put_frame(buf: &mut ByteBuffer, body: &[u8], max_body: usize) -> Result<bool, FrameError> {
    check_body_len(body.len(), max_body)?;
    if buf.remaining() < LENGTH_PREFIX + body.len() {
        return Ok(false);
    }
    // Space was checked above.
    let _ = buf.put_u16(body.len() as u16);
    let _ = buf.put_slice(body);
    Ok(true)
}

fn check_body_len(len: usize, max_body: usize) -> Result<(), FrameError> {
    if len == 0 {
        return Err(FrameError::EmptyFrame);
    }
    if len > max_body {
        return Err(FrameError::TooLarge {
            size: len,
            max: max_body,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Incremental frame parser for one channel.
///
/// Bytes are read straight into [`FrameDecoder::spare_capacity`] and
/// committed; [`FrameDecoder::decode`] then extracts every complete body.
/// The declared length of a frame whose body has not fully arrived is cached,
/// so the prefix is consumed exactly once no matter how the body is split.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: ByteBuffer,
    pending: Option<usize>,
    max_body: usize,
}

impl FrameDecoder {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            buffer: ByteBuffer::with_capacity(config.buffer_capacity),
            pending: None,
            max_body: config.max_body_len(),
        }
    }

    /// Writable tail of the read buffer.
    pub fn spare_capacity(&mut self) -> &mut [u8] {
        self.buffer.chunk_mut()
    }

    /// Mark `count` bytes of [`spare_capacity`](Self::spare_capacity) as filled.
    pub fn commit(&mut self, count: usize) {
        self.buffer.advance(count);
    }

    /// Copy as much of `bytes` as fits and return how many were taken.
    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.buffer.remaining());
        let _ = self.buffer.put_slice(&bytes[..take]);
        take
    }

    /// Length of the frame whose body is still incomplete, if any.
    pub fn pending_len(&self) -> Option<usize> {
        self.pending
    }

    /// Extract all complete frame bodies currently buffered.
    ///
    /// A declared length of zero or above the maximum is a protocol violation;
    /// the channel cannot be resynchronised after it.
    pub fn decode(&mut self) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut bodies = Vec::new();
        self.buffer.flip();
        let result = self.drain_frames(&mut bodies);
        self.buffer.compact();
        result.map(|()| bodies)
    }

    fn drain_frames(&mut self, bodies: &mut Vec<Vec<u8>>) -> Result<(), FrameError> {
        loop {
            let len = match self.pending {
                Some(len) => len,
                None => {
                    let Ok(len) = self.buffer.get_u16() else {
                        return Ok(());
                    };
                    let len = len as usize;
                    check_body_len(len, self.max_body)?;
                    self.pending = Some(len);
                    len
                }
            };
            match self.buffer.get_slice(len) {
                Ok(body) => {
                    bodies.push(body.to_vec());
                    self.pending = None;
                }
                Err(_) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> FrameConfig {
        FrameConfig::new(capacity)
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let cfg = config(64);
        let frame = encode_frame(b"hello", cfg.max_body_len()).unwrap();
        assert_eq!(&frame[..2], &[0, 5]);

        let mut decoder = FrameDecoder::new(&cfg);
        assert_eq!(decoder.extend(&frame), frame.len());
        assert_eq!(decoder.decode().unwrap(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let cfg = config(64);
        let mut wire = Vec::new();
        for body in [&b"a"[..], b"bb", b"ccc"] {
            wire.extend(encode_frame(body, cfg.max_body_len()).unwrap());
        }

        let mut decoder = FrameDecoder::new(&cfg);
        decoder.extend(&wire);
        let bodies = decoder.decode().unwrap();
        assert_eq!(bodies, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
    }

    #[test]
    fn test_partial_read_resumes_correctly() {
        let cfg = config(32);
        let body: Vec<u8> = (1..=30).collect();
        let frame = encode_frame(&body, cfg.max_body_len()).unwrap();

        // Feed one byte at a time; the body must appear exactly once.
        let mut decoder = FrameDecoder::new(&cfg);
        let mut decoded = Vec::new();
        for byte in &frame {
            decoder.extend(std::slice::from_ref(byte));
            decoded.extend(decoder.decode().unwrap());
        }
        assert_eq!(decoded, vec![body]);
        assert_eq!(decoder.pending_len(), None);
    }

    #[test]
    fn test_pending_length_is_cached_across_reads() {
        let cfg = config(64);
        let frame = encode_frame(&[9u8; 10], cfg.max_body_len()).unwrap();

        let mut decoder = FrameDecoder::new(&cfg);
        decoder.extend(&frame[..5]);
        assert!(decoder.decode().unwrap().is_empty());
        assert_eq!(decoder.pending_len(), Some(10));

        decoder.extend(&frame[5..]);
        assert_eq!(decoder.decode().unwrap(), vec![vec![9u8; 10]]);
    }

    #[test]
    fn test_arbitrary_splits_across_many_frames() {
        let cfg = config(48);
        let max = cfg.max_body_len();
        let bodies: Vec<Vec<u8>> = (1..=max).step_by(5).map(|n| vec![n as u8; n]).collect();
        let mut wire = Vec::new();
        for body in &bodies {
            wire.extend(encode_frame(body, max).unwrap());
        }

        for split in [1usize, 3, 7, 13, 46] {
            let mut decoder = FrameDecoder::new(&cfg);
            let mut decoded = Vec::new();
            for piece in wire.chunks(split) {
                let mut offset = 0;
                while offset < piece.len() {
                    offset += decoder.extend(&piece[offset..]);
                    decoded.extend(decoder.decode().unwrap());
                }
            }
            assert_eq!(decoded, bodies, "split size {split}");
        }
    }

    #[test]
    fn test_max_size_body_fits_buffer() {
        let cfg = config(32);
        let body = vec![1u8; cfg.max_body_len()];
        let frame = encode_frame(&body, cfg.max_body_len()).unwrap();
        assert_eq!(frame.len(), 32);

        let mut decoder = FrameDecoder::new(&cfg);
        assert_eq!(decoder.extend(&frame), 32);
        assert_eq!(decoder.decode().unwrap(), vec![body]);
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let cfg = config(32);
        let result = encode_frame(&[0u8; 31], cfg.max_body_len());
        assert_eq!(result, Err(FrameError::TooLarge { size: 31, max: 30 }));
    }

    #[test]
    fn test_put_frame_reports_no_room_without_writing() {
        let mut buf = ByteBuffer::with_capacity(10);
        assert!(put_frame(&mut buf, b"abcde", 8).unwrap());
        assert_eq!(buf.position(), 7);
        assert!(!put_frame(&mut buf, b"xy", 8).unwrap());
        assert_eq!(buf.position(), 7);
    }

    #[test]
    fn test_oversized_declared_length_is_violation() {
        let cfg = config(16);
        let mut decoder = FrameDecoder::new(&cfg);
        decoder.extend(&[0x00, 0x20, 1, 2]);
        assert!(matches!(decoder.decode(), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn test_zero_length_frame_is_violation() {
        let cfg = config(16);
        let mut decoder = FrameDecoder::new(&cfg);
        decoder.extend(&[0x00, 0x00]);
        assert_eq!(decoder.decode(), Err(FrameError::EmptyFrame));
    }

    #[test]
    fn test_default_capacity() {
        let cfg = FrameConfig::default();
        assert_eq!(cfg.buffer_capacity, 16 * 1024);
        assert_eq!(cfg.max_body_len(), 16 * 1024 - 2);
    }
}
