//! Ethernet frame layout
//!
//! A frame is a 4-byte payload length followed by the payload itself:
//!
//! ```text
//! [payload_size: u32 (host byte order)][payload: payload_size bytes]
//! ```
//!
//! The in-memory buffer is laid out exactly like the wire format, so the
//! socket reads straight into a frame and writes straight out of one without
//! any re-encoding. The length prefix is kept in host byte order.

use crate::error::{ProtocolError, Result};

/// Largest payload a frame may carry
pub const MAX_PAYLOAD_SIZE: usize = 512;

/// Size of the length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest frame on the wire (header + payload)
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Check a declared payload size against `(0, MAX_PAYLOAD_SIZE]`
///
/// Returns the size as `usize` on success.
pub fn validate_payload_size(size: u32) -> Result<usize> {
    let len = size as usize;
    if len == 0 || len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::InvalidPayloadSize {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(len)
}

/// A fixed-size frame buffer
///
/// Frames are preallocated by the frame pool and reused; the buffer always has
/// room for [`MAX_FRAME_SIZE`] bytes regardless of the current payload size.
pub struct Frame {
    bytes: Box<[u8; MAX_FRAME_SIZE]>,
}

impl Frame {
    /// Allocate a zeroed frame with a payload size of 0
    pub fn new() -> Self {
        Self {
            bytes: Box::new([0u8; MAX_FRAME_SIZE]),
        }
    }

    /// Build a frame holding a copy of `payload`
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut frame = Self::new();
        frame.set_payload(payload)?;
        Ok(frame)
    }

    /// Declared payload size, as stored in the length prefix
    pub fn payload_size(&self) -> u32 {
        let mut prefix = [0u8; FRAME_HEADER_SIZE];
        prefix.copy_from_slice(&self.bytes[..FRAME_HEADER_SIZE]);
        u32::from_ne_bytes(prefix)
    }

    /// Set the payload size after writing into [`Frame::payload_buf_mut`]
    pub fn set_payload_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(ProtocolError::InvalidPayloadSize {
                size: 0,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        self.bytes[..FRAME_HEADER_SIZE].copy_from_slice(&(size as u32).to_ne_bytes());
        Ok(())
    }

    /// Copy `payload` into the frame and update the length prefix
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.set_payload_size(payload.len())?;
        self.bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// The payload bytes covered by the length prefix
    ///
    /// A size beyond [`MAX_PAYLOAD_SIZE`] is clamped; such frames never leave
    /// the reader, which rejects them while parsing the header.
    pub fn payload(&self) -> &[u8] {
        let len = (self.payload_size() as usize).min(MAX_PAYLOAD_SIZE);
        &self.bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len]
    }

    /// The whole payload region, independent of the current payload size
    pub fn payload_buf_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[FRAME_HEADER_SIZE..]
    }

    /// Number of bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload().len()
    }

    /// Wire representation (length prefix + payload)
    pub fn as_wire(&self) -> &[u8] {
        &self.bytes[..self.wire_len()]
    }

    /// Raw backing buffer, used by the reader to fill the frame in place
    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }

    /// Reset the length prefix so a recycled frame carries no stale size
    pub fn clear(&mut self) {
        self.bytes[..FRAME_HEADER_SIZE].fill(0);
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("payload_size", &self.payload_size())
            .finish_non_exhaustive()
    }
}
