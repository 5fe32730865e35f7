//! Resumable frame reading and writing over non-blocking streams
//!
//! A non-blocking socket may accept or deliver only part of a frame per call.
//! [`FrameReader`] and [`FrameWriter`] keep a byte counter across calls so the
//! transfer resumes exactly where it stopped on the next tick:
//!
//! ```text
//! awaiting frame --(first bytes)--> in progress --(last byte)--> complete
//! ```
//!
//! Each `poll_*` call performs at most one `read`/`write` on the stream.
//! Transient conditions (`WouldBlock`, `Interrupted`) and peer disconnects are
//! reported as outcomes; any other I/O error is returned as
//! [`ProtocolError::Io`].
//!
//! # Example
//!
//! ```
//! use protocol::{Frame, FrameReader, FrameWriter, ReadOutcome, WriteOutcome};
//!
//! let outgoing = Frame::from_payload(b"\x00hello").unwrap();
//! let mut wire = Vec::new();
//! let mut writer = FrameWriter::new();
//! assert_eq!(writer.poll_write(&mut wire, &outgoing).unwrap(), WriteOutcome::Complete);
//!
//! let mut incoming = Frame::new();
//! let mut reader = FrameReader::new();
//! let mut src = &wire[..];
//! while reader.poll_read(&mut src, &mut incoming).unwrap() != ReadOutcome::Complete {}
//! assert_eq!(incoming.payload(), b"\x00hello");
//! ```

use crate::error::{ProtocolError, Result};
use crate::frame::{FRAME_HEADER_SIZE, Frame, validate_payload_size};
use std::io::{self, ErrorKind, Read, Write};

/// Result of one [`FrameReader::poll_read`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No data available right now; retry on the next tick
    WouldBlock,
    /// Bytes were consumed but the frame is not complete yet
    Partial,
    /// The whole frame is in the buffer
    Complete,
    /// The peer closed the stream (read returned 0)
    EndOfStream,
    /// The peer reset or aborted the connection
    Disconnected,
}

/// Result of one [`FrameWriter::poll_write`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The stream cannot take data right now; retry on the next tick
    WouldBlock,
    /// Bytes were written but the frame is not finished yet
    Partial,
    /// The whole frame has been written
    Complete,
    /// The stream accepted zero bytes
    EndOfStream,
    /// The peer reset or aborted the connection
    Disconnected,
}

enum Transient {
    WouldBlock,
    Disconnected,
}

fn classify(err: io::Error) -> Result<Transient> {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => Ok(Transient::WouldBlock),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            Ok(Transient::Disconnected)
        }
        _ => Err(ProtocolError::Io(err)),
    }
}

/// Incoming direction: fills a [`Frame`] from a stream across several ticks
#[derive(Debug, Default)]
pub struct FrameReader {
    read: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { read: 0 }
    }

    /// Start a new frame
    pub fn reset(&mut self) {
        self.read = 0;
    }

    /// Bytes of the current frame read so far (header included)
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    /// Read the next chunk of the current frame into `frame`
    ///
    /// The length prefix is validated as soon as its 4 bytes are in; an
    /// out-of-range size yields [`ProtocolError::InvalidPayloadSize`] and the
    /// frame must be discarded.
    pub fn poll_read<R: Read>(&mut self, src: &mut R, frame: &mut Frame) -> Result<ReadOutcome> {
        let target = if self.read < FRAME_HEADER_SIZE {
            FRAME_HEADER_SIZE
        } else {
            FRAME_HEADER_SIZE + validate_payload_size(frame.payload_size())?
        };

        let n = match src.read(&mut frame.raw_mut()[self.read..target]) {
            Ok(0) => return Ok(ReadOutcome::EndOfStream),
            Ok(n) => n,
            Err(e) => {
                return match classify(e)? {
                    Transient::WouldBlock => Ok(ReadOutcome::WouldBlock),
                    Transient::Disconnected => Ok(ReadOutcome::Disconnected),
                };
            }
        };

        self.read += n;

        if self.read < FRAME_HEADER_SIZE {
            return Ok(ReadOutcome::Partial);
        }

        let total = FRAME_HEADER_SIZE + validate_payload_size(frame.payload_size())?;
        if self.read == total {
            Ok(ReadOutcome::Complete)
        } else {
            Ok(ReadOutcome::Partial)
        }
    }
}

/// Outgoing direction: drains a [`Frame`] into a stream across several ticks
#[derive(Debug, Default)]
pub struct FrameWriter {
    written: usize,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    /// Start a new frame
    pub fn reset(&mut self) {
        self.written = 0;
    }

    /// Bytes of the current frame written so far (header included)
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Write the next chunk of `frame` to `dst`
    pub fn poll_write<W: Write>(&mut self, dst: &mut W, frame: &Frame) -> Result<WriteOutcome> {
        let wire = frame.as_wire();
        if self.written >= wire.len() {
            return Ok(WriteOutcome::Complete);
        }

        let n = match dst.write(&wire[self.written..]) {
            Ok(0) => return Ok(WriteOutcome::EndOfStream),
            Ok(n) => n,
            Err(e) => {
                return match classify(e)? {
                    Transient::WouldBlock => Ok(WriteOutcome::WouldBlock),
                    Transient::Disconnected => Ok(WriteOutcome::Disconnected),
                };
            }
        };

        self.written += n;

        if self.written == wire.len() {
            Ok(WriteOutcome::Complete)
        } else {
            Ok(WriteOutcome::Partial)
        }
    }
}
