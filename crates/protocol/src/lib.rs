//! Wire protocol for the eth2usb bridge
//!
//! This crate defines what travels over the TCP link and how it maps onto an
//! Active Servo bulk command:
//!
//! - [`Frame`]: a length-prefixed buffer whose memory layout is the wire format
//! - [`CommandHeader`]: the one-byte header that opens every inbound payload
//! - [`FrameReader`] / [`FrameWriter`]: resumable partial I/O over
//!   non-blocking streams
//!
//! # Example
//!
//! ```
//! use protocol::{CommandHeader, Frame, encode_command, split_command};
//!
//! let payload = encode_command(CommandHeader::write_only(), &[0x42]);
//! let frame = Frame::from_payload(&payload).unwrap();
//!
//! let (header, body) = split_command(frame.payload()).unwrap();
//! assert!(header.is_write_only());
//! assert_eq!(body, &[0x42]);
//! ```

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;

pub use codec::{FrameReader, FrameWriter, ReadOutcome, WriteOutcome};
pub use command::{CommandFlags, CommandHeader, encode_command, split_command};
pub use error::{ProtocolError, Result};
pub use frame::{FRAME_HEADER_SIZE, Frame, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, validate_payload_size};
