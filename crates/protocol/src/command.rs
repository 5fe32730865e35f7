//! Active Servo command header
//!
//! Every inbound frame starts with a one-byte command header. Bit 0 marks a
//! write-only command (the device sends no reply); bits 1..7 are reserved and
//! passed through untouched. The bytes after the header are the body that is
//! sent to the device's bulk OUT endpoint.

use crate::error::{ProtocolError, Result};
use bitflags::bitflags;

bitflags! {
    /// Command header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        /// No reply is expected from the device
        const WRITE_ONLY = 1 << 0;
    }
}

/// Decoded command header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    flags: CommandFlags,
}

impl CommandHeader {
    /// Header for a command that expects a reply
    pub const fn read_write() -> Self {
        Self {
            flags: CommandFlags::empty(),
        }
    }

    /// Header for a fire-and-forget command
    pub const fn write_only() -> Self {
        Self {
            flags: CommandFlags::WRITE_ONLY,
        }
    }

    /// Decode a header byte, keeping reserved bits
    pub fn from_byte(byte: u8) -> Self {
        Self {
            flags: CommandFlags::from_bits_retain(byte),
        }
    }

    /// Encode the header byte
    pub fn to_byte(self) -> u8 {
        self.flags.bits()
    }

    /// Whether the device is expected to answer
    pub fn is_write_only(self) -> bool {
        self.flags.contains(CommandFlags::WRITE_ONLY)
    }

    /// Reserved bits (1..7)
    pub fn reserved(self) -> u8 {
        self.flags.bits() & !CommandFlags::WRITE_ONLY.bits()
    }
}

/// Split a frame payload into its command header and body
pub fn split_command(payload: &[u8]) -> Result<(CommandHeader, &[u8])> {
    let (&first, body) = payload.split_first().ok_or(ProtocolError::EmptyCommand)?;
    Ok((CommandHeader::from_byte(first), body))
}

/// Build a command payload from a header and a body
pub fn encode_command(header: CommandHeader, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(header.to_byte());
    payload.extend_from_slice(body);
    payload
}
