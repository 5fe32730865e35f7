//! Bulk transfer driver interface
//!
//! The servo state machine never talks to libusb directly. It drives pipes
//! through [`BulkDriver`], which mirrors the primitives of a USB host
//! controller: pipes are allocated and opened per endpoint, a transfer is
//! submitted without waiting, and its URB state is polled on later ticks.

use std::fmt;
use thiserror::Error;

/// Host channel number assigned to an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub u8);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe{}", self.0)
    }
}

/// Endpoint descriptor fields needed to drive a bulk pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address, bit 7 set for IN
    pub address: u8,
    pub max_packet_size: u16,
}

/// Active Servo interface as discovered on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoInterface {
    pub number: u8,
    pub in_ep: EndpointInfo,
    pub out_ep: EndpointInfo,
}

/// Completion state of the last transfer submitted on a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbState {
    /// Nothing submitted, or the transfer is still in progress
    Idle,
    Done,
    /// Device answered NAK; resubmit the same transfer
    NotReady,
    Error,
    Stall,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no free host channel for endpoint {0:#04x}")]
    NoFreePipe(u8),

    #[error("{0} is not allocated")]
    UnknownPipe(PipeId),

    #[error("{0} is not open")]
    PipeClosed(PipeId),

    #[error("device disconnected")]
    NoDevice,

    #[error("libusb: {0}")]
    Usb(#[from] rusb::Error),
}

/// Host controller primitives consumed by the servo state machine
///
/// Submissions return as soon as the transfer is queued. Progress is observed
/// through [`BulkDriver::urb_state`].
pub trait BulkDriver: Send {
    /// Reserve a host channel for `endpoint`
    fn alloc_pipe(&mut self, endpoint: u8) -> Result<PipeId, DriverError>;

    /// Configure an allocated channel for bulk transfers on `endpoint`
    fn open_pipe(&mut self, pipe: PipeId, endpoint: &EndpointInfo) -> Result<(), DriverError>;

    fn close_pipe(&mut self, pipe: PipeId) -> Result<(), DriverError>;

    fn free_pipe(&mut self, pipe: PipeId) -> Result<(), DriverError>;

    /// Submit a bulk OUT transfer of `data`
    fn bulk_send(&mut self, pipe: PipeId, data: &[u8]) -> Result<(), DriverError>;

    /// Submit a bulk IN transfer of up to `len` bytes
    fn bulk_receive(&mut self, pipe: PipeId, len: usize) -> Result<(), DriverError>;

    /// Poll the state of the last transfer on `pipe`
    fn urb_state(&mut self, pipe: PipeId) -> UrbState;

    /// Copy the data of a completed IN transfer into `buf`, returning its length
    fn take_received(&mut self, pipe: PipeId, buf: &mut [u8]) -> usize;

    /// Force the data toggle of `pipe` for the next transfer
    fn set_toggle(&mut self, pipe: PipeId, toggle: u8);
}

#[cfg(test)]
pub mod mock {
    //! Scripted driver for state machine tests

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard};

    /// Everything the driver saw and everything it will answer
    #[derive(Debug, Default)]
    pub struct DriverLog {
        pub allocated: Vec<(PipeId, u8)>,
        pub opened: Vec<PipeId>,
        pub closed: Vec<PipeId>,
        pub freed: Vec<PipeId>,
        pub sends: Vec<Vec<u8>>,
        pub receives: Vec<usize>,
        pub toggles: Vec<(PipeId, u8)>,
        /// URB states returned for the OUT pipe; `Done` once exhausted
        pub out_script: VecDeque<UrbState>,
        /// URB states returned for the IN pipe; `Done` once exhausted
        pub in_script: VecDeque<UrbState>,
        /// Payloads returned by IN transfers; echoes the last send once exhausted
        pub replies: VecDeque<Vec<u8>>,
        /// Report `Idle` instead of `Done` once a script is exhausted
        pub hang: bool,
    }

    /// Driver double sharing its log with the test through an `Arc`
    #[derive(Clone, Default)]
    pub struct ScriptedDriver {
        log: Arc<Mutex<DriverLog>>,
        endpoints: HashMap<PipeId, u8>,
    }

    impl ScriptedDriver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn log(&self) -> MutexGuard<'_, DriverLog> {
            self.log.lock().unwrap()
        }

        pub fn script_out(&self, states: &[UrbState]) {
            self.log().out_script.extend(states.iter().copied());
        }

        pub fn script_in(&self, states: &[UrbState]) {
            self.log().in_script.extend(states.iter().copied());
        }

        /// Never complete a transfer unless scripted
        pub fn hang(&self) {
            self.log().hang = true;
        }

        pub fn push_reply(&self, data: &[u8]) {
            self.log().replies.push_back(data.to_vec());
        }

        fn is_in(&self, pipe: PipeId) -> bool {
            self.endpoints.get(&pipe).is_some_and(|ep| ep & 0x80 != 0)
        }
    }

    impl BulkDriver for ScriptedDriver {
        fn alloc_pipe(&mut self, endpoint: u8) -> Result<PipeId, DriverError> {
            let pipe = PipeId(self.endpoints.len() as u8);
            self.endpoints.insert(pipe, endpoint);
            self.log().allocated.push((pipe, endpoint));
            Ok(pipe)
        }

        fn open_pipe(&mut self, pipe: PipeId, _endpoint: &EndpointInfo) -> Result<(), DriverError> {
            self.log().opened.push(pipe);
            Ok(())
        }

        fn close_pipe(&mut self, pipe: PipeId) -> Result<(), DriverError> {
            self.log().closed.push(pipe);
            Ok(())
        }

        fn free_pipe(&mut self, pipe: PipeId) -> Result<(), DriverError> {
            self.log().freed.push(pipe);
            Ok(())
        }

        fn bulk_send(&mut self, _pipe: PipeId, data: &[u8]) -> Result<(), DriverError> {
            self.log().sends.push(data.to_vec());
            Ok(())
        }

        fn bulk_receive(&mut self, _pipe: PipeId, len: usize) -> Result<(), DriverError> {
            self.log().receives.push(len);
            Ok(())
        }

        fn urb_state(&mut self, pipe: PipeId) -> UrbState {
            let is_in = self.is_in(pipe);
            let mut log = self.log();
            let fallback = if log.hang {
                UrbState::Idle
            } else {
                UrbState::Done
            };
            let script = if is_in {
                &mut log.in_script
            } else {
                &mut log.out_script
            };
            script.pop_front().unwrap_or(fallback)
        }

        fn take_received(&mut self, _pipe: PipeId, buf: &mut [u8]) -> usize {
            let mut log = self.log();
            let data = match log.replies.pop_front() {
                Some(data) => data,
                None => log.sends.last().cloned().unwrap_or_default(),
            };
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            len
        }

        fn set_toggle(&mut self, pipe: PipeId, toggle: u8) {
            self.log().toggles.push((pipe, toggle));
        }
    }
}
