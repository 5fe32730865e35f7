//! Active Servo command state machine
//!
//! A [`ServoHandle`] owns the two bulk pipes of an attached Active Servo
//! interface and executes one [`Command`] at a time:
//!
//! ```text
//! IDLE ──cmd──> WRITING ──DONE, write-only──> IDLE
//!                  │
//!                  └──DONE──> READING ──DONE──> IDLE
//!
//! WRITING/READING ──STALL──> ERROR (terminal until the device re-attaches)
//! ```
//!
//! [`ServoHandle::process`] performs one non-blocking step and is called
//! repeatedly by the USB host thread. Callers never touch the handle; they go
//! through the [`CommandGateway`] obtained from [`ServoHandle::gateway`].

use super::driver::{BulkDriver, DriverError, EndpointInfo, PipeId, ServoInterface, UrbState};
use super::gateway::CommandGateway;
use super::host::HostEvent;
use async_channel::{Receiver, Sender, TryRecvError, bounded};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Endpoint bound to an open host pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeEndpoint {
    pub address: u8,
    pub max_packet_size: u16,
    pub pipe: PipeId,
}

/// One command for the device
///
/// `input` is `None` for a write-only command. Otherwise it is the buffer the
/// device reply is read into; it travels back inside the [`Response`].
#[derive(Debug)]
pub struct Command {
    pub out: Bytes,
    pub input: Option<BytesMut>,
}

impl Command {
    pub fn expects_reply(&self) -> bool {
        self.input.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Err,
}

/// Answer to exactly one [`Command`]
#[derive(Debug)]
pub struct Response {
    pub status: Status,
    pub input: Option<BytesMut>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoState {
    Idle,
    Writing,
    Reading,
    Error,
}

#[derive(Debug, Error)]
pub enum ServoError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("endpoint stalled while {0:?}")]
    Stall(ServoState),

    #[error("response queue: {0}")]
    ResponseQueue(String),
}

/// State machine handle for one attached device
pub struct ServoHandle<D: BulkDriver> {
    driver: D,
    in_ep: PipeEndpoint,
    out_ep: PipeEndpoint,
    cmd_rx: Receiver<Command>,
    rsp_tx: Sender<Response>,
    gateway: CommandGateway,
    /// `None` until the first step
    state: Option<ServoState>,
    next_state: ServoState,
    written: bool,
    reading: bool,
    current: Option<Command>,
}

impl<D: BulkDriver> ServoHandle<D> {
    /// Allocate and open both pipes of `interface`
    ///
    /// `host_events` is the queue the gateway pumps while a caller waits for
    /// its response.
    pub fn new(
        mut driver: D,
        interface: &ServoInterface,
        host_events: Sender<HostEvent>,
    ) -> Result<Self, DriverError> {
        let out_ep = open_endpoint(&mut driver, &interface.out_ep)?;
        let in_ep = match open_endpoint(&mut driver, &interface.in_ep) {
            Ok(ep) => ep,
            Err(e) => {
                release_endpoint(&mut driver, &out_ep);
                return Err(e);
            }
        };

        debug!(
            "Active Servo pipes open: OUT {:#04x} ({} bytes) on {}, IN {:#04x} ({} bytes) on {}",
            out_ep.address,
            out_ep.max_packet_size,
            out_ep.pipe,
            in_ep.address,
            in_ep.max_packet_size,
            in_ep.pipe
        );

        let (cmd_tx, cmd_rx) = bounded(1);
        let (rsp_tx, rsp_rx) = bounded(1);
        let gateway = CommandGateway::new(
            cmd_tx,
            rsp_rx,
            host_events,
            usize::from(out_ep.max_packet_size),
            usize::from(in_ep.max_packet_size),
        );

        Ok(Self {
            driver,
            in_ep,
            out_ep,
            cmd_rx,
            rsp_tx,
            gateway,
            state: None,
            next_state: ServoState::Idle,
            written: false,
            reading: false,
            current: None,
        })
    }

    /// Gateway for submitting commands to this handle
    pub fn gateway(&self) -> CommandGateway {
        self.gateway.clone()
    }

    /// Current state, `None` before the first step
    #[cfg(test)]
    pub fn state(&self) -> Option<ServoState> {
        self.state
    }

    #[cfg(test)]
    pub fn in_endpoint(&self) -> &PipeEndpoint {
        &self.in_ep
    }

    #[cfg(test)]
    pub fn out_endpoint(&self) -> &PipeEndpoint {
        &self.out_ep
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Run one step: apply a pending transition, then the current state's `Do`
    pub fn process(&mut self) -> Result<(), ServoError> {
        let state = match self.state {
            None => {
                self.next_state = ServoState::Idle;
                self.enter(ServoState::Idle);
                ServoState::Idle
            }
            Some(state) if state != self.next_state => {
                let next = self.next_state;
                debug!("Servo state {:?} -> {:?}", state, next);
                self.exit(state);
                self.enter(next);
                next
            }
            Some(state) => state,
        };
        self.state = Some(state);

        match state {
            ServoState::Idle => self.step_idle(),
            ServoState::Writing => self.step_writing(),
            ServoState::Reading => self.step_reading(),
            ServoState::Error => Ok(()),
        }
    }

    fn enter(&mut self, state: ServoState) {
        match state {
            ServoState::Idle => {}
            ServoState::Writing => self.written = false,
            ServoState::Reading => self.reading = false,
            ServoState::Error => {}
        }
    }

    fn exit(&mut self, state: ServoState) {
        match state {
            ServoState::Idle | ServoState::Writing | ServoState::Reading | ServoState::Error => {}
        }
    }

    fn step_idle(&mut self) -> Result<(), ServoError> {
        match self.cmd_rx.try_recv() {
            Ok(command) => {
                trace!(
                    "Command received: {} bytes out, reply {}",
                    command.out.len(),
                    command.expects_reply()
                );
                self.current = Some(command);
                self.next_state = ServoState::Writing;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {}
        }
        Ok(())
    }

    fn step_writing(&mut self) -> Result<(), ServoError> {
        let Some(command) = self.current.as_ref() else {
            warn!("WRITING without a command, returning to IDLE");
            self.next_state = ServoState::Idle;
            return Ok(());
        };

        if !self.written {
            self.written = true;
            self.driver.bulk_send(self.out_ep.pipe, &command.out)?;
            return Ok(());
        }

        match self.driver.urb_state(self.out_ep.pipe) {
            UrbState::Done => {
                if command.expects_reply() {
                    self.next_state = ServoState::Reading;
                } else {
                    self.respond(Status::Ok)?;
                    self.next_state = ServoState::Idle;
                }
            }
            UrbState::NotReady => {
                trace!("OUT {} not ready, resubmitting", self.out_ep.pipe);
                self.written = false;
            }
            UrbState::Stall => return Err(self.stall(ServoState::Writing)),
            UrbState::Idle | UrbState::Error => {}
        }
        Ok(())
    }

    fn step_reading(&mut self) -> Result<(), ServoError> {
        let Some(input) = self.current.as_mut().and_then(|c| c.input.as_mut()) else {
            warn!("READING without an input buffer, returning to IDLE");
            self.next_state = ServoState::Idle;
            return Ok(());
        };

        if !self.reading {
            input.fill(0);
            let len = input.len();
            self.driver.set_toggle(self.in_ep.pipe, 1);
            self.reading = true;
            self.driver.bulk_receive(self.in_ep.pipe, len)?;
            return Ok(());
        }

        match self.driver.urb_state(self.in_ep.pipe) {
            UrbState::Done => {
                let received = self.driver.take_received(self.in_ep.pipe, input);
                trace!("IN {} completed with {} bytes", self.in_ep.pipe, received);
                self.respond(Status::Ok)?;
                self.next_state = ServoState::Idle;
            }
            UrbState::Stall => return Err(self.stall(ServoState::Reading)),
            UrbState::Idle | UrbState::NotReady | UrbState::Error => {}
        }
        Ok(())
    }

    /// Hand the current command's buffer back with `status`
    fn respond(&mut self, status: Status) -> Result<(), ServoError> {
        let input = self.current.take().and_then(|c| c.input);
        self.rsp_tx
            .try_send(Response { status, input })
            .map_err(|e| ServoError::ResponseQueue(e.to_string()))
    }

    /// Enter ERROR without running any transition hooks
    fn stall(&mut self, during: ServoState) -> ServoError {
        warn!(
            "Active Servo endpoint stalled while {:?}; handle is in ERROR until re-attach",
            during
        );
        self.state = Some(ServoState::Error);
        self.next_state = ServoState::Error;
        ServoError::Stall(during)
    }
}

impl<D: BulkDriver> Drop for ServoHandle<D> {
    fn drop(&mut self) {
        if self.current.take().is_some() {
            // Fail the command in flight
            let _ = self.rsp_tx.try_send(Response {
                status: Status::Err,
                input: None,
            });
        }
        release_endpoint(&mut self.driver, &self.out_ep);
        release_endpoint(&mut self.driver, &self.in_ep);
        debug!("Active Servo pipes released");
    }
}

fn open_endpoint<D: BulkDriver>(
    driver: &mut D,
    endpoint: &EndpointInfo,
) -> Result<PipeEndpoint, DriverError> {
    let pipe = driver.alloc_pipe(endpoint.address)?;
    if let Err(e) = driver.open_pipe(pipe, endpoint) {
        let _ = driver.free_pipe(pipe);
        return Err(e);
    }
    Ok(PipeEndpoint {
        address: endpoint.address,
        max_packet_size: endpoint.max_packet_size,
        pipe,
    })
}

fn release_endpoint<D: BulkDriver>(driver: &mut D, endpoint: &PipeEndpoint) {
    if let Err(e) = driver.close_pipe(endpoint.pipe) {
        warn!("Failed to close {}: {}", endpoint.pipe, e);
    }
    if let Err(e) = driver.free_pipe(endpoint.pipe) {
        warn!("Failed to free {}: {}", endpoint.pipe, e);
    }
}
