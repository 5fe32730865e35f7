//! Synchronous command interface to the servo state machine
//!
//! The state machine only advances when the USB host thread runs it. A
//! [`CommandGateway`] turns that into a blocking call: it takes the
//! availability mutex, puts the command in the single-slot command queue and
//! keeps waking the host with [`HostEvent::ClassEvent`] until the response
//! shows up.

use super::host::HostEvent;
use super::servo::{Command, Response, Status};
use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use bytes::BytesMut;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, trace, warn};

/// Pause before pumping again when the host already has events queued
const PUMP_BACKOFF: Duration = Duration::from_micros(200);

/// Command failed; the cause is logged, not reported
#[derive(Debug, Error)]
#[error("Active Servo command failed")]
pub struct ExecuteError;

/// Handle for submitting commands to an attached device
///
/// Clones share the same mutex and queues.
#[derive(Clone)]
pub struct CommandGateway {
    availability: Arc<Mutex<()>>,
    cmd_tx: Sender<Command>,
    rsp_rx: Receiver<Response>,
    host_events: Sender<HostEvent>,
    out_len: usize,
    in_len: usize,
}

impl CommandGateway {
    pub(crate) fn new(
        cmd_tx: Sender<Command>,
        rsp_rx: Receiver<Response>,
        host_events: Sender<HostEvent>,
        out_len: usize,
        in_len: usize,
    ) -> Self {
        Self {
            availability: Arc::new(Mutex::new(())),
            cmd_tx,
            rsp_rx,
            host_events,
            out_len,
            in_len,
        }
    }

    /// Size of every OUT transfer (OUT endpoint max packet size)
    pub fn out_packet_size(&self) -> usize {
        self.out_len
    }

    /// Size of every IN transfer (IN endpoint max packet size)
    pub fn in_packet_size(&self) -> usize {
        self.in_len
    }

    /// Execute one command and wait for its response
    ///
    /// `out` is zero-padded to [`Self::out_packet_size`]. With `input`, the
    /// device reply is copied into it (truncated to the shorter of the two
    /// lengths). Blocks until the state machine answers; a device that stalls
    /// never answers, and the call only returns once the device detaches.
    pub fn execute(&self, out: &[u8], input: Option<&mut [u8]>) -> Result<(), ExecuteError> {
        if out.len() > self.out_len {
            warn!(
                "Command of {} bytes exceeds OUT packet size {}",
                out.len(),
                self.out_len
            );
            return Err(ExecuteError);
        }

        let _guard = self.availability.lock().map_err(|_| {
            warn!("Command gateway mutex poisoned");
            ExecuteError
        })?;

        let mut out_buf = BytesMut::zeroed(self.out_len);
        out_buf[..out.len()].copy_from_slice(out);
        let command = Command {
            out: out_buf.freeze(),
            input: input.is_some().then(|| BytesMut::zeroed(self.in_len)),
        };

        self.cmd_tx.send_blocking(command).map_err(|_| {
            warn!("Command queue closed");
            ExecuteError
        })?;

        let response = self.wait_response()?;
        if response.status != Status::Ok {
            return Err(ExecuteError);
        }

        if let (Some(dst), Some(src)) = (input, response.input) {
            let len = dst.len().min(src.len());
            dst[..len].copy_from_slice(&src[..len]);
        }
        Ok(())
    }

    fn wait_response(&self) -> Result<Response, ExecuteError> {
        loop {
            match self.rsp_rx.try_recv() {
                Ok(response) => return Ok(response),
                Err(TryRecvError::Closed) => {
                    warn!("Response queue closed, device detached");
                    return Err(ExecuteError);
                }
                Err(TryRecvError::Empty) => {}
            }

            match self.host_events.try_send(HostEvent::ClassEvent) {
                Ok(()) => thread::yield_now(),
                Err(TrySendError::Full(_)) => thread::sleep(PUMP_BACKOFF),
                Err(TrySendError::Closed(_)) => {
                    warn!("USB host stopped while waiting for a response");
                    return Err(ExecuteError);
                }
            }
            trace!("Waiting for Active Servo response");
        }
    }

    #[cfg(test)]
    pub(crate) fn command_sender(&self) -> Sender<Command> {
        self.cmd_tx.clone()
    }

    #[cfg(test)]
    pub(crate) fn response_receiver(&self) -> Receiver<Response> {
        self.rsp_rx.clone()
    }
}

/// Gateway of the currently attached device, if any
///
/// Written by the USB host on attach/detach, read by the USB worker.
#[derive(Clone, Default)]
pub struct GatewaySlot {
    inner: Arc<Mutex<Option<CommandGateway>>>,
}

impl GatewaySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, gateway: CommandGateway) {
        match self.inner.lock() {
            Ok(mut slot) => *slot = Some(gateway),
            Err(_) => error!("Gateway slot mutex poisoned, gateway not published"),
        }
    }

    pub fn clear(&self) {
        match self.inner.lock() {
            Ok(mut slot) => *slot = None,
            Err(_) => error!("Gateway slot mutex poisoned, gateway not cleared"),
        }
    }

    /// A poisoned slot reports no device
    pub fn get(&self) -> Option<CommandGateway> {
        match self.inner.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => {
                error!("Gateway slot mutex poisoned");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::driver::mock::ScriptedDriver;
    use crate::usb::driver::{EndpointInfo, ServoInterface};
    use crate::usb::servo::ServoHandle;

    fn interface() -> ServoInterface {
        ServoInterface {
            number: 0,
            in_ep: EndpointInfo {
                address: 0x82,
                max_packet_size: 64,
            },
            out_ep: EndpointInfo {
                address: 0x02,
                max_packet_size: 64,
            },
        }
    }

    /// Runs the handle whenever an event arrives, like the USB host does
    fn spawn_host(
        driver: ScriptedDriver,
    ) -> (CommandGateway, Sender<HostEvent>, thread::JoinHandle<()>) {
        let (events_tx, events_rx) = async_channel::bounded(16);
        let mut handle = ServoHandle::new(driver, &interface(), events_tx.clone()).unwrap();
        let gateway = handle.gateway();
        let host = thread::spawn(move || {
            while let Ok(event) = events_rx.recv_blocking() {
                if event == HostEvent::Shutdown {
                    break;
                }
                let _ = handle.process();
            }
        });
        (gateway, events_tx, host)
    }

    #[test]
    fn test_execute_write_only() {
        let driver = ScriptedDriver::new();
        let probe = driver.clone();
        let (gateway, events, host) = spawn_host(driver);

        gateway.execute(&[0xAB, 0xCD], None).unwrap();

        events.send_blocking(HostEvent::Shutdown).unwrap();
        host.join().unwrap();
        let log = probe.log();
        assert_eq!(log.sends.len(), 1);
        assert_eq!(&log.sends[0][..3], &[0xAB, 0xCD, 0x00]);
        assert!(log.receives.is_empty());
    }

    #[test]
    fn test_execute_copies_reply_into_caller_buffer() {
        let driver = ScriptedDriver::new();
        driver.push_reply(&[1, 2, 3, 4]);
        let (gateway, events, host) = spawn_host(driver);

        let mut reply = [0xFFu8; 3];
        gateway.execute(&[7], Some(&mut reply)).unwrap();
        assert_eq!(reply, [1, 2, 3]);

        events.send_blocking(HostEvent::Shutdown).unwrap();
        host.join().unwrap();
    }

    #[test]
    fn test_oversized_command_rejected() {
        let driver = ScriptedDriver::new();
        let probe = driver.clone();
        let (gateway, events, host) = spawn_host(driver);

        assert!(gateway.execute(&[0u8; 65], None).is_err());

        events.send_blocking(HostEvent::Shutdown).unwrap();
        host.join().unwrap();
        assert!(probe.log().sends.is_empty());
    }

    #[test]
    fn test_concurrent_callers_pair_responses() {
        let driver = ScriptedDriver::new();
        let probe = driver.clone();
        let (gateway, events, host) = spawn_host(driver);

        let callers: Vec<_> = (0..4u8)
            .map(|id| {
                let gateway = gateway.clone();
                thread::spawn(move || {
                    for seq in 0..10u8 {
                        let mut reply = [0u8; 2];
                        gateway.execute(&[id, seq], Some(&mut reply)).unwrap();
                        // Echo device: every caller gets its own command back
                        assert_eq!(reply, [id, seq]);
                    }
                })
            })
            .collect();

        for caller in callers {
            caller.join().unwrap();
        }

        events.send_blocking(HostEvent::Shutdown).unwrap();
        host.join().unwrap();
        let log = probe.log();
        assert_eq!(log.sends.len(), 40);
        assert_eq!(log.receives.len(), 40);
    }

    #[test]
    fn test_detach_releases_waiting_caller() {
        let driver = ScriptedDriver::new();
        // The OUT transfer never completes
        driver.hang();
        let (gateway, events, host) = spawn_host(driver);

        let caller = {
            let gateway = gateway.clone();
            thread::spawn(move || gateway.execute(&[1], None))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!caller.is_finished());

        // Dropping the handle closes its queues
        events.send_blocking(HostEvent::Shutdown).unwrap();
        host.join().unwrap();
        assert!(caller.join().unwrap().is_err());
    }

    #[test]
    fn test_slot_publish_and_clear() {
        let slot = GatewaySlot::new();
        assert!(slot.get().is_none());

        let (events_tx, _events_rx) = async_channel::bounded(1);
        let handle = ServoHandle::new(ScriptedDriver::new(), &interface(), events_tx).unwrap();
        slot.publish(handle.gateway());
        assert_eq!(slot.get().unwrap().out_packet_size(), 64);

        slot.clear();
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_poisoned_slot_reports_no_device() {
        let slot = GatewaySlot::new();
        let (events_tx, _events_rx) = async_channel::bounded(1);
        let handle = ServoHandle::new(ScriptedDriver::new(), &interface(), events_tx).unwrap();
        slot.publish(handle.gateway());

        let poisoner = slot.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.lock().unwrap();
            panic!("poison the slot");
        })
        .join();

        assert!(slot.inner.is_poisoned());
        assert!(slot.get().is_none());
        slot.publish(handle.gateway());
        slot.clear();
        assert!(slot.get().is_none());
    }
}
