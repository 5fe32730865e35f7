//! USB host background context
//!
//! One `usb-host` thread owns the attached device's [`ServoHandle`] and is
//! the only thread that ever runs its state machine. It sleeps on the host
//! event queue:
//!
//! - [`HostEvent::Tick`] comes from the `usb-sof` ticker. Every
//!   `probe_every` ticks the host checks for attach/detach.
//! - [`HostEvent::ClassEvent`] is posted by a [`CommandGateway`] waiting for
//!   a response.
//! - [`HostEvent::Shutdown`] destroys the handle and ends the thread.
//!
//! Both `Tick` and `ClassEvent` run one state machine step.
//!
//! [`CommandGateway`]: super::gateway::CommandGateway

use super::driver::{BulkDriver, DriverError, ServoInterface};
use super::gateway::GatewaySlot;
use super::servo::ServoHandle;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use common::LinkStatus;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Tick,
    ClassEvent,
    Shutdown,
}

/// Device presence as seen by the host
pub trait HostPort: Send {
    type Driver: BulkDriver;

    /// Look for an Active Servo device and open it
    ///
    /// Returns `Ok(None)` when no matching device is present.
    fn probe(&mut self) -> Result<Option<(Self::Driver, ServoInterface)>, DriverError>;

    /// Whether the device behind `driver` is still connected
    fn is_attached(&mut self, driver: &Self::Driver) -> bool;
}

pub struct UsbHost<P: HostPort> {
    port: P,
    events_tx: Sender<HostEvent>,
    events_rx: Receiver<HostEvent>,
    link: Arc<LinkStatus>,
    slot: GatewaySlot,
    class: Option<ServoHandle<P::Driver>>,
    probe_every: u32,
    ticks: u32,
}

impl<P: HostPort> UsbHost<P> {
    /// Create the host and its event queue
    ///
    /// Presence is checked on every `probe_every`-th tick.
    pub fn new(
        port: P,
        event_queue_size: usize,
        probe_every: u32,
        link: Arc<LinkStatus>,
        slot: GatewaySlot,
    ) -> Self {
        let (events_tx, events_rx) = bounded(event_queue_size.max(1));
        Self {
            port,
            events_tx,
            events_rx,
            link,
            slot,
            class: None,
            probe_every: probe_every.max(1),
            ticks: 0,
        }
    }

    /// Sender for ticks, shutdown requests and gateway pumps
    pub fn events(&self) -> Sender<HostEvent> {
        self.events_tx.clone()
    }

    /// Run the event loop until [`HostEvent::Shutdown`]
    pub fn run(mut self) -> common::Result<()> {
        info!("USB host started");

        while let Ok(event) = self.events_rx.recv_blocking() {
            match event {
                HostEvent::Shutdown => {
                    info!("USB host shutting down");
                    break;
                }
                HostEvent::Tick => {
                    self.poll_port();
                    self.process_class();
                }
                HostEvent::ClassEvent => self.process_class(),
            }
        }

        self.detach();
        info!("USB host stopped");
        Ok(())
    }

    fn poll_port(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % self.probe_every != 0 {
            return;
        }

        match &self.class {
            Some(class) => {
                if !self.port.is_attached(class.driver()) {
                    info!("Active Servo device detached");
                    self.detach();
                }
            }
            None => match self.port.probe() {
                Ok(Some((driver, interface))) => self.attach(driver, &interface),
                Ok(None) => {}
                Err(e) => debug!("Device probe failed: {}", e),
            },
        }
    }

    fn attach(&mut self, driver: P::Driver, interface: &ServoInterface) {
        match ServoHandle::new(driver, interface, self.events_tx.clone()) {
            Ok(handle) => {
                info!(
                    "Active Servo device attached (interface {}, OUT {:#04x}, IN {:#04x})",
                    interface.number, interface.out_ep.address, interface.in_ep.address
                );
                self.slot.publish(handle.gateway());
                self.class = Some(handle);
                self.link.set_usb_connected(true);
            }
            Err(e) => warn!("Failed to initialize Active Servo interface: {}", e),
        }
    }

    fn detach(&mut self) {
        if let Some(class) = self.class.take() {
            self.slot.clear();
            self.link.set_usb_connected(false);
            // Dropping the handle closes its pipes and queues
            drop(class);
        }
    }

    fn process_class(&mut self) {
        if let Some(class) = self.class.as_mut() {
            if let Err(e) = class.process() {
                warn!("Active Servo step failed: {}", e);
            }
        }
    }
}

/// Post a [`HostEvent::Tick`] every `interval` until the host stops
///
/// A full event queue already guarantees the host will wake, so a tick that
/// does not fit is dropped.
pub fn spawn_sof_ticker(
    events: Sender<HostEvent>,
    interval: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("usb-sof".to_string())
        .spawn(move || {
            loop {
                thread::sleep(interval);
                match events.try_send(HostEvent::Tick) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            debug!("SOF ticker stopped");
        })
}
