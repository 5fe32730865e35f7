//! libusb implementation of the driver interfaces
//!
//! libusb transfers are synchronous here: a submission runs the transfer with
//! a short timeout and records the outcome as the pipe's URB state. An OUT
//! transfer that times out reports `NotReady`, so the state machine resubmits
//! it. An IN transfer that times out stays pending and is retried every time
//! its URB state is polled.

use super::driver::{BulkDriver, DriverError, EndpointInfo, PipeId, ServoInterface, UrbState};
use super::host::HostPort;
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Host channels available to one device
const MAX_PIPES: usize = 16;

/// Which devices the host is allowed to claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    /// `None` matches any vendor
    pub vendor_id: Option<u16>,
    /// `None` matches any product
    pub product_id: Option<u16>,
    /// Interface class of the Active Servo interface
    pub class_code: u8,
}

impl DeviceFilter {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|vid| vid == vendor_id)
            && self.product_id.is_none_or(|pid| pid == product_id)
    }
}

/// Summary of one enumerated device, for `--list-devices`
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: Option<ServoInterface>,
}

/// Map a libusb transfer error to the URB state the host controller reports
pub fn map_transfer_error(err: rusb::Error) -> UrbState {
    match err {
        rusb::Error::Timeout | rusb::Error::Busy => UrbState::NotReady,
        rusb::Error::Pipe => UrbState::Stall,
        _ => UrbState::Error,
    }
}

#[derive(Debug)]
struct PipeSlot {
    endpoint: u8,
    open: bool,
    state: UrbState,
    /// Length of an IN transfer that has not completed yet
    pending_in: Option<usize>,
    received: Vec<u8>,
}

impl PipeSlot {
    fn new(endpoint: u8) -> Self {
        Self {
            endpoint,
            open: false,
            state: UrbState::Idle,
            pending_in: None,
            received: Vec::new(),
        }
    }
}

/// Host channel table
#[derive(Debug)]
struct PipeTable {
    slots: Vec<Option<PipeSlot>>,
}

impl PipeTable {
    fn new() -> Self {
        Self {
            slots: (0..MAX_PIPES).map(|_| None).collect(),
        }
    }

    fn alloc(&mut self, endpoint: u8) -> Result<PipeId, DriverError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(DriverError::NoFreePipe(endpoint))?;
        self.slots[index] = Some(PipeSlot::new(endpoint));
        Ok(PipeId(index as u8))
    }

    fn get_mut(&mut self, pipe: PipeId) -> Result<&mut PipeSlot, DriverError> {
        self.slots
            .get_mut(usize::from(pipe.0))
            .and_then(Option::as_mut)
            .ok_or(DriverError::UnknownPipe(pipe))
    }

    fn get_open(&mut self, pipe: PipeId) -> Result<&mut PipeSlot, DriverError> {
        let slot = self.get_mut(pipe)?;
        if !slot.open {
            return Err(DriverError::PipeClosed(pipe));
        }
        Ok(slot)
    }

    fn free(&mut self, pipe: PipeId) -> Result<(), DriverError> {
        match self.slots.get_mut(usize::from(pipe.0)) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(DriverError::UnknownPipe(pipe)),
        }
    }
}

/// Bulk driver over a claimed libusb interface
pub struct RusbDriver {
    handle: DeviceHandle<Context>,
    interface: u8,
    bus_number: u8,
    address: u8,
    timeout: Duration,
    pipes: PipeTable,
}

impl RusbDriver {
    fn new(handle: DeviceHandle<Context>, interface: u8, timeout: Duration) -> Self {
        let device = handle.device();
        Self {
            bus_number: device.bus_number(),
            address: device.address(),
            handle,
            interface,
            timeout,
            pipes: PipeTable::new(),
        }
    }

    /// Attempt the pending IN transfer on `pipe`, if any
    fn poll_read(&mut self, pipe: PipeId) {
        let Ok(slot) = self.pipes.get_open(pipe) else {
            return;
        };
        let Some(len) = slot.pending_in else {
            return;
        };

        let mut buf = vec![0u8; len];
        match self.handle.read_bulk(slot.endpoint, &mut buf, self.timeout) {
            Ok(n) => {
                buf.truncate(n);
                trace!("Bulk IN {:#04x}: {} bytes", slot.endpoint, n);
                slot.received = buf;
                slot.state = UrbState::Done;
                slot.pending_in = None;
            }
            Err(rusb::Error::Timeout) => {}
            Err(e) => {
                debug!("Bulk IN {:#04x} failed: {}", slot.endpoint, e);
                slot.state = map_transfer_error(e);
                slot.pending_in = None;
            }
        }
    }
}

impl BulkDriver for RusbDriver {
    fn alloc_pipe(&mut self, endpoint: u8) -> Result<PipeId, DriverError> {
        self.pipes.alloc(endpoint)
    }

    fn open_pipe(&mut self, pipe: PipeId, endpoint: &EndpointInfo) -> Result<(), DriverError> {
        let slot = self.pipes.get_mut(pipe)?;
        slot.endpoint = endpoint.address;
        slot.open = true;
        slot.state = UrbState::Idle;
        Ok(())
    }

    fn close_pipe(&mut self, pipe: PipeId) -> Result<(), DriverError> {
        let slot = self.pipes.get_mut(pipe)?;
        slot.open = false;
        slot.pending_in = None;
        Ok(())
    }

    fn free_pipe(&mut self, pipe: PipeId) -> Result<(), DriverError> {
        self.pipes.free(pipe)
    }

    fn bulk_send(&mut self, pipe: PipeId, data: &[u8]) -> Result<(), DriverError> {
        let slot = self.pipes.get_open(pipe)?;
        slot.state = match self.handle.write_bulk(slot.endpoint, data, self.timeout) {
            Ok(n) => {
                if n < data.len() {
                    warn!(
                        "Short bulk OUT on {:#04x}: {} of {} bytes",
                        slot.endpoint,
                        n,
                        data.len()
                    );
                }
                trace!("Bulk OUT {:#04x}: {} bytes", slot.endpoint, n);
                UrbState::Done
            }
            Err(rusb::Error::NoDevice) => {
                slot.state = UrbState::Error;
                return Err(DriverError::NoDevice);
            }
            Err(e) => {
                debug!("Bulk OUT {:#04x} failed: {}", slot.endpoint, e);
                map_transfer_error(e)
            }
        };
        Ok(())
    }

    fn bulk_receive(&mut self, pipe: PipeId, len: usize) -> Result<(), DriverError> {
        let slot = self.pipes.get_open(pipe)?;
        slot.state = UrbState::Idle;
        slot.received.clear();
        slot.pending_in = Some(len);
        self.poll_read(pipe);
        Ok(())
    }

    fn urb_state(&mut self, pipe: PipeId) -> UrbState {
        self.poll_read(pipe);
        self.pipes
            .get_mut(pipe)
            .map(|slot| slot.state)
            .unwrap_or(UrbState::Error)
    }

    fn take_received(&mut self, pipe: PipeId, buf: &mut [u8]) -> usize {
        let Ok(slot) = self.pipes.get_mut(pipe) else {
            return 0;
        };
        let len = slot.received.len().min(buf.len());
        buf[..len].copy_from_slice(&slot.received[..len]);
        slot.received.clear();
        len
    }

    fn set_toggle(&mut self, pipe: PipeId, toggle: u8) {
        // libusb keeps the data toggle itself
        trace!("Data toggle {} requested on {}", toggle, pipe);
    }
}

impl Drop for RusbDriver {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("Failed to release interface {}: {}", self.interface, e);
        }
    }
}

/// Device discovery over a libusb context
pub struct RusbPort {
    context: Context,
    filter: DeviceFilter,
    timeout: Duration,
}

impl RusbPort {
    pub fn new(filter: DeviceFilter, timeout: Duration) -> Result<Self, DriverError> {
        Ok(Self {
            context: Context::new()?,
            filter,
            timeout,
        })
    }

    /// Enumerate devices matching the vendor/product filter
    pub fn list_devices(&self) -> Result<Vec<DeviceSummary>, DriverError> {
        let mut devices = Vec::new();
        for device in self.context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if !self
                .filter
                .matches(descriptor.vendor_id(), descriptor.product_id())
            {
                continue;
            }
            devices.push(DeviceSummary {
                bus_number: device.bus_number(),
                address: device.address(),
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                interface: find_servo_interface(&device, self.filter.class_code),
            });
        }
        Ok(devices)
    }
}

impl HostPort for RusbPort {
    type Driver = RusbDriver;

    fn probe(&mut self) -> Result<Option<(RusbDriver, ServoInterface)>, DriverError> {
        for device in self.context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if !self
                .filter
                .matches(descriptor.vendor_id(), descriptor.product_id())
            {
                continue;
            }
            let Some(interface) = find_servo_interface(&device, self.filter.class_code) else {
                continue;
            };

            debug!(
                "Opening {:04x}:{:04x} on bus {:03} device {:03}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                device.bus_number(),
                device.address()
            );
            let handle = device.open()?;
            claim_interface(&handle, interface.number)?;
            return Ok(Some((
                RusbDriver::new(handle, interface.number, self.timeout),
                interface,
            )));
        }
        Ok(None)
    }

    fn is_attached(&mut self, driver: &RusbDriver) -> bool {
        let present = self.context.devices().map(|list| {
            list.iter()
                .map(|d| (d.bus_number(), d.address()))
                .collect::<Vec<_>>()
        });
        still_present(present, (driver.bus_number, driver.address))
    }
}

/// Whether `location` (bus, address) is in the enumerated device list
///
/// A failed enumeration counts as present.
fn still_present(devices: rusb::Result<Vec<(u8, u8)>>, location: (u8, u8)) -> bool {
    match devices {
        Ok(list) => list.contains(&location),
        Err(e) => {
            warn!("Device enumeration failed, keeping device attached: {}", e);
            true
        }
    }
}

/// Find the first interface with `class_code` that has a bulk IN and a bulk
/// OUT endpoint
pub fn find_servo_interface<T: UsbContext>(
    device: &Device<T>,
    class_code: u8,
) -> Option<ServoInterface> {
    let config = device.active_config_descriptor().ok()?;
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != class_code {
                continue;
            }

            let mut in_ep = None;
            let mut out_ep = None;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                let info = EndpointInfo {
                    address: endpoint.address(),
                    max_packet_size: endpoint.max_packet_size(),
                };
                match endpoint.direction() {
                    Direction::In => {
                        in_ep.get_or_insert(info);
                    }
                    Direction::Out => {
                        out_ep.get_or_insert(info);
                    }
                }
            }

            if let (Some(in_ep), Some(out_ep)) = (in_ep, out_ep) {
                return Some(ServoInterface {
                    number: descriptor.interface_number(),
                    in_ep,
                    out_ep,
                });
            }
        }
    }
    None
}

/// Detach any kernel driver bound to `interface` and claim it
fn claim_interface(handle: &DeviceHandle<Context>, interface: u8) -> Result<(), DriverError> {
    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {}", interface);
            if let Err(e) = handle.detach_kernel_driver(interface) {
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface, e
                );
            }
        }
        Ok(false) => {}
        Err(e) => debug!(
            "Could not check kernel driver status for interface {}: {}",
            interface, e
        ),
    }

    handle.claim_interface(interface).map_err(|e| {
        warn!("Failed to claim interface {}: {}", interface, e);
        DriverError::from(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_transfer_error() {
        assert_eq!(map_transfer_error(rusb::Error::Timeout), UrbState::NotReady);
        assert_eq!(map_transfer_error(rusb::Error::Pipe), UrbState::Stall);
        assert_eq!(map_transfer_error(rusb::Error::NoDevice), UrbState::Error);
        assert_eq!(map_transfer_error(rusb::Error::Overflow), UrbState::Error);
    }

    #[test]
    fn test_enumeration_failure_keeps_device_attached() {
        assert!(still_present(Err(rusb::Error::Io), (1, 4)));
        assert!(still_present(Err(rusb::Error::NoMem), (1, 4)));
    }

    #[test]
    fn test_missing_device_reports_detach() {
        assert!(still_present(Ok(vec![(1, 2), (1, 4)]), (1, 4)));
        assert!(!still_present(Ok(vec![(1, 2), (2, 4)]), (1, 4)));
        assert!(!still_present(Ok(Vec::new()), (1, 4)));
    }

    #[test]
    fn test_filter_wildcards() {
        let any = DeviceFilter {
            vendor_id: None,
            product_id: None,
            class_code: 0xFF,
        };
        assert!(any.matches(0x1234, 0x5678));

        let vendor = DeviceFilter {
            vendor_id: Some(0x0483),
            ..any
        };
        assert!(vendor.matches(0x0483, 0x0001));
        assert!(!vendor.matches(0x0484, 0x0001));

        let exact = DeviceFilter {
            product_id: Some(0x5740),
            ..vendor
        };
        assert!(exact.matches(0x0483, 0x5740));
        assert!(!exact.matches(0x0483, 0x5741));
    }

    #[test]
    fn test_pipe_table_exhaustion_and_reuse() {
        let mut table = PipeTable::new();
        let pipes: Vec<_> = (0..MAX_PIPES)
            .map(|i| table.alloc(i as u8).unwrap())
            .collect();
        assert!(matches!(table.alloc(0x81), Err(DriverError::NoFreePipe(0x81))));

        table.free(pipes[3]).unwrap();
        assert_eq!(table.alloc(0x81).unwrap(), PipeId(3));
        assert!(table.free(PipeId(MAX_PIPES as u8)).is_err());
    }

    #[test]
    fn test_pipe_must_be_open_for_transfers() {
        let mut table = PipeTable::new();
        let pipe = table.alloc(0x01).unwrap();
        assert!(matches!(table.get_open(pipe), Err(DriverError::PipeClosed(_))));

        table.get_mut(pipe).unwrap().open = true;
        assert!(table.get_open(pipe).is_ok());

        table.free(pipe).unwrap();
        assert!(matches!(table.get_mut(pipe), Err(DriverError::UnknownPipe(_))));
    }
}
