//! Connectivity flags shared between workers
//!
//! Each flag has exactly one writer: the Ethernet worker owns
//! `ethernet_connected`, the USB host owns `usb_connected`. Every other thread
//! only reads them, typically through [`LinkStatus::snapshot`].

use std::sync::atomic::{AtomicBool, Ordering};

/// Point-in-time view of both links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkSnapshot {
    pub ethernet_connected: bool,
    pub usb_connected: bool,
}

#[derive(Debug, Default)]
pub struct LinkStatus {
    ethernet: AtomicBool,
    usb: AtomicBool,
}

impl LinkStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the Ethernet worker on accept / close
    pub fn set_ethernet_connected(&self, connected: bool) {
        self.ethernet.store(connected, Ordering::Release);
    }

    /// Called by the USB host on attach / detach
    pub fn set_usb_connected(&self, connected: bool) {
        self.usb.store(connected, Ordering::Release);
    }

    pub fn ethernet_connected(&self) -> bool {
        self.ethernet.load(Ordering::Acquire)
    }

    pub fn usb_connected(&self) -> bool {
        self.usb.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            ethernet_connected: self.ethernet_connected(),
            usb_connected: self.usb_connected(),
        }
    }
}
