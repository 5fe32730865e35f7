//! Link status indicators
//!
//! Each link drives one indicator:
//! - connected: solid on
//! - disconnected: blinking, toggled every blink interval
//! - on the connected -> disconnected edge the indicator goes off and the
//!   blink timer restarts
//!
//! The worker only reads [`LinkStatus`]; it never writes shared state.

use common::{LinkSnapshot, LinkStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, trace};

/// Output driven by the status worker
pub trait Indicator: Send {
    fn set(&mut self, on: bool);
}

/// Indicator that reports its state through the log
pub struct LogIndicator {
    name: &'static str,
}

impl LogIndicator {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Indicator for LogIndicator {
    fn set(&mut self, on: bool) {
        trace!("{} indicator {}", self.name, if on { "on" } else { "off" });
    }
}

/// Blink policy for one link
struct LinkIndicator<I: Indicator> {
    name: &'static str,
    indicator: I,
    blink: Duration,
    connected: bool,
    lit: bool,
    last_toggle: Instant,
}

impl<I: Indicator> LinkIndicator<I> {
    fn new(name: &'static str, indicator: I, blink: Duration, now: Instant) -> Self {
        Self {
            name,
            indicator,
            blink,
            connected: false,
            lit: false,
            last_toggle: now,
        }
    }

    fn update(&mut self, connected: bool, now: Instant) {
        match (self.connected, connected) {
            (true, false) => {
                info!("{} link down", self.name);
                self.set(false);
                self.last_toggle = now;
            }
            (false, true) => {
                info!("{} link up", self.name);
                self.set(true);
            }
            (false, false) => {
                if now.duration_since(self.last_toggle) >= self.blink {
                    self.set(!self.lit);
                    self.last_toggle = now;
                }
            }
            (true, true) => {}
        }
        self.connected = connected;
    }

    fn set(&mut self, on: bool) {
        self.lit = on;
        self.indicator.set(on);
    }
}

pub struct StatusWorker<E: Indicator, U: Indicator> {
    link: Arc<LinkStatus>,
    ethernet: LinkIndicator<E>,
    usb: LinkIndicator<U>,
}

impl<E: Indicator, U: Indicator> StatusWorker<E, U> {
    pub fn new(
        link: Arc<LinkStatus>,
        ethernet: E,
        usb: U,
        ethernet_blink: Duration,
        usb_blink: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            link,
            ethernet: LinkIndicator::new("Ethernet", ethernet, ethernet_blink, now),
            usb: LinkIndicator::new("USB", usb, usb_blink, now),
        }
    }

    /// Apply one observation of both links
    pub fn update(&mut self, snapshot: LinkSnapshot, now: Instant) {
        self.ethernet.update(snapshot.ethernet_connected, now);
        self.usb.update(snapshot.usb_connected, now);
    }

    pub fn run(mut self, poll: Duration, shutdown: Arc<AtomicBool>) -> common::Result<()> {
        info!("Status worker started");
        while !shutdown.load(Ordering::Relaxed) {
            let snapshot = self.link.snapshot();
            self.update(snapshot, Instant::now());
            thread::sleep(poll);
        }
        info!("Status worker stopped");
        Ok(())
    }
}
