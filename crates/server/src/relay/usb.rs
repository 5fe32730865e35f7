//! USB side of the frame relay
//!
//! Turns each inbound frame into one Active Servo command. The first payload
//! byte is the command header, the rest is the OUT buffer. Unless the header
//! marks the command write-only, the device reply goes back to the client in
//! a frame from the outbound pool.

use crate::usb::{CommandGateway, GatewaySlot};
use common::{FramePool, LinkStatus, PooledFrame, UsbRelay};
use protocol::{MAX_PAYLOAD_SIZE, split_command};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct UsbWorker {
    relay: UsbRelay,
    outbound: FramePool,
    slot: GatewaySlot,
    link: Arc<LinkStatus>,
    attach_poll: Duration,
}

impl UsbWorker {
    pub fn new(
        relay: UsbRelay,
        outbound: FramePool,
        slot: GatewaySlot,
        link: Arc<LinkStatus>,
        attach_poll: Duration,
    ) -> Self {
        Self {
            relay,
            outbound,
            slot,
            link,
            attach_poll,
        }
    }

    /// Relay frames until the Ethernet side closes the relay or `shutdown`
    /// is set
    pub fn run(self, shutdown: Arc<AtomicBool>) -> common::Result<()> {
        info!("USB worker started");

        loop {
            let Ok(request) = self.relay.recv_request() else {
                // Ethernet side is gone
                break;
            };
            // Looked up per request: the device may have re-attached while
            // this worker was waiting for a frame
            let Some(gateway) = self.wait_for_device(&shutdown) else {
                break;
            };
            if let Err(e) = self.handle_request(&gateway, request) {
                if self.relay.is_closed() || shutdown.load(Ordering::Relaxed) {
                    break;
                }
                return Err(e);
            }
        }

        info!("USB worker stopped");
        Ok(())
    }

    fn wait_for_device(&self, shutdown: &AtomicBool) -> Option<CommandGateway> {
        let mut logged = false;
        loop {
            if shutdown.load(Ordering::Relaxed) || self.relay.is_closed() {
                return None;
            }
            if self.link.usb_connected() {
                if let Some(gateway) = self.slot.get() {
                    return Some(gateway);
                }
            }
            if !logged {
                debug!("Waiting for Active Servo device");
                logged = true;
            }
            thread::sleep(self.attach_poll);
        }
    }

    /// Execute one request; the request slot is released on return
    fn handle_request(
        &self,
        gateway: &CommandGateway,
        request: PooledFrame,
    ) -> common::Result<()> {
        let (header, body) = match split_command(request.payload()) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Dropping request frame: {}", e);
                return Ok(());
            }
        };

        if body.len() > gateway.out_packet_size() {
            warn!(
                "Dropping command of {} bytes, OUT packet size is {}",
                body.len(),
                gateway.out_packet_size()
            );
            return Ok(());
        }

        if header.is_write_only() {
            if let Err(e) = gateway.execute(body, None) {
                warn!("Write-only command failed: {}", e);
            }
            return Ok(());
        }

        let reply_len = gateway.in_packet_size().min(MAX_PAYLOAD_SIZE);
        let mut reply = self.outbound.alloc_blocking()?;
        let result = gateway.execute(body, Some(&mut reply.payload_buf_mut()[..reply_len]));
        drop(request);

        match result {
            Ok(()) => {
                reply.set_payload_size(reply_len)?;
                self.relay.send_reply(reply)
            }
            Err(e) => {
                warn!("Command failed: {}", e);
                Ok(())
            }
        }
    }
}
