//! Frame queues between the Ethernet worker and the USB worker
//!
//! Two bounded FIFO queues connect the workers:
//!
//! ```text
//! EthRelay ──(requests: ETH→USB)──> UsbRelay
//! EthRelay <──(replies: USB→ETH)─── UsbRelay
//! ```
//!
//! Each queue has a single producer and a single consumer. Frames move by
//! value, so a frame slot has exactly one owner at any time: the sending
//! worker, the queue, or the receiving worker.

use crate::pool::PooledFrame;
use async_channel::{Receiver, Sender, TryRecvError, bounded};

/// Ethernet side of the relay (non-blocking receive, blocking send)
pub struct EthRelay {
    request_tx: Sender<PooledFrame>,
    reply_rx: Receiver<PooledFrame>,
}

impl EthRelay {
    /// Forward a complete inbound frame to the USB worker
    ///
    /// Waits while the request queue is full.
    pub fn send_request(&self, frame: PooledFrame) -> crate::Result<()> {
        self.request_tx
            .send_blocking(frame)
            .map_err(|e| crate::Error::Channel(format!("request queue: {}", e)))
    }

    /// Take the next reply frame if one is queued
    pub fn try_recv_reply(&self) -> crate::Result<Option<PooledFrame>> {
        match self.reply_rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => {
                Err(crate::Error::Channel("reply queue closed".to_string()))
            }
        }
    }

    /// Number of replies waiting to be written
    pub fn pending_replies(&self) -> usize {
        self.reply_rx.len()
    }

    /// Close both queues, waking a USB worker blocked on them
    pub fn close(&self) {
        self.request_tx.close();
        self.reply_rx.close();
    }
}

/// USB side of the relay (blocking on both queues)
pub struct UsbRelay {
    request_rx: Receiver<PooledFrame>,
    reply_tx: Sender<PooledFrame>,
}

impl UsbRelay {
    /// Wait for the next inbound frame
    pub fn recv_request(&self) -> crate::Result<PooledFrame> {
        self.request_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(format!("request queue: {}", e)))
    }

    /// Take the next inbound frame if one is queued
    pub fn try_recv_request(&self) -> Option<PooledFrame> {
        self.request_rx.try_recv().ok()
    }

    /// Queue a reply frame for the Ethernet worker
    ///
    /// Waits while the reply queue is full.
    pub fn send_reply(&self, frame: PooledFrame) -> crate::Result<()> {
        self.reply_tx
            .send_blocking(frame)
            .map_err(|e| crate::Error::Channel(format!("reply queue: {}", e)))
    }

    /// Whether the Ethernet side has shut the relay down
    pub fn is_closed(&self) -> bool {
        self.request_rx.is_closed()
    }
}

/// Create the relay queues, each holding at most `capacity` frames
///
/// Returns (EthRelay for the Ethernet worker, UsbRelay for the USB worker)
pub fn create_relay_channels(capacity: usize) -> (EthRelay, UsbRelay) {
    let (request_tx, request_rx) = bounded(capacity);
    let (reply_tx, reply_rx) = bounded(capacity);

    (
        EthRelay {
            request_tx,
            reply_rx,
        },
        UsbRelay {
            request_rx,
            reply_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FramePool;

    #[test]
    fn test_relay_round_trip() {
        let pool = FramePool::new("test", 2).unwrap();
        let (eth, usb) = create_relay_channels(1);

        let handle = std::thread::spawn(move || {
            let request = usb.recv_request().unwrap();
            let echo = request.payload().to_vec();
            drop(request);
            (usb, echo)
        });

        let mut frame = pool.try_alloc().unwrap();
        frame.set_payload(&[5, 6]).unwrap();
        eth.send_request(frame).unwrap();

        let (usb, echo) = handle.join().unwrap();
        assert_eq!(echo, vec![5, 6]);
        assert_eq!(pool.free_space(), 2);

        assert!(eth.try_recv_reply().unwrap().is_none());
        usb.send_reply(pool.try_alloc().unwrap()).unwrap();
        assert_eq!(eth.pending_replies(), 1);
        assert!(eth.try_recv_reply().unwrap().is_some());
    }

    #[test]
    fn test_close_wakes_usb_side() {
        let (eth, usb) = create_relay_channels(1);
        let handle = std::thread::spawn(move || usb.recv_request().is_err());

        std::thread::sleep(std::time::Duration::from_millis(10));
        eth.close();
        assert!(handle.join().unwrap());
    }
}
