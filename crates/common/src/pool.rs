//! Fixed-capacity frame pool
//!
//! All frames are allocated up front. The free list is a bounded channel
//! holding exactly `capacity` frames, so "allocate" is a receive and "free" is
//! a send that can never overflow. A [`PooledFrame`] guard owns its frame
//! exclusively and hands it back to the pool when dropped, so a slot returns
//! the moment its last owner lets go of it.

use async_channel::{Receiver, Sender, TryRecvError, bounded};
use protocol::Frame;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::trace;

struct PoolShared {
    name: &'static str,
    capacity: usize,
    free_tx: Sender<Frame>,
    free_rx: Receiver<Frame>,
}

/// Pool of preallocated frames
///
/// Cloning the pool yields another handle to the same slots.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

impl FramePool {
    /// Preallocate `capacity` frames
    pub fn new(name: &'static str, capacity: usize) -> crate::Result<Self> {
        if capacity == 0 {
            return Err(crate::Error::Pool(format!(
                "pool '{}' needs at least one slot",
                name
            )));
        }

        let (free_tx, free_rx) = bounded(capacity);
        for _ in 0..capacity {
            free_tx
                .try_send(Frame::new())
                .map_err(|e| crate::Error::Pool(format!("pool '{}': {}", name, e)))?;
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                name,
                capacity,
                free_tx,
                free_rx,
            }),
        })
    }

    /// Pool name, used in logs
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of slots currently free
    pub fn free_space(&self) -> usize {
        self.shared.free_rx.len()
    }

    /// Take a free slot without waiting
    ///
    /// Returns `None` when every slot is in use.
    pub fn try_alloc(&self) -> Option<PooledFrame> {
        match self.shared.free_rx.try_recv() {
            Ok(frame) => Some(self.wrap(frame)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Take a free slot, waiting until one is released
    pub fn alloc_blocking(&self) -> crate::Result<PooledFrame> {
        let frame = self
            .shared
            .free_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Pool(format!("pool '{}': {}", self.shared.name, e)))?;
        Ok(self.wrap(frame))
    }

    fn wrap(&self, frame: Frame) -> PooledFrame {
        trace!(
            "Allocated frame from pool '{}' ({} free)",
            self.shared.name,
            self.free_space()
        );
        PooledFrame {
            frame: Some(frame),
            pool: self.shared.clone(),
        }
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("free", &self.free_space())
            .finish()
    }
}

/// Exclusive ownership of one pool slot
pub struct PooledFrame {
    frame: Option<Frame>,
    pool: Arc<PoolShared>,
}

impl PooledFrame {
    /// Name of the pool this slot belongs to
    pub fn pool_name(&self) -> &'static str {
        self.pool.name
    }
}

impl Deref for PooledFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // Only `Drop` takes the frame out
        self.frame.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut Frame {
        self.frame.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(mut frame) = self.frame.take() {
            frame.clear();
            // The free list has room for every slot, so this cannot be full
            let _ = self.pool.free_tx.try_send(frame);
            trace!(
                "Released frame to pool '{}' ({} free)",
                self.pool.name,
                self.pool.free_rx.len()
            );
        }
    }
}

impl std::fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFrame")
            .field("pool", &self.pool.name)
            .field("frame", &self.frame)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(FramePool::new("empty", 0).is_err());
    }

    #[test]
    fn test_alloc_until_exhausted() {
        let pool = FramePool::new("test", 2).unwrap();
        assert_eq!(pool.free_space(), 2);

        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert_eq!(pool.free_space(), 0);
        assert!(pool.try_alloc().is_none());

        drop(a);
        assert_eq!(pool.free_space(), 1);
        drop(b);
        assert_eq!(pool.free_space(), 2);
    }

    #[test]
    fn test_released_frame_is_cleared() {
        let pool = FramePool::new("test", 1).unwrap();
        let mut frame = pool.try_alloc().unwrap();
        frame.set_payload(&[1, 2, 3]).unwrap();
        drop(frame);

        let frame = pool.try_alloc().unwrap();
        assert_eq!(frame.payload_size(), 0);
        assert_eq!(frame.pool_name(), "test");
    }

    #[test]
    fn test_alloc_blocking_waits_for_release() {
        let pool = FramePool::new("test", 1).unwrap();
        let held = pool.try_alloc().unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.alloc_blocking().map(|_| ()))
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(pool.free_space(), 1);
    }
}
