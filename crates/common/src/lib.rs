//! Common utilities for eth2usb
//!
//! This crate provides the plumbing shared by the bridge workers: the
//! fixed-capacity frame pool, the bounded relay queues between the Ethernet
//! and USB workers, the connectivity flags read by the status worker, error
//! handling, and logging setup.

pub mod channel;
pub mod error;
pub mod logging;
pub mod pool;
pub mod status;

pub use channel::{EthRelay, UsbRelay, create_relay_channels};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use pool::{FramePool, PooledFrame};
pub use status::{LinkSnapshot, LinkStatus};
