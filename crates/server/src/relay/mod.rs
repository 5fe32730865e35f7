//! Frame relay between the TCP client and the Active Servo device
//!
//! Three workers, each on its own thread:
//! - [`EthernetWorker`] moves frames between the socket and the relay queues
//! - [`UsbWorker`] turns request frames into device commands
//! - [`StatusWorker`] drives the link indicators

pub mod eth;
pub mod status;
pub mod usb;

pub use eth::EthernetWorker;
pub use status::{LogIndicator, StatusWorker};
pub use usb::UsbWorker;
