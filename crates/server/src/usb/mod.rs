//! USB subsystem
//!
//! The Active Servo device is driven by a state machine
//! ([`servo::ServoHandle`]) owned by the USB host thread ([`UsbHost`]).
//! Other threads reach it only through a [`CommandGateway`].

pub mod driver;
pub mod gateway;
pub mod host;
pub mod rusb_driver;
pub mod servo;

pub use gateway::{CommandGateway, GatewaySlot};
pub use host::{HostEvent, UsbHost, spawn_sof_ticker};
pub use rusb_driver::{DeviceFilter, RusbPort};
