//! Connection management for scales
//!
//! Each connected scale gets its own driver task owning one command session.
//! The manager keeps the table of running drivers and reports their
//! lifecycle as [`DeviceEvent`]s.

mod device;
mod manager;

pub use device::DeviceConfig;
pub use manager::{DeviceEvent, DeviceManager};
