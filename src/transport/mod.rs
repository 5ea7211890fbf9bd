//! Bluetooth LE transport for the scale
//!
//! - `discovery`: scanning for scales by alias
//! - `gatt`: the request/notify characteristic pair over BlueZ
//! - `traits`: the link abstraction the connection layer is written against

pub mod discovery;
pub mod gatt;
#[cfg(test)]
pub mod mock;
pub mod traits;

pub use discovery::{open_adapter, DiscoveryConfig, ScaleDiscovery};
pub use gatt::{GattConfig, GattConnector};
pub use traits::{LinkConnector, ScaleLink};
