//! Transport trait abstraction for the scale's notification link

use anyhow::Result;
use async_trait::async_trait;
use bluer::Address;
use futures::Stream;
use std::pin::Pin;

/// Notifications from the device, one item per received fragment
pub type FragmentStream<'a> = Pin<Box<dyn Stream<Item = Vec<u8>> + Send + 'a>>;

/// An established link to one scale
#[async_trait]
pub trait ScaleLink: Send + Sync + 'static {
    /// Send one encoded request (write without response)
    async fn write(&self, request: &[u8]) -> Result<()>;

    /// Subscribe to response notifications
    async fn notifications(&self) -> Result<FragmentStream<'_>>;

    /// Close the link gracefully
    async fn disconnect(&self) -> Result<()>;

    /// Address of the remote device
    fn address(&self) -> Address;
}

/// Factory for creating links to scales
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// The link type this connector produces
    type Link: ScaleLink;

    /// Attempt to connect, returning a ready link on success
    async fn connect(&self, address: Address) -> Result<Self::Link>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
