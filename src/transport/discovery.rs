//! Bluetooth LE discovery for finding W8 scales

use anyhow::{anyhow, Result};
use bluer::{Adapter, AdapterEvent, Address, Device};
use futures::StreamExt;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Alias the scale advertises
pub const SCALE_ALIAS: &str = "W8CARAVAN";

/// Configuration for scale discovery
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How long to scan before giving up
    pub scan_duration: Duration,
    /// Device alias to match
    pub alias: String,
    /// Addresses to ignore (already connected)
    pub skip: HashSet<Address>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(30),
            alias: SCALE_ALIAS.into(),
            skip: HashSet::new(),
        }
    }
}

/// A scale found while scanning
#[derive(Debug, Clone)]
pub struct DiscoveredScale {
    /// Bluetooth MAC address
    pub address: Address,
    /// Signal strength (if available)
    pub rssi: Option<i16>,
}

/// Open and power on the named Bluetooth adapter
pub async fn open_adapter(name: &str) -> Result<Adapter> {
    let session = bluer::Session::new().await?;
    let adapter = session
        .adapter(name)
        .map_err(|e| anyhow!("Bluetooth adapter {} not available: {}", name, e))?;
    adapter.set_powered(true).await?;
    debug!("Using adapter {}", adapter.name());
    Ok(adapter)
}

/// Scans for scales by advertised alias
pub struct ScaleDiscovery {
    config: DiscoveryConfig,
}

impl ScaleDiscovery {
    /// Create a new discovery service
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Scan until the first matching scale shows up
    pub async fn find_scale(&self, adapter: &Adapter) -> Result<DiscoveredScale> {
        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        let scan = timeout(self.config.scan_duration, async {
            while let Some(evt) = discover.next().await {
                let AdapterEvent::DeviceAdded(addr) = evt else {
                    continue;
                };
                if self.config.skip.contains(&addr) {
                    continue;
                }

                let Ok(device) = adapter.device(addr) else {
                    continue;
                };
                if self.is_scale_device(&device).await {
                    info!("Discovered matching device with address {}", addr);
                    return Some(DiscoveredScale {
                        address: addr,
                        rssi: device.rssi().await.ok().flatten(),
                    });
                }
            }
            None
        })
        .await;

        match scan {
            Ok(Some(scale)) => Ok(scale),
            Ok(None) => Err(anyhow!("Discovery stream ended without finding a scale")),
            Err(_) => Err(anyhow!(
                "No device named {} found within {}s",
                self.config.alias,
                self.config.scan_duration.as_secs()
            )),
        }
    }

    /// Check if a device is a scale (by alias)
    async fn is_scale_device(&self, device: &Device) -> bool {
        match device.alias().await {
            Ok(alias) if self.matches_alias(&alias) => true,
            Ok(alias) => {
                info!("Found other device, alias={} mac={}", alias, device.address());
                false
            }
            Err(_) => false,
        }
    }

    fn matches_alias(&self, alias: &str) -> bool {
        alias == self.config.alias
    }
}
