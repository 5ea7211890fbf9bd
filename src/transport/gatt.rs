//! GATT transport for the W8 scale using BlueZ
//!
//! The scale exposes two characteristics of interest:
//! - `00001235-...` write without response; requests go here
//! - `00001236-...` notify/read; responses arrive here as notifications

use crate::transport::discovery::open_adapter;
use crate::transport::traits::{FragmentStream, LinkConnector, ScaleLink};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Address, Device, Uuid};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

/// Leading 32 bits of the request characteristic UUID
pub const WRITE_CHARACTERISTIC_PREFIX: u32 = 0x0000_1235;

/// Leading 32 bits of the response characteristic UUID
pub const NOTIFY_CHARACTERISTIC_PREFIX: u32 = 0x0000_1236;

/// Configuration for GATT connections
#[derive(Debug, Clone)]
pub struct GattConfig {
    /// Name of the local Bluetooth adapter
    pub adapter_name: String,
    /// Connect and service resolution timeout
    pub connect_timeout: Duration,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            adapter_name: "hci0".into(),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

/// Connected scale with resolved request/response characteristics
pub struct GattLink {
    device: Device,
    write_char: Characteristic,
    notify_char: Characteristic,
}

#[async_trait]
impl ScaleLink for GattLink {
    async fn write(&self, request: &[u8]) -> Result<()> {
        self.write_char
            .write(request)
            .await
            .map_err(|e| anyhow!("GATT write to {} failed: {}", self.device.address(), e))
    }

    async fn notifications(&self) -> Result<FragmentStream<'_>> {
        let stream = self.notify_char.notify().await?;
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) -> Result<()> {
        self.device.disconnect().await?;
        info!("Disconnected from {}", self.device.address());
        Ok(())
    }

    fn address(&self) -> Address {
        self.device.address()
    }
}

/// Connects to scales over BLE GATT
pub struct GattConnector {
    config: GattConfig,
}

impl GattConnector {
    /// Create a new GATT connector
    pub fn new(config: GattConfig) -> Self {
        Self { config }
    }

    async fn wait_for_services(&self, device: &Device) -> Result<()> {
        let deadline = Instant::now() + self.config.connect_timeout;
        while !device.is_services_resolved().await? {
            if Instant::now() >= deadline {
                return Err(anyhow!("Services of {} not resolved in time", device.address()));
            }
            sleep(Duration::from_millis(100)).await;
        }
        debug!("Resolved services");
        Ok(())
    }
}

#[async_trait]
impl LinkConnector for GattConnector {
    type Link = GattLink;

    async fn connect(&self, address: Address) -> Result<GattLink> {
        let adapter = open_adapter(&self.config.adapter_name).await?;
        let device = adapter.device(address)?;

        if !device.is_connected().await? {
            debug!("Connecting to {}...", address);
            timeout(self.config.connect_timeout, device.connect())
                .await
                .map_err(|_| anyhow!("Connection to {} timed out", address))?
                .map_err(|e| anyhow!("Connection to {} failed: {}", address, e))?;
        }
        info!("Connected to {}", address);

        self.wait_for_services(&device).await?;
        let (write_char, notify_char) = resolve_characteristics(&device).await?;

        Ok(GattLink {
            device,
            write_char,
            notify_char,
        })
    }

    fn name(&self) -> &'static str {
        "GATT"
    }
}

/// Find the request and response characteristics among the device's services
async fn resolve_characteristics(device: &Device) -> Result<(Characteristic, Characteristic)> {
    let mut write_char = None;
    let mut notify_char = None;

    for service in device.services().await? {
        debug!("Service [{}]", service.uuid().await?);
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            debug!("   Characteristic [{}]", uuid);
            match uuid_prefix(uuid) {
                WRITE_CHARACTERISTIC_PREFIX => write_char = Some(characteristic),
                NOTIFY_CHARACTERISTIC_PREFIX => notify_char = Some(characteristic),
                _ => {}
            }
        }
    }

    match (write_char, notify_char) {
        (Some(write), Some(notify)) => Ok((write, notify)),
        (None, _) => Err(anyhow!("{} has no request characteristic", device.address())),
        (_, None) => Err(anyhow!("{} has no response characteristic", device.address())),
    }
}

fn uuid_prefix(uuid: Uuid) -> u32 {
    (uuid.as_u128() >> 96) as u32
}
