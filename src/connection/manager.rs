//! Table of connected scales and their driver tasks

use crate::connection::device::{spawn_device, DeviceConfig, DeviceHandle};
use crate::transport::LinkConnector;
use anyhow::{anyhow, Result};
use bluer::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Events emitted by the device manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Link established and driver running
    Ready { address: Address },
    /// Could not connect to the device
    ConnectFailed { address: Address, reason: String },
    /// Driver stopped and the link is gone
    Disconnected { address: Address, reason: String },
}

struct DeviceEntry {
    handle: DeviceHandle,
    task: JoinHandle<()>,
}

/// Manages connections to any number of scales
pub struct DeviceManager<C: LinkConnector> {
    connector: C,
    config: DeviceConfig,
    /// Map of address -> running driver
    devices: Arc<RwLock<HashMap<Address, DeviceEntry>>>,
    event_tx: mpsc::Sender<DeviceEvent>,
    event_rx: Mutex<mpsc::Receiver<DeviceEvent>>,
}

impl<C: LinkConnector> DeviceManager<C> {
    /// Create a manager connecting through `connector`
    pub fn new(connector: C, config: DeviceConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);
        Self {
            connector,
            config,
            devices: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Mutex::new(event_rx),
        }
    }

    /// Connect to a device and start its driver
    ///
    /// Adding an address that is already connected returns the existing handle.
    pub async fn add_device(&self, address: Address) -> Result<DeviceHandle> {
        if let Some(handle) = self.get(address).await {
            return Ok(handle);
        }

        info!("Connecting to {} via {}", address, self.connector.name());
        let link = match self.connector.connect(address).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Failed to connect to {}: {:#}", address, e);
                self.emit(DeviceEvent::ConnectFailed {
                    address,
                    reason: format!("{:#}", e),
                })
                .await;
                return Err(e);
            }
        };

        let (handle, task) = spawn_device(link, self.config.clone(), self.event_tx.clone());
        let mut devices = self.devices.write().await;
        devices.insert(
            address,
            DeviceEntry {
                handle: handle.clone(),
                task,
            },
        );
        drop(devices);

        self.emit(DeviceEvent::Ready { address }).await;
        Ok(handle)
    }

    /// Disconnect a device and wait for its driver to stop
    pub async fn disconnect(&self, address: Address) -> Result<()> {
        let entry = self
            .devices
            .write()
            .await
            .remove(&address)
            .ok_or_else(|| anyhow!("Device not connected: {}", address))?;

        entry.handle.disconnect().await?;
        entry.task.await?;
        Ok(())
    }

    /// Disconnect every device
    pub async fn disconnect_all(&self) {
        for address in self.connected_devices().await {
            if let Err(e) = self.disconnect(address).await {
                warn!("Disconnecting {} failed: {:#}", address, e);
            }
        }
    }

    /// Wait for the next device event
    pub async fn next_event(&self) -> Option<DeviceEvent> {
        let event = self.event_rx.lock().await.recv().await?;
        if let DeviceEvent::Disconnected { address, reason } = &event {
            if self.devices.write().await.remove(address).is_some() {
                info!("Device {} dropped: {}", address, reason);
            }
        }
        Some(event)
    }

    /// Get the handle for a connected device
    pub async fn get(&self, address: Address) -> Option<DeviceHandle> {
        let devices = self.devices.read().await;
        devices.get(&address).map(|e| e.handle.clone())
    }

    /// Get list of all connected addresses
    pub async fn connected_devices(&self) -> Vec<Address> {
        self.devices.read().await.keys().copied().collect()
    }

    /// Get the number of connected devices
    pub async fn count(&self) -> usize {
        self.devices.read().await.len()
    }

    async fn emit(&self, event: DeviceEvent) {
        // The receiver lives in self, so this only fails if the queue is closed
        let _ = self.event_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{settings_script, test_address, MockConnector};
    use std::sync::atomic::Ordering;
    use w8_shared::{CommandOutcome, Params};

    fn manager(connector: MockConnector) -> DeviceManager<MockConnector> {
        DeviceManager::new(connector, DeviceConfig::default())
    }

    #[tokio::test]
    async fn test_add_device_emits_ready() {
        let manager = manager(MockConnector::new(settings_script()));
        let address = test_address(1);

        manager.add_device(address).await.unwrap();

        assert_eq!(manager.count().await, 1);
        assert_eq!(manager.next_event().await, Some(DeviceEvent::Ready { address }));
    }

    #[tokio::test]
    async fn test_add_device_is_idempotent() {
        let manager = manager(MockConnector::new(settings_script()));
        let address = test_address(2);

        manager.add_device(address).await.unwrap();
        manager.add_device(address).await.unwrap();

        assert_eq!(manager.count().await, 1);
        assert_eq!(manager.connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let manager = manager(MockConnector::failing());
        let address = test_address(3);

        assert!(manager.add_device(address).await.is_err());
        assert_eq!(manager.count().await, 0);
        match manager.next_event().await {
            Some(DeviceEvent::ConnectFailed { address: a, reason }) => {
                assert_eq!(a, address);
                assert!(reason.contains("le-connection-abort-by-local"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_devices_run_independently() {
        let manager = manager(MockConnector::new(settings_script()));
        let first = manager.add_device(test_address(4)).await.unwrap();
        let second = manager.add_device(test_address(5)).await.unwrap();

        let (a, b) = tokio::join!(
            first.run_command("READ_SETTINGS", Params::new()),
            second.run_command("READ_SETTINGS", Params::new()),
        );
        assert!(matches!(a.unwrap(), CommandOutcome::Completed { .. }));
        assert!(matches!(b.unwrap(), CommandOutcome::Completed { .. }));

        let mut connected = manager.connected_devices().await;
        connected.sort();
        assert_eq!(connected, vec![test_address(4), test_address(5)]);
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry() {
        let manager = manager(MockConnector::new(settings_script()));
        let address = test_address(6);
        manager.add_device(address).await.unwrap();
        assert_eq!(manager.next_event().await, Some(DeviceEvent::Ready { address }));

        manager.disconnect(address).await.unwrap();

        assert_eq!(manager.count().await, 0);
        assert!(manager.get(address).await.is_none());
        assert!(matches!(
            manager.next_event().await,
            Some(DeviceEvent::Disconnected { address: a, .. }) if a == address
        ));
        assert!(manager.disconnect(address).await.is_err());
    }
}
