//! In-memory scale link for driver and manager tests

use crate::transport::traits::{FragmentStream, LinkConnector, ScaleLink};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::Address;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Canned responses keyed by request opcode, already split into fragments
pub type Script = HashMap<u8, Vec<Vec<u8>>>;

/// Test side of a mock link
pub struct MockLink {
    address: Address,
    written: mpsc::UnboundedSender<Vec<u8>>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    disconnects: Arc<AtomicUsize>,
}

/// Device side of a mock link
pub struct MockPeer {
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
    pub notify: mpsc::UnboundedSender<Vec<u8>>,
    pub disconnects: Arc<AtomicUsize>,
}

pub fn pair(address: Address) -> (MockLink, MockPeer) {
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let disconnects = Arc::new(AtomicUsize::new(0));

    let link = MockLink {
        address,
        written: written_tx,
        notifications: Mutex::new(Some(notify_rx)),
        disconnects: disconnects.clone(),
    };
    let peer = MockPeer {
        written: written_rx,
        notify: notify_tx,
        disconnects,
    };
    (link, peer)
}

impl MockPeer {
    /// Answer every request whose opcode is in `script`, ignore the rest
    pub fn answer_with(mut self, script: Script) -> JoinHandle<Self> {
        tokio::spawn(async move {
            while let Some(request) = self.written.recv().await {
                let Some(fragments) = script.get(&request[0]) else {
                    continue;
                };
                for fragment in fragments {
                    if self.notify.send(fragment.clone()).is_err() {
                        return self;
                    }
                }
            }
            self
        })
    }
}

#[async_trait]
impl ScaleLink for MockLink {
    async fn write(&self, request: &[u8]) -> Result<()> {
        self.written
            .send(request.to_vec())
            .map_err(|_| anyhow!("mock peer gone"))
    }

    async fn notifications(&self) -> Result<FragmentStream<'_>> {
        let rx = self
            .notifications
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("already subscribed"))?;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|fragment| (fragment, rx))
        })))
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn address(&self) -> Address {
        self.address
    }
}

/// Connector handing out scripted mock links
pub struct MockConnector {
    script: Script,
    fail: bool,
    pub connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            fail: false,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Script::new())
        }
    }
}

#[async_trait]
impl LinkConnector for MockConnector {
    type Link = MockLink;

    async fn connect(&self, address: Address) -> Result<MockLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("Connection to {} failed: le-connection-abort-by-local", address));
        }
        let (link, peer) = pair(address);
        drop(peer.answer_with(self.script.clone()));
        Ok(link)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

pub fn settings_script() -> Script {
    Script::from([
        (0x43, vec![vec![0x43, 0x0A, 0x7C, 0x15], vec![0xF8, 0x2A]]),
        (0x42, vec![vec![0x42, 0x0A]]),
    ])
}

pub fn test_address(last: u8) -> Address {
    Address::new([0xC4, 0x64, 0xE3, 0x00, 0x00, last])
}
