//! Per-device driver task
//!
//! Owns the device's [`CommandSession`] and serialises everything that
//! touches it: caller requests, notifications and the timeout tick all run
//! on this one task.

use crate::connection::manager::DeviceEvent;
use crate::transport::ScaleLink;
use anyhow::{anyhow, Result};
use bluer::Address;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use w8_shared::{timing, CommandOutcome, CommandSession, Params, SessionConfig, SessionError};

/// Configuration for a device driver
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Command session settings
    pub session: SessionConfig,
    /// How often the timeout check runs when nothing arrives
    pub tick_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            tick_interval: Duration::from_millis(timing::TICK_INTERVAL_MS),
        }
    }
}

/// Requests accepted by the driver task
#[derive(Debug)]
pub enum DeviceRequest {
    /// Issue a command and reply with its outcome
    Run {
        command: String,
        params: Params,
        reply: oneshot::Sender<Result<CommandOutcome, SessionError>>,
    },
    /// Close the link and stop the driver
    Disconnect,
}

/// Cloneable handle for talking to a device's driver task
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    address: Address,
    requests: mpsc::Sender<DeviceRequest>,
}

impl DeviceHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Run one command and wait for its outcome
    pub async fn run_command(&self, command: &str, params: Params) -> Result<CommandOutcome> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(DeviceRequest::Run {
                command: command.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| anyhow!("Device {} is no longer connected", self.address))?;

        let outcome = rx
            .await
            .map_err(|_| anyhow!("Device {} stopped before answering", self.address))??;
        Ok(outcome)
    }

    /// Ask the driver to close the link
    pub async fn disconnect(&self) -> Result<()> {
        self.requests
            .send(DeviceRequest::Disconnect)
            .await
            .map_err(|_| anyhow!("Device {} is no longer connected", self.address))
    }
}

/// Spawn the driver task for an established link
pub fn spawn_device<L: ScaleLink>(
    link: L,
    config: DeviceConfig,
    events: mpsc::Sender<DeviceEvent>,
) -> (DeviceHandle, JoinHandle<()>) {
    let address = link.address();
    let (request_tx, request_rx) = mpsc::channel(16);

    let task = tokio::spawn(async move {
        let reason = match drive(&link, config, request_rx).await {
            Ok(reason) => reason,
            Err(e) => {
                error!("[{}] Driver failed: {:#}", address, e);
                format!("{:#}", e)
            }
        };
        let _ = events
            .send(DeviceEvent::Disconnected { address, reason })
            .await;
    });

    let handle = DeviceHandle {
        address,
        requests: request_tx,
    };
    (handle, task)
}

/// Main driver loop; returns the reason it stopped
async fn drive<L: ScaleLink>(
    link: &L,
    config: DeviceConfig,
    mut requests: mpsc::Receiver<DeviceRequest>,
) -> Result<String> {
    let address = link.address();
    let mut notifications = link.notifications().await?;
    let mut session = CommandSession::new(config.session, Vec::<Bytes>::new());

    // Session time is measured from driver start on the monotonic clock
    let started = Instant::now();
    let now_ms = || started.elapsed().as_millis() as u64;

    // The session reports outcomes here; replies are matched by sequence
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<CommandOutcome>();
    let mut waiting: HashMap<u64, oneshot::Sender<Result<CommandOutcome, SessionError>>> =
        HashMap::new();

    let mut ticker = interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("[{}] Ready", address);

    let reason = loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.tick(now_ms());
            }

            request = requests.recv() => match request {
                Some(DeviceRequest::Run { command, params, reply }) => {
                    let tx = outcome_tx.clone();
                    let issued = session.issue(
                        &command,
                        &params,
                        move |outcome| {
                            let _ = tx.send(outcome);
                        },
                        now_ms(),
                    );
                    // Issuing may have expired the previous command
                    deliver(&mut outcome_rx, &mut waiting);

                    match issued {
                        Ok(sequence) => {
                            waiting.insert(sequence, reply);
                        }
                        Err(e) => {
                            warn!("[{}] Command {} not sent: {}", address, command, e);
                            let _ = reply.send(Err(e));
                        }
                    }

                    if let Err(e) = flush(link, &mut session).await {
                        error!("[{}] {:#}", address, e);
                        session.link_lost();
                        deliver(&mut outcome_rx, &mut waiting);
                        break format!("{:#}", e);
                    }
                }
                Some(DeviceRequest::Disconnect) => {
                    session.link_lost();
                    deliver(&mut outcome_rx, &mut waiting);
                    link.disconnect().await?;
                    break "disconnect requested".to_string();
                }
                None => {
                    debug!("[{}] All handles dropped", address);
                    break "all handles dropped".to_string();
                }
            },

            fragment = notifications.next() => match fragment {
                Some(fragment) => {
                    session.on_fragment(&fragment, now_ms());
                }
                None => {
                    session.link_lost();
                    deliver(&mut outcome_rx, &mut waiting);
                    break "notification stream ended".to_string();
                }
            },
        }

        deliver(&mut outcome_rx, &mut waiting);
    };

    info!("[{}] Driver stopped: {}", address, reason);
    Ok(reason)
}

/// Write out whatever the session queued
async fn flush<L: ScaleLink>(link: &L, session: &mut CommandSession<Vec<Bytes>>) -> Result<()> {
    let queued = std::mem::take(session.writer_mut());
    for request in queued {
        link.write(&request).await?;
    }
    Ok(())
}

/// Route finished outcomes to whoever is waiting on that sequence
fn deliver(
    outcomes: &mut mpsc::UnboundedReceiver<CommandOutcome>,
    waiting: &mut HashMap<u64, oneshot::Sender<Result<CommandOutcome, SessionError>>>,
) {
    while let Ok(outcome) = outcomes.try_recv() {
        match waiting.remove(&outcome.sequence()) {
            Some(reply) => {
                let _ = reply.send(Ok(outcome));
            }
            None => warn!("No caller waiting for outcome of seq {}", outcome.sequence()),
        }
    }
}
