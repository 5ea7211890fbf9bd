mod command;
mod connection;
mod transport;

use anyhow::{anyhow, Context, Result};
use bluer::Address;
use command::{Invocation, Report, RunConfig};
use connection::{DeviceEvent, DeviceManager};
use std::future::Future;
use std::process::ExitCode;
use std::time::Duration;
use transport::{open_adapter, GattConnector, LinkConnector, ScaleDiscovery};
use w8_shared::CommandOutcome;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let matches = command::cli().get_matches();
    let invocation = match command::from_matches(&matches) {
        Ok(invocation) => invocation,
        Err(e) => return print_report(&Report::from_error(&e)),
    };

    // Logs go to stderr; stdout carries only the JSON report
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(invocation.options.log_directive()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = invocation.options.run_config();
    info!(
        "Running {} on adapter {}",
        invocation.command.name, config.gatt.adapter_name
    );

    let manager = DeviceManager::new(GattConnector::new(config.gatt.clone()), config.device.clone());
    let report = run_with_deadline(
        &manager,
        config.run_timeout,
        run(&invocation, &config, &manager),
    )
    .await;

    print_report(&report)
}

fn print_report(report: &Report) -> ExitCode {
    match report.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!("Failed to render report: {:#}", e);
            return ExitCode::FAILURE;
        }
    }

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Drive `run` under `deadline`, then close every link the run opened
async fn run_with_deadline<C, F>(manager: &DeviceManager<C>, deadline: Duration, run: F) -> Report
where
    C: LinkConnector,
    F: Future<Output = Result<CommandOutcome>>,
{
    let report = match tokio::time::timeout(deadline, run).await {
        Ok(Ok(outcome)) => Report::from_outcome(outcome),
        Ok(Err(e)) => {
            error!("{:#}", e);
            Report::from_error(&e)
        }
        Err(_) => {
            warn!("Run deadline of {}s expired", deadline.as_secs());
            Report::Timeout {
                error_message: format!("Run did not finish within {}s", deadline.as_secs()),
            }
        }
    };

    manager.disconnect_all().await;
    report
}

/// Find the scale, connect and run the command
async fn run<C: LinkConnector>(
    invocation: &Invocation,
    config: &RunConfig,
    manager: &DeviceManager<C>,
) -> Result<CommandOutcome> {
    let address = match config.mac {
        Some(address) => address,
        None => {
            let adapter = open_adapter(&config.gatt.adapter_name).await?;
            let scale = ScaleDiscovery::new(config.discovery.clone())
                .find_scale(&adapter)
                .await?;
            info!("Using scale {} (rssi {:?})", scale.address, scale.rssi);
            scale.address
        }
    };

    let device = manager
        .add_device(address)
        .await
        .with_context(|| format!("Connecting to {}", address))?;
    debug!("{} scale(s) connected", manager.count().await);

    tokio::select! {
        biased;

        outcome = device.run_command(invocation.command.name, invocation.params.clone()) => outcome,
        reason = wait_for_disconnect(manager, address) => {
            Err(anyhow!("Scale {} disconnected: {}", device.address(), reason))
        }
    }
}

/// Log device events until `address` disconnects; returns the reason
async fn wait_for_disconnect<C: LinkConnector>(manager: &DeviceManager<C>, address: Address) -> String {
    while let Some(event) = manager.next_event().await {
        match event {
            DeviceEvent::Ready { address } => info!("Scale {} ready", address),
            DeviceEvent::ConnectFailed { address, reason } => {
                warn!("Connecting to {} failed: {}", address, reason)
            }
            DeviceEvent::Disconnected { address: a, reason } if a == address => return reason,
            DeviceEvent::Disconnected { address, reason } => {
                warn!("Scale {} disconnected: {}", address, reason)
            }
        }
    }
    "event channel closed".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DeviceConfig;
    use crate::transport::mock::{test_address, MockConnector, Script};
    use w8_shared::{Params, SessionConfig};

    fn slow_device_config() -> DeviceConfig {
        DeviceConfig {
            session: SessionConfig { timeout_ms: 60_000 },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_expired_deadline_still_disconnects() {
        let manager = DeviceManager::new(MockConnector::new(Script::new()), slow_device_config());
        let address = test_address(1);
        let device = manager.add_device(address).await.unwrap();
        assert_eq!(manager.next_event().await, Some(DeviceEvent::Ready { address }));

        let report = run_with_deadline(
            &manager,
            Duration::from_millis(50),
            device.run_command("READ_STATUS", Params::new()),
        )
        .await;

        assert!(matches!(report, Report::Timeout { .. }));
        assert_eq!(manager.count().await, 0);
        assert_eq!(
            manager.next_event().await,
            Some(DeviceEvent::Disconnected {
                address,
                reason: "disconnect requested".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_finished_run_disconnects() {
        let manager = DeviceManager::new(MockConnector::new(Script::new()), slow_device_config());
        let address = test_address(2);
        manager.add_device(address).await.unwrap();

        let report = run_with_deadline(&manager, Duration::from_secs(5), async {
            Err(anyhow!("no scale"))
        })
        .await;

        assert_eq!(
            report,
            Report::Error {
                error_message: "no scale".to_string()
            }
        );
        assert_eq!(manager.count().await, 0);
    }
}
