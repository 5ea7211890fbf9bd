//! Command-line parsing
//!
//! Global flags come from a derived parser; the subcommands are generated
//! from the command registry so each registered command gets one positional
//! integer argument per request field.

use crate::connection::DeviceConfig;
use crate::transport::{DiscoveryConfig, GattConfig};
use anyhow::{anyhow, Result};
use bluer::Address;
use clap::{Arg, ArgAction, ArgMatches, Command, CommandFactory, FromArgMatches, Parser};
use std::time::Duration;
use w8_shared::{timing, CommandSpec, FieldValue, Params, Registry};

/// Read and program a W8 gas scale
#[derive(Parser, Debug, Clone)]
#[command(name = "w8")]
#[command(about = "Talk to a W8 gas scale over Bluetooth LE")]
pub struct Options {
    /// MAC address of the scale (skips scanning)
    #[arg(long, value_parser = parse_address)]
    pub mac: Option<Address>,

    /// Bluetooth adapter to use
    #[arg(long, default_value = "hci0")]
    pub device: String,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Overall deadline for the run in seconds
    #[arg(long, default_value_t = timing::RUN_TIMEOUT_SECS)]
    pub timeout: u64,
}

/// Everything needed for one run, built from the flags
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mac: Option<Address>,
    pub gatt: GattConfig,
    pub discovery: DiscoveryConfig,
    pub device: DeviceConfig,
    pub run_timeout: Duration,
}

impl Options {
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            mac: self.mac,
            gatt: GattConfig {
                adapter_name: self.device.clone(),
                ..Default::default()
            },
            discovery: DiscoveryConfig::default(),
            device: DeviceConfig::default(),
            run_timeout: Duration::from_secs(self.timeout),
        }
    }

    /// Default tracing directive for the verbosity level
    pub fn log_directive(&self) -> &'static str {
        match self.verbose {
            0 => "error",
            1 => "info",
            _ => "debug",
        }
    }
}

/// A parsed command line
#[derive(Debug)]
pub struct Invocation {
    pub options: Options,
    pub command: &'static CommandSpec,
    pub params: Params,
}

/// Build the full command line, one subcommand per registered command
pub fn cli() -> Command {
    Options::command()
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommands(Registry::specs().map(subcommand))
}

fn subcommand(spec: &'static CommandSpec) -> Command {
    let about = format!("Send {} (opcode 0x{:02x})", spec.name, spec.opcode);
    spec.request_fields.iter().fold(
        Command::new(spec.name.to_lowercase()).about(about),
        |command, field| {
            command.arg(
                Arg::new(field.name)
                    .help(format!("{} value", field.kind))
                    .required(true)
                    .allow_negative_numbers(true)
                    .value_parser(clap::value_parser!(FieldValue)),
            )
        },
    )
}

/// Turn parsed matches into an invocation
pub fn from_matches(matches: &ArgMatches) -> Result<Invocation> {
    let options = Options::from_arg_matches(matches)?;
    let (name, sub) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("No command given"))?;
    let command = Registry::lookup(name)?;

    let mut params = Params::new();
    for field in command.request_fields {
        let value = sub
            .get_one::<FieldValue>(field.name)
            .copied()
            .ok_or_else(|| anyhow!("Missing value for {}", field.name))?;
        params.insert(field.name.to_string(), value);
    }

    Ok(Invocation {
        options,
        command,
        params,
    })
}

fn parse_address(s: &str) -> Result<Address, String> {
    s.parse()
        .map_err(|_| format!("'{}' is not a Bluetooth address (expected XX:XX:XX:XX:XX:XX)", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Invocation> {
        let matches = cli().try_get_matches_from(args)?;
        from_matches(&matches)
    }

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_one_subcommand_per_command() {
        let cli = cli();
        let names: Vec<_> = cli.get_subcommands().map(|c| c.get_name().to_string()).collect();
        assert_eq!(
            names,
            vec!["read_dataset", "read_settings", "read_status", "write_settings"]
        );
    }

    #[test]
    fn test_read_command_without_arguments() {
        let invocation = parse(&["w8", "read_status"]).unwrap();
        assert_eq!(invocation.command.name, "READ_STATUS");
        assert!(invocation.params.is_empty());
        assert_eq!(invocation.options.device, "hci0");
        assert_eq!(invocation.options.timeout, 60);
        assert_eq!(invocation.options.mac, None);
    }

    #[test]
    fn test_write_settings_positional_values() {
        let invocation = parse(&["w8", "write_settings", "5500", "11000"]).unwrap();
        assert_eq!(invocation.command.name, "WRITE_SETTINGS");
        assert_eq!(invocation.params.get("tara_weight"), Some(&5500));
        assert_eq!(invocation.params.get("full_weight"), Some(&11000));
    }

    #[test]
    fn test_write_settings_requires_both_values() {
        assert!(parse(&["w8", "write_settings", "5500"]).is_err());
    }

    #[test]
    fn test_non_numeric_value_rejected() {
        assert!(parse(&["w8", "write_settings", "heavy", "11000"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let invocation = parse(&[
            "w8",
            "--mac",
            "C4:64:E3:01:02:03",
            "--device",
            "hci1",
            "-vv",
            "--timeout",
            "15",
            "read_settings",
        ])
        .unwrap();

        let options = &invocation.options;
        assert_eq!(options.mac, Some(Address::new([0xC4, 0x64, 0xE3, 0x01, 0x02, 0x03])));
        assert_eq!(options.log_directive(), "debug");

        let config = options.run_config();
        assert_eq!(config.gatt.adapter_name, "hci1");
        assert_eq!(config.run_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_bad_mac_rejected() {
        assert!(parse(&["w8", "--mac", "not-a-mac", "read_status"]).is_err());
    }

    #[test]
    fn test_missing_command_rejected() {
        assert!(parse(&["w8"]).is_err());
    }

    #[test]
    fn test_verbosity_levels() {
        let quiet = parse(&["w8", "read_status"]).unwrap();
        let info = parse(&["w8", "-v", "read_status"]).unwrap();
        assert_eq!(quiet.options.log_directive(), "error");
        assert_eq!(info.options.log_directive(), "info");
    }
}
