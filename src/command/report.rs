//! JSON result printed on stdout

use anyhow::Result;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use w8_shared::{CommandOutcome, Dataset};

/// Result of a run, tagged by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Report {
    Success { data: Dataset },
    Error { error_message: String },
    Timeout { error_message: String },
}

impl Report {
    pub fn from_outcome(outcome: CommandOutcome) -> Self {
        match outcome {
            CommandOutcome::Completed { dataset, .. } => Report::Success { data: dataset },
            CommandOutcome::TimedOut {
                command, elapsed_ms, ..
            } => Report::Timeout {
                error_message: format!("No response to {} after {}ms", command, elapsed_ms),
            },
            CommandOutcome::Failed { command, error, .. } => Report::Error {
                error_message: format!("{} failed: {}", command, error),
            },
        }
    }

    pub fn from_error(error: &anyhow::Error) -> Self {
        Report::Error {
            error_message: format!("{:#}", error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Report::Success { .. })
    }

    /// Pretty JSON with a four space indent
    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        Ok(String::from_utf8(out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use w8_shared::{codec, ProtocolError, Registry};

    fn settings_dataset() -> Dataset {
        let spec = Registry::lookup("READ_SETTINGS").unwrap();
        codec::decode(spec, &[0x7C, 0x15, 0xF8, 0x2A]).unwrap()
    }

    #[test]
    fn test_success_json() {
        let report = Report::from_outcome(CommandOutcome::Completed {
            sequence: 1,
            command: "READ_SETTINGS",
            dataset: settings_dataset(),
        });
        assert!(report.is_success());
        assert_eq!(
            report.to_json().unwrap(),
            "{\n    \"status\": \"success\",\n    \"data\": {\n        \"tara_weight\": 5500,\n        \"full_weight\": 11000\n    }\n}"
        );
    }

    #[test]
    fn test_timeout_json() {
        let report = Report::from_outcome(CommandOutcome::TimedOut {
            sequence: 2,
            command: "READ_STATUS",
            elapsed_ms: 5250,
        });
        assert!(!report.is_success());

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], "timeout");
        assert_eq!(value["error_message"], "No response to READ_STATUS after 5250ms");
    }

    #[test]
    fn test_failure_json() {
        let report = Report::from_outcome(CommandOutcome::Failed {
            sequence: 3,
            command: "READ_DATASET",
            error: ProtocolError::LinkLost,
        });

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(
            value["error_message"],
            "READ_DATASET failed: Link to the device was lost"
        );
    }

    #[test]
    fn test_error_keeps_context_chain() {
        let error = anyhow::anyhow!("le-connection-abort-by-local").context("Connecting to scale");
        let report = Report::from_error(&error);
        assert_eq!(
            report,
            Report::Error {
                error_message: "Connecting to scale: le-connection-abort-by-local".into()
            }
        );
    }
}
