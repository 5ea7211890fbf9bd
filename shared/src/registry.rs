//! Command table for the W8 scale
//!
//! One entry per command kind the scale understands. Adding a command means
//! adding an entry here; the session, the codec and the CLI pick it up from
//! the table.

use thiserror::Error;

use crate::codec::{CommandSpec, FieldKind::*, FieldSpec};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

// Example response (first 20-byte notification only):
// 490a 4f000000 b95beb5f00000000 cc10 f401 e803
static READ_DATASET: CommandSpec = CommandSpec {
    name: "READ_DATASET",
    opcode: 0x49,
    request_fields: &[],
    response_fields: &[
        FieldSpec::new("serial", U32),
        FieldSpec::new("uptime", U64),
        FieldSpec::new("measured_weight", U16),
        FieldSpec::new("tara_weight", U16),
        FieldSpec::new("full_weight", U16),
        FieldSpec::new("acc_x", I16),
        FieldSpec::new("acc_y", I16),
        FieldSpec::new("acc_z", I16),
        FieldSpec::new("temperature", U8),
        FieldSpec::new("flags", U8),
    ],
};

// 430a 7c15 f82a
static READ_SETTINGS: CommandSpec = CommandSpec {
    name: "READ_SETTINGS",
    opcode: 0x43,
    request_fields: &[],
    response_fields: &[
        FieldSpec::new("tara_weight", U16),
        FieldSpec::new("full_weight", U16),
    ],
};

// 530a 00 64 a461eb5f00000000
static READ_STATUS: CommandSpec = CommandSpec {
    name: "READ_STATUS",
    opcode: 0x53,
    request_fields: &[],
    response_fields: &[
        FieldSpec::new("unknown_1", U8),
        FieldSpec::new("battery_percent", U8),
        FieldSpec::new("uptime", U64),
    ],
};

// Request: 420a bbbb cccc. The scale acknowledges with a bare header.
static WRITE_SETTINGS: CommandSpec = CommandSpec {
    name: "WRITE_SETTINGS",
    opcode: 0x42,
    request_fields: &[
        FieldSpec::new("tara_weight", U16),
        FieldSpec::new("full_weight", U16),
    ],
    response_fields: &[],
};

static COMMANDS: [&CommandSpec; 4] = [&READ_DATASET, &READ_SETTINGS, &READ_STATUS, &WRITE_SETTINGS];

/// Static lookup over the command table
pub struct Registry;

impl Registry {
    /// Find a command by name (ASCII case-insensitive)
    pub fn lookup(name: &str) -> Result<&'static CommandSpec, RegistryError> {
        COMMANDS
            .iter()
            .copied()
            .find(|spec| spec.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| RegistryError::UnknownCommand(name.to_string()))
    }

    /// All commands in table order
    pub fn specs() -> impl Iterator<Item = &'static CommandSpec> {
        COMMANDS.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_lookup_known_command() {
        let spec = Registry::lookup("READ_SETTINGS").expect("lookup failed");
        assert_eq!(spec.opcode, 0x43);
        assert_eq!(spec.response_width(), 4);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let spec = Registry::lookup("read_status").unwrap();
        assert_eq!(spec.name, "READ_STATUS");
    }

    #[test]
    fn test_lookup_unknown_command() {
        let result = Registry::lookup("TARE");
        assert_eq!(result, Err(RegistryError::UnknownCommand("TARE".into())));
    }

    #[test]
    fn test_response_widths() {
        assert_eq!(Registry::lookup("READ_DATASET").unwrap().response_width(), 26);
        assert_eq!(Registry::lookup("READ_STATUS").unwrap().response_width(), 10);
        assert_eq!(Registry::lookup("WRITE_SETTINGS").unwrap().response_width(), 0);
        assert_eq!(Registry::lookup("WRITE_SETTINGS").unwrap().request_width(), 4);
    }

    #[test]
    fn test_opcodes_and_names_are_unique() {
        let opcodes: HashSet<u8> = Registry::specs().map(|s| s.opcode).collect();
        let names: HashSet<&str> = Registry::specs().map(|s| s.name).collect();
        assert_eq!(opcodes.len(), Registry::specs().count());
        assert_eq!(names.len(), Registry::specs().count());
    }
}
