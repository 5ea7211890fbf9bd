//! W8 Scale Protocol Engine
//!
//! This crate provides the command/response protocol spoken by the W8 gas
//! scale over its GATT notification link: request framing, response
//! reassembly, opcode correlation and timeout recovery.
//!
//! Nothing in here performs I/O. The surrounding event loop hands the
//! session fragments and clock ticks, and the session hands encoded
//! requests to a [`session::RequestWriter`].

pub mod assembler;
pub mod codec;
pub mod registry;
pub mod session;

pub use assembler::{Assembly, FramingError, ResponseAssembler};
pub use codec::{CodecError, CommandSpec, Dataset, FieldKind, FieldSpec, FieldValue, Params};
pub use registry::{Registry, RegistryError};
pub use session::{
    CommandOutcome, CommandSession, FragmentDisposition, ProtocolError, RequestWriter,
    SessionConfig, SessionError,
};

/// Timing parameters for the command protocol
pub mod timing {
    /// How long a command may wait for its response before it is dropped
    pub const COMMAND_TIMEOUT_MS: u64 = 5000;

    /// Interval at which the driver runs the timeout check without traffic
    pub const TICK_INTERVAL_MS: u64 = 250;

    /// Overall deadline for a single CLI run (scan, connect, command)
    pub const RUN_TIMEOUT_SECS: u64 = 60;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_fits_inside_timeout() {
        assert!(timing::TICK_INTERVAL_MS < timing::COMMAND_TIMEOUT_MS);
    }
}
