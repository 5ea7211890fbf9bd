//! Per-device command session
//!
//! A session owns at most one outstanding command. The wire protocol has no
//! correlation token, so the only thing tying a response to its request is
//! that nothing else is outstanding; the single-command rule is what keeps
//! correlation sound.
//!
//! ```text
//!            issue()                     Complete / framing error / timeout
//!   Idle  ────────────▶  Awaiting  ──────────────────────────────────────▶  Idle
//!                          │  ▲
//!                          └──┘ Incomplete
//! ```
//!
//! Every entry point takes the current time in milliseconds and starts with
//! the timeout check, so a stale command is cleared before anything else
//! happens. The surrounding event loop is expected to call [`CommandSession::tick`]
//! periodically so a silent device still resolves.

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::assembler::{to_hex, Assembly, FramingError, ResponseAssembler};
use crate::codec::{self, CodecError, CommandSpec, Dataset, Params};
use crate::registry::{Registry, RegistryError};
use crate::timing;

/// Sink for encoded requests (fire-and-forget)
pub trait RequestWriter {
    fn write(&mut self, request: Bytes);
}

impl RequestWriter for Vec<Bytes> {
    fn write(&mut self, request: Bytes) {
        self.push(request);
    }
}

/// Errors returned synchronously by [`CommandSession::issue`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Previous command has not finished processing yet ({command}, sequence {sequence})")]
    Busy { sequence: u64, command: &'static str },

    #[error("Invalid parameters: {0}")]
    Codec(#[from] CodecError),
}

/// Why an in-flight command was aborted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unexpected message received: {0}")]
    Framing(#[from] FramingError),

    #[error("Response could not be decoded: {0}")]
    Decode(#[from] CodecError),

    #[error("Link to the device was lost")]
    LinkLost,
}

/// Terminal result of one issued command, delivered exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Response received and decoded
    Completed {
        sequence: u64,
        command: &'static str,
        dataset: Dataset,
    },
    /// No complete response within the timeout
    TimedOut {
        sequence: u64,
        command: &'static str,
        elapsed_ms: u64,
    },
    /// Command aborted by a protocol error
    Failed {
        sequence: u64,
        command: &'static str,
        error: ProtocolError,
    },
}

impl CommandOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            CommandOutcome::Completed { sequence, .. }
            | CommandOutcome::TimedOut { sequence, .. }
            | CommandOutcome::Failed { sequence, .. } => *sequence,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            CommandOutcome::Completed { command, .. }
            | CommandOutcome::TimedOut { command, .. }
            | CommandOutcome::Failed { command, .. } => command,
        }
    }
}

/// What happened to a fragment handed to [`CommandSession::on_fragment`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentDisposition {
    /// Appended to the response, more fragments needed
    Buffered {
        sequence: u64,
        received: usize,
        expected: usize,
    },
    /// Completed the response; the outcome has been delivered
    Completed { sequence: u64 },
    /// Aborted the command; a failure outcome has been delivered
    Rejected { sequence: u64 },
    /// No command outstanding, fragment dropped
    Discarded,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a command may wait for its response
    pub timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: timing::COMMAND_TIMEOUT_MS,
        }
    }
}

type ResultHandler = Box<dyn FnOnce(CommandOutcome) + Send>;

/// The single in-flight command
struct PendingCommand {
    sequence: u64,
    spec: &'static CommandSpec,
    started_at_ms: u64,
    on_result: ResultHandler,
}

impl PendingCommand {
    fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at_ms)
    }
}

/// Command/response state machine for one device
pub struct CommandSession<W: RequestWriter> {
    config: SessionConfig,
    writer: W,
    assembler: ResponseAssembler,
    pending: Option<PendingCommand>,
    last_sequence: u64,
}

impl<W: RequestWriter> CommandSession<W> {
    /// Create an idle session writing requests to `writer`
    pub fn new(config: SessionConfig, writer: W) -> Self {
        Self {
            config,
            writer,
            assembler: ResponseAssembler::new(),
            pending: None,
            last_sequence: 0,
        }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Sequence number of the outstanding command, if any
    pub fn pending_sequence(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.sequence)
    }

    /// Spec of the outstanding command, if any
    pub fn pending_command(&self) -> Option<&'static CommandSpec> {
        self.pending.as_ref().map(|p| p.spec)
    }

    /// Encode and send a command; `on_result` receives its outcome
    ///
    /// Returns the sequence number assigned to the command. Nothing is
    /// written when an error is returned.
    pub fn issue<F>(
        &mut self,
        name: &str,
        params: &Params,
        on_result: F,
        now_ms: u64,
    ) -> Result<u64, SessionError>
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        self.check_timeout(now_ms);

        let spec = Registry::lookup(name)?;

        if let Some(pending) = &self.pending {
            return Err(SessionError::Busy {
                sequence: pending.sequence,
                command: pending.spec.name,
            });
        }

        let request = codec::encode(spec, params)?;

        self.last_sequence += 1;
        let sequence = self.last_sequence;

        self.assembler.reset();
        info!(
            "Sending command {} (opcode 0x{:02x}, seq={})",
            spec.name, spec.opcode, sequence
        );
        debug!("Request bytes: {}", to_hex(&request));
        self.writer.write(request);

        self.pending = Some(PendingCommand {
            sequence,
            spec,
            started_at_ms: now_ms,
            on_result: Box::new(on_result),
        });

        Ok(sequence)
    }

    /// Handle one notification from the device
    pub fn on_fragment(&mut self, fragment: &[u8], now_ms: u64) -> FragmentDisposition {
        debug!("Received response: {}", to_hex(fragment));
        self.check_timeout(now_ms);

        let (sequence, spec) = match &self.pending {
            Some(pending) => (pending.sequence, pending.spec),
            None => {
                warn!(
                    "Discarding fragment with no command outstanding: {}",
                    to_hex(fragment)
                );
                return FragmentDisposition::Discarded;
            }
        };

        match self.assembler.feed(spec, fragment) {
            Ok(Assembly::Incomplete { received, expected }) => FragmentDisposition::Buffered {
                sequence,
                received,
                expected,
            },
            Ok(Assembly::Complete(payload)) => match codec::decode(spec, &payload) {
                Ok(dataset) => {
                    info!("Finished {} (seq={})", spec.name, sequence);
                    self.finish(|sequence, command| CommandOutcome::Completed {
                        sequence,
                        command,
                        dataset,
                    });
                    FragmentDisposition::Completed { sequence }
                }
                Err(e) => {
                    error!("Decoding {} failed: {}", spec.name, e);
                    self.finish(|sequence, command| CommandOutcome::Failed {
                        sequence,
                        command,
                        error: ProtocolError::Decode(e),
                    });
                    FragmentDisposition::Rejected { sequence }
                }
            },
            Err(e) => {
                error!("Unexpected message while awaiting {}: {}", spec.name, e);
                self.finish(|sequence, command| CommandOutcome::Failed {
                    sequence,
                    command,
                    error: ProtocolError::Framing(e),
                });
                FragmentDisposition::Rejected { sequence }
            }
        }
    }

    /// Periodic timeout check; returns the sequence of a command it expired
    pub fn tick(&mut self, now_ms: u64) -> Option<u64> {
        self.check_timeout(now_ms)
    }

    /// Fail the outstanding command because the link went away
    pub fn link_lost(&mut self) -> Option<u64> {
        let sequence = self.pending_sequence()?;
        warn!("Link lost while awaiting response (seq={})", sequence);
        self.finish(|sequence, command| CommandOutcome::Failed {
            sequence,
            command,
            error: ProtocolError::LinkLost,
        });
        Some(sequence)
    }

    fn check_timeout(&mut self, now_ms: u64) -> Option<u64> {
        let pending = self.pending.as_ref()?;
        let elapsed_ms = pending.elapsed_ms(now_ms);
        if elapsed_ms <= self.config.timeout_ms {
            return None;
        }

        error!(
            "Timed out while expecting response to {} (seq={}, {}ms)",
            pending.spec.name, pending.sequence, elapsed_ms
        );
        let sequence = pending.sequence;
        self.finish(|sequence, command| CommandOutcome::TimedOut {
            sequence,
            command,
            elapsed_ms,
        });
        Some(sequence)
    }

    /// Clear the pending command and deliver its outcome
    fn finish(&mut self, outcome: impl FnOnce(u64, &'static str) -> CommandOutcome) {
        self.assembler.reset();
        if let Some(pending) = self.pending.take() {
            (pending.on_result)(outcome(pending.sequence, pending.spec.name));
        }
    }
}
