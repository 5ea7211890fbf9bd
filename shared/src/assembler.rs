//! Response reassembly across GATT notifications
//!
//! The scale answers in notifications of at most 20 bytes, so anything
//! longer than a short header plus a couple of fields arrives split.
//! Only the first fragment of a response carries the header:
//! ```text
//! first:     [ opcode ][ 0x0A ][ payload bytes... ]
//! follow-up: [ payload bytes... ]
//! ```

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{CommandSpec, FRAMING_MARKER, HEADER_LEN};

/// A first fragment that does not start the expected response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("fragment too short for a header: {0} bytes")]
    Truncated(usize),

    #[error("bad framing marker: expected 0x0a, got 0x{0:02x}")]
    BadMarker(u8),

    #[error("opcode mismatch: expected 0x{expected:02x}, got 0x{found:02x}")]
    OpcodeMismatch { expected: u8, found: u8 },
}

/// Result of feeding one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// More fragments are needed
    Incomplete { received: usize, expected: usize },
    /// The full payload, header stripped and excess truncated
    Complete(Bytes),
}

/// Accumulates fragments for the currently outstanding command
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    /// `None` until the first fragment of a response has been accepted
    buffer: Option<BytesMut>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial response
    pub fn reset(&mut self) {
        self.buffer = None;
    }

    /// Whether a first fragment has been accepted and more are expected
    pub fn in_progress(&self) -> bool {
        self.buffer.is_some()
    }

    /// Bytes buffered so far (for debugging)
    pub fn buffered_len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    /// Feed one fragment of the response to `spec`
    pub fn feed(&mut self, spec: &CommandSpec, fragment: &[u8]) -> Result<Assembly, FramingError> {
        let mut buffer = match self.buffer.take() {
            Some(mut buffer) => {
                debug!("Follow-up fragment ({} bytes)", fragment.len());
                buffer.extend_from_slice(fragment);
                buffer
            }
            None => {
                debug!("First fragment of {} ({} bytes)", spec.name, fragment.len());
                check_header(spec, fragment)?;
                BytesMut::from(&fragment[HEADER_LEN..])
            }
        };

        let expected = spec.response_width();
        let received = buffer.len();

        if received < expected {
            debug!("Incomplete response ({} < {})", received, expected);
            self.buffer = Some(buffer);
            return Ok(Assembly::Incomplete { received, expected });
        }

        if received > expected {
            let extra = buffer.split_off(expected);
            warn!(
                "Received {} extra bytes for {}: (message) {} + (extra) {}",
                extra.len(),
                spec.name,
                to_hex(&buffer),
                to_hex(&extra)
            );
        }

        Ok(Assembly::Complete(buffer.freeze()))
    }
}

fn check_header(spec: &CommandSpec, fragment: &[u8]) -> Result<(), FramingError> {
    if fragment.len() < HEADER_LEN {
        return Err(FramingError::Truncated(fragment.len()));
    }
    if fragment[1] != FRAMING_MARKER {
        return Err(FramingError::BadMarker(fragment[1]));
    }
    if fragment[0] != spec.opcode {
        return Err(FramingError::OpcodeMismatch {
            expected: spec.opcode,
            found: fragment[0],
        });
    }
    Ok(())
}

/// Lower-case hex dump for log lines
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
