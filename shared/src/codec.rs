//! Fixed-width field codec for W8 requests and responses
//!
//! Every message on the wire is framed as:
//! ```text
//! [ 1 byte: opcode ][ 1 byte: 0x0A ][ field_1 ][ field_2 ] ... [ field_n ]
//! ```
//!
//! Fields are little-endian integers of a fixed, declared width. There are
//! no variable-length fields, so the size of every request and response is
//! known up front from its [`CommandSpec`].

use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

/// Marker byte following the opcode in every request and first response fragment
pub const FRAMING_MARKER: u8 = 0x0A;

/// Opcode plus framing marker
pub const HEADER_LEN: usize = 2;

/// Integer type wide enough to carry any signed or unsigned 64-bit field
pub type FieldValue = i128;

/// Request parameters keyed by field name
pub type Params = HashMap<String, FieldValue>;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{command}: missing parameter '{field}'")]
    MissingParameter {
        command: &'static str,
        field: &'static str,
    },

    #[error("{command}: unexpected parameter '{name}'")]
    UnexpectedParameter { command: &'static str, name: String },

    #[error("{field}: value {value} does not fit {kind}")]
    OutOfRange {
        field: &'static str,
        value: FieldValue,
        kind: FieldKind,
    },

    #[error("{command}: payload is {actual} bytes, expected {expected}")]
    LengthMismatch {
        command: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Width and signedness of a single wire field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl FieldKind {
    /// Encoded width in bytes
    pub const fn width(self) -> usize {
        match self {
            FieldKind::U8 | FieldKind::I8 => 1,
            FieldKind::U16 | FieldKind::I16 => 2,
            FieldKind::U32 | FieldKind::I32 => 4,
            FieldKind::U64 | FieldKind::I64 => 8,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            FieldKind::I8 | FieldKind::I16 | FieldKind::I32 | FieldKind::I64
        )
    }

    /// Inclusive range of values representable by this kind
    pub fn range(self) -> (FieldValue, FieldValue) {
        match self {
            FieldKind::U8 => (0, u8::MAX.into()),
            FieldKind::U16 => (0, u16::MAX.into()),
            FieldKind::U32 => (0, u32::MAX.into()),
            FieldKind::U64 => (0, u64::MAX.into()),
            FieldKind::I8 => (i8::MIN.into(), i8::MAX.into()),
            FieldKind::I16 => (i16::MIN.into(), i16::MAX.into()),
            FieldKind::I32 => (i32::MIN.into(), i32::MAX.into()),
            FieldKind::I64 => (i64::MIN.into(), i64::MAX.into()),
        }
    }

    fn put(self, buf: &mut BytesMut, value: FieldValue) {
        // Callers check the range first, so the casts below never wrap.
        match self {
            FieldKind::U8 => buf.put_u8(value as u8),
            FieldKind::U16 => buf.put_u16_le(value as u16),
            FieldKind::U32 => buf.put_u32_le(value as u32),
            FieldKind::U64 => buf.put_u64_le(value as u64),
            FieldKind::I8 => buf.put_i8(value as i8),
            FieldKind::I16 => buf.put_i16_le(value as i16),
            FieldKind::I32 => buf.put_i32_le(value as i32),
            FieldKind::I64 => buf.put_i64_le(value as i64),
        }
    }

    fn get(self, buf: &mut &[u8]) -> FieldValue {
        match self {
            FieldKind::U8 => buf.get_u8().into(),
            FieldKind::U16 => buf.get_u16_le().into(),
            FieldKind::U32 => buf.get_u32_le().into(),
            FieldKind::U64 => buf.get_u64_le().into(),
            FieldKind::I8 => buf.get_i8().into(),
            FieldKind::I16 => buf.get_i16_le().into(),
            FieldKind::I32 => buf.get_i32_le().into(),
            FieldKind::I64 => buf.get_i64_le().into(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::U8 => "u8",
            FieldKind::U16 => "u16",
            FieldKind::U32 => "u32",
            FieldKind::U64 => "u64",
            FieldKind::I8 => "i8",
            FieldKind::I16 => "i16",
            FieldKind::I32 => "i32",
            FieldKind::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// A named field in a request or response layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// Static description of one command kind
#[derive(Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub opcode: u8,
    /// Empty for read-only commands
    pub request_fields: &'static [FieldSpec],
    /// Empty for write-only commands
    pub response_fields: &'static [FieldSpec],
}

impl CommandSpec {
    /// Width of the encoded request parameters, excluding the header
    pub fn request_width(&self) -> usize {
        self.request_fields.iter().map(|f| f.kind.width()).sum()
    }

    /// Width of the response payload, excluding the header
    pub fn response_width(&self) -> usize {
        self.response_fields.iter().map(|f| f.kind.width()).sum()
    }
}

/// Decoded response values in declared field order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    values: Vec<(&'static str, FieldValue)>,
}

impl Dataset {
    pub fn get(&self, name: &str) -> Option<FieldValue> {
        self.values
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, FieldValue)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Dataset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Encode a request for `spec` from named parameters
///
/// `params` must name exactly the request fields of `spec`.
pub fn encode(spec: &CommandSpec, params: &Params) -> Result<Bytes, CodecError> {
    if let Some(name) = params
        .keys()
        .find(|name| !spec.request_fields.iter().any(|f| f.name == name.as_str()))
    {
        return Err(CodecError::UnexpectedParameter {
            command: spec.name,
            name: name.clone(),
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + spec.request_width());
    buf.put_u8(spec.opcode);
    buf.put_u8(FRAMING_MARKER);

    for field in spec.request_fields {
        let value = *params
            .get(field.name)
            .ok_or(CodecError::MissingParameter {
                command: spec.name,
                field: field.name,
            })?;

        let (min, max) = field.kind.range();
        if value < min || value > max {
            return Err(CodecError::OutOfRange {
                field: field.name,
                value,
                kind: field.kind,
            });
        }

        field.kind.put(&mut buf, value);
    }

    Ok(buf.freeze())
}

/// Decode a response payload (header already stripped) for `spec`
pub fn decode(spec: &CommandSpec, payload: &[u8]) -> Result<Dataset, CodecError> {
    let expected = spec.response_width();
    if payload.len() != expected {
        return Err(CodecError::LengthMismatch {
            command: spec.name,
            expected,
            actual: payload.len(),
        });
    }

    let mut cursor = payload;
    let values = spec
        .response_fields
        .iter()
        .map(|field| (field.name, field.kind.get(&mut cursor)))
        .collect();

    Ok(Dataset { values })
}
