//! Type-tagged value encoding
//!
//! SET and RTA payloads carry one scalar value: a kind byte followed by the
//! body. The declared type of a tag constrains which kinds it accepts; the
//! check happens at set time, not here - the codec is type-agnostic.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{ProtocolError, Result};

// Wire kind bytes
const KIND_INT: u8 = 0;
const KIND_FLOAT: u8 = 1;
const KIND_TEXT: u8 = 2;
const KIND_BYTES: u8 = 3;
const KIND_JSON: u8 = 4;

/// Declared scalar type of a tag
///
/// Mapping and sequence share the JSON wire kind; the distinction only
/// matters for validation against a tag's declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    /// 64-bit signed integer
    Int,
    /// 64-bit IEEE-754 float
    Float,
    /// UTF-8 text
    Text,
    /// Raw bytes
    Bytes,
    /// JSON object
    Mapping,
    /// JSON array
    Sequence,
}

impl TagKind {
    /// Wire kind byte this tag type maps to
    pub fn wire_kind(self) -> u8 {
        match self {
            Self::Int => KIND_INT,
            Self::Float => KIND_FLOAT,
            Self::Text => KIND_TEXT,
            Self::Bytes => KIND_BYTES,
            Self::Mapping | Self::Sequence => KIND_JSON,
        }
    }

    /// True for int and float tags
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

impl std::str::FromStr for TagKind {
    type Err = String;

    /// Parse a declaration-file type name
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "str" => Ok(Self::Text),
            "bytes" => Ok(Self::Bytes),
            "dict" => Ok(Self::Mapping),
            "list" => Ok(Self::Sequence),
            other => Err(format!("unknown tag type '{other}'")),
        }
    }
}

impl std::fmt::Display for TagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "str",
            Self::Bytes => "bytes",
            Self::Mapping => "dict",
            Self::Sequence => "list",
        };
        f.write_str(name)
    }
}

/// A tag value as it exists in memory
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit IEEE-754 float
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Bytes),
    /// JSON mapping or sequence
    Json(serde_json::Value),
}

impl TagValue {
    /// Wire kind byte of this value
    pub fn wire_kind(&self) -> u8 {
        match self {
            Self::Int(_) => KIND_INT,
            Self::Float(_) => KIND_FLOAT,
            Self::Text(_) => KIND_TEXT,
            Self::Bytes(_) => KIND_BYTES,
            Self::Json(_) => KIND_JSON,
        }
    }

    /// Short kind name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Json(v) if v.is_object() => "dict",
            Self::Json(_) => "list",
        }
    }

    /// Whether this value satisfies a tag's declared type
    pub fn matches(&self, kind: TagKind) -> bool {
        match (self, kind) {
            (Self::Int(_), TagKind::Int) => true,
            (Self::Float(_), TagKind::Float) => true,
            (Self::Text(_), TagKind::Text) => true,
            (Self::Bytes(_), TagKind::Bytes) => true,
            (Self::Json(v), TagKind::Mapping) => v.is_object(),
            (Self::Json(v), TagKind::Sequence) => v.is_array(),
            _ => false,
        }
    }

    /// Numeric view of the value, used for deadband comparisons
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for TagValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<Bytes> for TagValue {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<serde_json::Value> for TagValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// Encode a value into `buf` as kind byte plus body.
///
/// Text, bytes and JSON bodies carry a 4-byte big-endian length before
/// their content so a value can be validated without trusting the frame
/// length alone.
pub fn encode_value(value: &TagValue, buf: &mut BytesMut) {
    match value {
        TagValue::Int(i) => {
            buf.reserve(9);
            buf.put_u8(KIND_INT);
            buf.put_i64(*i);
        }
        TagValue::Float(f) => {
            buf.reserve(9);
            buf.put_u8(KIND_FLOAT);
            buf.put_f64(*f);
        }
        TagValue::Text(s) => {
            buf.reserve(5 + s.len());
            buf.put_u8(KIND_TEXT);
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        TagValue::Bytes(b) => {
            buf.reserve(5 + b.len());
            buf.put_u8(KIND_BYTES);
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        TagValue::Json(v) => {
            // serde_json object keys sort deterministically, which keeps
            // the encoding canonical across processes.
            let body = serde_json::to_vec(v).expect("JSON value serialises");
            buf.reserve(5 + body.len());
            buf.put_u8(KIND_JSON);
            buf.put_u32(body.len() as u32);
            buf.put_slice(&body);
        }
    }
}

/// Encode a value to an owned payload
pub fn value_payload(value: &TagValue) -> Bytes {
    let mut buf = BytesMut::new();
    encode_value(value, &mut buf);
    buf.freeze()
}

/// Decode a type-tagged payload.
///
/// An empty payload is the null value and decodes to `Ok(None)`.
pub fn decode_value(payload: &[u8]) -> Result<Option<TagValue>> {
    if payload.is_empty() {
        return Ok(None);
    }

    let kind = payload[0];
    let body = &payload[1..];

    let value = match kind {
        KIND_INT => {
            let raw = fixed8(body)?;
            TagValue::Int(i64::from_be_bytes(raw))
        }
        KIND_FLOAT => {
            let raw = fixed8(body)?;
            TagValue::Float(f64::from_be_bytes(raw))
        }
        KIND_TEXT => {
            let content = length_prefixed(body)?;
            TagValue::Text(std::str::from_utf8(content)?.to_string())
        }
        KIND_BYTES => {
            let content = length_prefixed(body)?;
            TagValue::Bytes(Bytes::copy_from_slice(content))
        }
        KIND_JSON => {
            let content = length_prefixed(body)?;
            let json: serde_json::Value = serde_json::from_slice(content)?;
            if !json.is_object() && !json.is_array() {
                return Err(ProtocolError::NotAContainer);
            }
            TagValue::Json(json)
        }
        other => return Err(ProtocolError::UnknownKind(other)),
    };

    Ok(Some(value))
}

fn fixed8(body: &[u8]) -> Result<[u8; 8]> {
    if body.len() < 8 {
        return Err(ProtocolError::ValueTruncated {
            expected: 8,
            actual: body.len(),
        });
    }
    if body.len() > 8 {
        return Err(ProtocolError::ValueOverlong {
            trailing: body.len() - 8,
        });
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(body);
    Ok(raw)
}

fn length_prefixed(body: &[u8]) -> Result<&[u8]> {
    if body.len() < 4 {
        return Err(ProtocolError::ValueTruncated {
            expected: 4,
            actual: body.len(),
        });
    }
    let len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let content = &body[4..];
    if content.len() < len {
        return Err(ProtocolError::ValueTruncated {
            expected: len,
            actual: content.len(),
        });
    }
    if content.len() > len {
        return Err(ProtocolError::ValueOverlong {
            trailing: content.len() - len,
        });
    }
    Ok(content)
}
