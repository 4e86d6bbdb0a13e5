//! Message envelope codec for values crossing the worker process boundary.
//!
//! Job inputs and outputs travel as JSON. Two kinds of value have no native
//! JSON form and get a tagged representation instead:
//!
//! - [`Buffer`] (raw bytes such as scanned images): `{"$type":"Buffer","base64":"..."}`
//! - [`SerializedError`] (a failure raised inside a worker):
//!   `{"$type":"Error","name":...,"message":...,"stack":...,"fields":{...}}`
//!
//! Outcomes are wrapped in an [`Envelope`], the wire form of
//! `Result<T, SerializedError>`.

use crate::error::CodecError;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Encode a value into its wire form.
///
/// Fails instead of dropping data when the value's `Serialize` impl cannot
/// produce JSON (for example a map keyed by a non-string type).
pub fn encode<T: Serialize>(value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|source| CodecError::Encode {
        type_name: std::any::type_name::<T>(),
        source,
    })
}

/// Decode a value from its wire form.
pub fn decode<T: DeserializeOwned>(wire: Value) -> Result<T, CodecError> {
    serde_json::from_value(wire).map_err(|source| CodecError::Decode {
        type_name: std::any::type_name::<T>(),
        source,
    })
}

/// Raw bytes that survive a JSON round-trip.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Buffer(pub Vec<u8>);

impl Buffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

// Image buffers are large; print the size, not the bytes.
impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({} bytes)", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
enum BufferTag {
    #[default]
    Buffer,
}

#[derive(Serialize, Deserialize)]
struct BufferRepr {
    #[serde(rename = "$type")]
    tag: BufferTag,
    base64: String,
}

impl Serialize for Buffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        BufferRepr {
            tag: BufferTag::Buffer,
            base64: STANDARD.encode(&self.0),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Buffer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = BufferRepr::deserialize(deserializer)?;
        STANDARD
            .decode(repr.base64.as_bytes())
            .map(Buffer)
            .map_err(serde::de::Error::custom)
    }
}

/// A failure that happened on the other side of the process boundary.
///
/// Keeps the error's name, message, a rendered stack (the cause chain for
/// `anyhow` errors) and any custom fields the entry point attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    #[serde(rename = "$type")]
    tag: ErrorTag,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
enum ErrorTag {
    #[default]
    Error,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tag: ErrorTag::Error,
            name: name.into(),
            message: message.into(),
            stack: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach a custom field. Values that fail to encode are stored as their
    /// codec error message so the field is never silently lost.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = encode(&value).unwrap_or_else(|e| Value::String(e.to_string()));
        self.fields.insert(key.into(), value);
        self
    }

    /// Capture an `anyhow` error.
    ///
    /// A `SerializedError` that was raised directly (and possibly wrapped in
    /// context) is recovered with its fields intact.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(inner) = err.downcast_ref::<SerializedError>() {
            let mut recovered = inner.clone();
            let outer = err.to_string();
            if outer != inner.to_string() {
                recovered.message = format!("{}: {}", outer, inner.message);
            }
            return recovered;
        }

        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        let mut serialized = Self::new("Error", err.to_string());
        if !chain.is_empty() {
            serialized.stack = Some(
                chain
                    .iter()
                    .map(|cause| format!("caused by: {}", cause))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
        serialized
    }

    /// Capture a panic payload from `catch_unwind`.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new("Panic", message)
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for SerializedError {}

/// Wire form of a job outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope<T> {
    Ok { value: T },
    Error { error: SerializedError },
}

impl<T> Envelope<T> {
    pub fn ok(value: T) -> Self {
        Self::Ok { value }
    }

    pub fn error(error: SerializedError) -> Self {
        Self::Error { error }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn into_result(self) -> Result<T, SerializedError> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Error { error } => Err(error),
        }
    }
}

impl<T> From<Result<T, SerializedError>> for Envelope<T> {
    fn from(result: Result<T, SerializedError>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(error) => Self::error(error),
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u64,
        label: String,
        scores: Vec<i32>,
        image: Buffer,
        nested: BTreeMap<String, Vec<bool>>,
    }

    fn arb_job() -> impl Strategy<Value = Job> {
        (
            any::<u64>(),
            ".*",
            prop::collection::vec(any::<i32>(), 0..16),
            prop::collection::vec(any::<u8>(), 0..512),
            prop::collection::btree_map("[a-z]{1,8}", prop::collection::vec(any::<bool>(), 0..4), 0..4),
        )
            .prop_map(|(id, label, scores, bytes, nested)| Job {
                id,
                label,
                scores,
                image: Buffer::new(bytes),
                nested,
            })
    }

    fn arb_error() -> impl Strategy<Value = SerializedError> {
        (".*", ".*", proptest::option::of(".*"), any::<i64>()).prop_map(
            |(name, message, stack, code)| {
                let mut err = SerializedError::new(name, message).with_field("code", code);
                err.stack = stack;
                err
            },
        )
    }

    proptest! {
        #[test]
        fn job_roundtrips(job in arb_job()) {
            let decoded: Job = decode(encode(&job).unwrap()).unwrap();
            prop_assert_eq!(decoded, job);
        }

        #[test]
        fn buffer_roundtrips_through_text(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
            let buffer = Buffer::new(bytes);
            let text = serde_json::to_string(&encode(&buffer).unwrap()).unwrap();
            let wire: Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(decode::<Buffer>(wire).unwrap(), buffer);
        }

        #[test]
        fn error_envelope_roundtrips(err in arb_error()) {
            let envelope: Envelope<Job> = Envelope::error(err.clone());
            let decoded: Envelope<Job> = decode(encode(&envelope).unwrap()).unwrap();
            prop_assert_eq!(decoded.into_result().unwrap_err(), err);
        }
    }
}
