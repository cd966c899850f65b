//! JSON serialization of event payloads.
//!
//! Events travel as UTF-8 JSON. serde_json's decode semantics give the
//! forward compatibility the wire contract requires: unknown fields are
//! ignored, and optional fields absent from the payload take the target
//! type's defaults (`#[serde(default)]` on the application's event types).

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Failure to serialize an outgoing event body.
#[derive(Debug)]
pub struct EncodeError(pub(crate) serde_json::Error);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to encode event body: {}", self.0)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Failure to decode an incoming message body.
#[derive(Debug)]
pub struct DecodeError(pub(crate) serde_json::Error);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to decode message body: {}", self.0)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Stateless JSON serializer for event bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(value).map_err(EncodeError)
    }

    pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(data).map_err(DecodeError)
    }
}
