//! Wire codec for the scheduler boundary.
//!
//! Everything crossing the durable boundary (step inputs, step outputs,
//! history payloads) is wrapped in a versioned [`Envelope`] to enable
//! schema evolution and rolling upgrades. The payload distinguishes the
//! unit marker (an absent value) from JSON values, so `Option::None` at
//! the top level survives a round-trip. Tagged errors pass through as
//! values (the `__type` tag is part of their serde shape), and timestamps
//! encode as ISO-8601 via chrono.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use std::fmt;

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// Key marking the unit payload in its JSON encoding.
const UNIT_KEY: &str = "__cascade_unit";

/// A versioned envelope wrapping a boundary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the envelope format.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Returns true if this envelope uses the current version.
    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

/// A boundary payload: either the unit marker or a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum WirePayload {
    /// No value (an absent argument or result).
    Unit,
    /// A JSON value.
    Value(JsonValue),
}

impl Serialize for WirePayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unit => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(UNIT_KEY, &true)?;
                map.end()
            }
            Self::Value(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for WirePayload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        if let JsonValue::Object(map) = &value
            && map.len() == 1
            && map.get(UNIT_KEY).and_then(JsonValue::as_bool) == Some(true)
        {
            return Ok(Self::Unit);
        }
        Ok(Self::Value(value))
    }
}

/// Errors from encoding or decoding boundary payloads.
#[derive(Debug)]
pub enum CodecError {
    /// The value could not be serialized.
    Encode { message: String },
    /// The payload could not be deserialized into the expected type.
    Decode { message: String },
    /// The envelope carries an unsupported version.
    UnsupportedVersion { version: u32 },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { message } => write!(f, "payload encode failed: {message}"),
            Self::Decode { message } => write!(f, "payload decode failed: {message}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported envelope version: {version}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Encodes a value into an enveloped wire payload.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized to JSON.
pub fn encode<T: Serialize>(value: &T) -> Result<Envelope<WirePayload>, CodecError> {
    let json = serde_json::to_value(value).map_err(|e| CodecError::Encode {
        message: e.to_string(),
    })?;
    Ok(Envelope::new(WirePayload::Value(json)))
}

/// Encodes the unit payload (an absent value).
#[must_use]
pub fn encode_unit() -> Envelope<WirePayload> {
    Envelope::new(WirePayload::Unit)
}

/// Decodes an enveloped wire payload into a value.
///
/// # Errors
///
/// Returns an error for unsupported versions, a unit payload, or a payload
/// that does not match `T`.
pub fn decode<T: DeserializeOwned>(envelope: Envelope<WirePayload>) -> Result<T, CodecError> {
    if !envelope.is_current_version() {
        return Err(CodecError::UnsupportedVersion {
            version: envelope.version,
        });
    }
    match envelope.into_payload() {
        WirePayload::Unit => Err(CodecError::Decode {
            message: "expected a value, found the unit marker".to_string(),
        }),
        WirePayload::Value(json) => {
            serde_json::from_value(json).map_err(|e| CodecError::Decode {
                message: e.to_string(),
            })
        }
    }
}

/// Serializes an envelope to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_bytes(envelope: &Envelope<WirePayload>) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(|e| CodecError::Encode {
        message: e.to_string(),
    })
}

/// Deserializes an envelope from JSON bytes.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn from_bytes(bytes: &[u8]) -> Result<Envelope<WirePayload>, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, NodeError, SerializedError};
    use crate::state::RunState;
    use serde_json::json;

    #[test]
    fn value_roundtrip() {
        let envelope = encode(&json!({"a": [1, 2, 3]})).expect("encode");
        let bytes = to_bytes(&envelope).expect("bytes");
        let parsed = from_bytes(&bytes).expect("parse");
        let value: JsonValue = decode(parsed).expect("decode");
        assert_eq!(value, json!({"a": [1, 2, 3]}));
    }

    #[test]
    fn unit_marker_roundtrip() {
        let envelope = encode_unit();
        let bytes = to_bytes(&envelope).expect("bytes");
        let parsed = from_bytes(&bytes).expect("parse");
        assert_eq!(parsed.payload, WirePayload::Unit);
    }

    #[test]
    fn unit_marker_is_distinguished_from_similar_objects() {
        // An object with extra keys is a value, not the unit marker.
        let value = json!({"__cascade_unit": true, "other": 1});
        let payload: WirePayload = serde_json::from_value(value.clone()).expect("parse");
        assert_eq!(payload, WirePayload::Value(value));
    }

    #[test]
    fn tagged_error_survives_roundtrip() {
        let error = SerializedError::from_node_error(
            &NodeError::api("upstream failed").with_http_code(502),
            "Fetch",
        );
        let envelope = encode(&error).expect("encode");
        let decoded: SerializedError =
            decode(from_bytes(&to_bytes(&envelope).unwrap()).unwrap()).expect("decode");

        assert_eq!(decoded.kind, ErrorKind::NodeApi);
        assert_eq!(decoded, error);
    }

    #[test]
    fn run_state_roundtrip() {
        let state = RunState::empty();
        let envelope = encode(&state).expect("encode");
        let decoded: RunState = decode(envelope).expect("decode");
        assert_eq!(decoded, state);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let envelope = Envelope {
            version: 99,
            payload: WirePayload::Value(json!(1)),
        };
        assert!(matches!(
            decode::<JsonValue>(envelope),
            Err(CodecError::UnsupportedVersion { version: 99 })
        ));
    }
}
