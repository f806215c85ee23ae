//! Message envelope carried by every transport.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;

/// Metadata key holding the resolvable type name of the payload.
pub const NAME_KEY: &str = "name";
/// Metadata key holding the correlation id.
pub const CORRELATION_ID_KEY: &str = "correlation_id";
/// Metadata key holding the topic the request was published to.
pub const REQUEST_TOPIC_KEY: &str = "request_topic";
/// Metadata key holding the topic the reply must be published to.
pub const REPLY_TOPIC_KEY: &str = "reply_topic";
/// Metadata key set to `"true"` when the caller does not expect a reply.
pub const NO_REPLY_KEY: &str = "no_reply";

/// Type name stamped on reply envelopes.
pub const REPLY_NAME: &str = "reply";

/// A serialized payload plus string metadata.
///
/// The payload is JSON; the `name` metadata entry makes it self-describing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this envelope.
    pub uuid: String,
    /// Serialized payload, base64 when the envelope itself is serialized.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    /// Headers: type name, correlation id, topics, flags.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    /// Create an envelope around raw payload bytes.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// JSON-encode `value` and stamp it with `name`.
    pub fn marshal<T: Serialize + ?Sized>(name: &str, value: &T) -> Result<Self, BusError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| BusError::Marshal(format!("{name}: {e}")))?;
        Ok(Self::new(payload).with_metadata(NAME_KEY, name))
    }

    /// Decode the payload, checking the envelope names the expected type.
    pub fn unmarshal<T: DeserializeOwned>(&self, expected_name: &str) -> Result<T, BusError> {
        match self.get(NAME_KEY) {
            Some(name) if name == expected_name => {}
            Some(name) => {
                return Err(BusError::Unmarshal(format!(
                    "expected {expected_name}, envelope carries {name}"
                )))
            }
            None => {
                return Err(BusError::Unmarshal(format!(
                    "envelope for {expected_name} has no type name"
                )))
            }
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| BusError::Unmarshal(format!("{expected_name}: {e}")))
    }

    /// Add metadata to the message.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set a metadata entry in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Read a metadata entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// The correlation id, if stamped.
    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID_KEY)
    }

    /// Whether the sender asked for no reply.
    pub fn no_reply(&self) -> bool {
        self.get(NO_REPLY_KEY) == Some("true")
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
