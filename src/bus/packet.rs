//! Request and reply packets.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::message::{
    Message, CORRELATION_ID_KEY, NO_REPLY_KEY, REPLY_NAME, REPLY_TOPIC_KEY, REQUEST_TOPIC_KEY,
};
use super::request::{Request, RequestType};
use super::topic;
use crate::error::BusError;

/// A request in flight, with its routing metadata.
#[derive(Debug, Clone)]
pub struct RequestPacket<T> {
    /// Ties the request to its reply.
    pub correlation_id: String,
    /// Topic the request is published to.
    pub request_topic: String,
    /// Topic the reply goes to.
    pub reply_topic: String,
    /// Whether the caller waits for a reply.
    pub no_reply: bool,
    /// The raw envelope.
    pub message: Message,
    /// The typed request.
    pub request: T,
}

impl<R: Request> RequestPacket<R> {
    /// Build an outgoing packet: marshal, derive topics, stamp metadata.
    pub fn outgoing(request: R, no_reply: bool) -> Result<Self, BusError> {
        let request_type = request.request_type();
        let name = request_type.to_string();
        let correlation_id = topic::new_correlation_id();
        let request_topic = topic::request_topic(&request_type);
        let reply_topic = topic::reply_topic(&request_topic, &correlation_id);

        let message = Message::marshal(&name, &request)?
            .with_metadata(CORRELATION_ID_KEY, correlation_id.as_str())
            .with_metadata(REQUEST_TOPIC_KEY, request_topic.as_str())
            .with_metadata(REPLY_TOPIC_KEY, reply_topic.as_str())
            .with_metadata(NO_REPLY_KEY, if no_reply { "true" } else { "false" });

        Ok(Self {
            correlation_id,
            request_topic,
            reply_topic,
            no_reply,
            message,
            request,
        })
    }

    /// The request type of the carried request.
    pub fn request_type(&self) -> RequestType {
        self.request.request_type()
    }
}

impl<T> RequestPacket<T> {
    /// Rebuild an incoming packet around an already decoded request.
    ///
    /// Fails when the envelope lacks routing metadata.
    pub fn incoming(message: Message, request: T) -> Result<Self, BusError> {
        let header = |key: &str| {
            message
                .get(key)
                .map(str::to_string)
                .ok_or_else(|| BusError::Unmarshal(format!("envelope is missing {key}")))
        };
        let correlation_id = header(CORRELATION_ID_KEY)?;
        let request_topic = header(REQUEST_TOPIC_KEY)?;
        let reply_topic = header(REPLY_TOPIC_KEY)?;
        let no_reply = message.no_reply();

        Ok(Self {
            correlation_id,
            request_topic,
            reply_topic,
            no_reply,
            message,
            request,
        })
    }

    /// Swap the carried request, keeping correlation and topics.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RequestPacket<U> {
        RequestPacket {
            correlation_id: self.correlation_id,
            request_topic: self.request_topic,
            reply_topic: self.reply_topic,
            no_reply: self.no_reply,
            message: self.message,
            request: f(self.request),
        }
    }
}

/// Outcome of a handler: a result or an error string, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply<T> {
    /// The handler's result, absent on failure.
    #[serde(default)]
    pub result: Option<T>,
    /// Flattened handler error, absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Reply<T> {
    /// A successful reply.
    pub fn ok(result: T) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    /// A failed reply.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }

    /// True when the reply carries an error.
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// Turn the reply into a `Result`. An error always wins.
    pub fn into_result(self) -> Result<Option<T>, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

impl Reply<serde_json::Value> {
    /// Decode an erased result into its concrete type.
    ///
    /// A successful reply without a value decodes from `null`, which lets
    /// unit-like result types round-trip.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, BusError> {
        match self.into_result() {
            Err(error) => Err(BusError::Handler(error)),
            Ok(value) => serde_json::from_value(value.unwrap_or(serde_json::Value::Null))
                .map_err(|e| BusError::Unmarshal(format!("reply result: {e}"))),
        }
    }
}

/// A reply in flight.
#[derive(Debug, Clone)]
pub struct ReplyPacket {
    /// Correlation id copied from the request.
    pub correlation_id: String,
    /// The raw envelope wrapping a `Reply`.
    pub message: Message,
}

impl ReplyPacket {
    /// Wrap a reply for the request it answers.
    pub fn new<T: Serialize>(correlation_id: &str, reply: &Reply<T>) -> Result<Self, BusError> {
        let mut message = Message::marshal(REPLY_NAME, reply)?;
        message.set(CORRELATION_ID_KEY, correlation_id);
        Ok(Self {
            correlation_id: correlation_id.to_string(),
            message,
        })
    }

    /// Decode a reply envelope received on a reply topic.
    pub fn decode(message: Message) -> Result<(Self, Reply<serde_json::Value>), BusError> {
        let reply = message.unmarshal::<Reply<serde_json::Value>>(REPLY_NAME)?;
        let correlation_id = message.correlation_id().unwrap_or_default().to_string();
        Ok((
            Self {
                correlation_id,
                message,
            },
            reply,
        ))
    }
}
