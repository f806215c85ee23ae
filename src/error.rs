//! Error types for the request/reply bus.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::bus::PublishError;

/// Errors surfaced to callers of [`Bus`](crate::bus::Bus) operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// A handler for this request type is already registered on the bus.
    #[error("handler already registered for request type {0}")]
    DuplicateHandler(String),

    /// Encoding a request or reply into an envelope failed.
    #[error("marshal failed: {0}")]
    Marshal(String),

    /// Decoding an envelope failed (bad payload or unexpected type name).
    #[error("unmarshal failed: {0}")]
    Unmarshal(String),

    /// The transport rejected a publish or subscribe.
    #[error("transport error: {0}")]
    Transport(#[from] PublishError),

    /// The handler replied with an error.
    #[error("handler error: {0}")]
    Handler(String),

    /// No reply arrived before the deadline.
    #[error("request {correlation_id} on topic {topic} timed out after {timeout:?}")]
    Timeout {
        /// Correlation id of the unanswered request.
        correlation_id: String,
        /// Request topic the call was published to.
        topic: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The reply subscription ended before a reply arrived.
    #[error("reply stream closed for request {correlation_id}")]
    ReplyStreamClosed {
        /// Correlation id of the request left without a reply.
        correlation_id: String,
    },

    /// Building or publishing an outgoing request panicked.
    #[error("request panicked: {0}")]
    Panicked(String),

    /// The bus has been closed.
    #[error("bus is closed")]
    Closed,

    /// Several independent failures, e.g. from registering many handlers.
    #[error("{}", JoinedErrors(.0))]
    Multiple(Vec<BusError>),
}

impl BusError {
    /// Join a list of errors into one. `None` when the list is empty.
    pub fn join(mut errors: Vec<BusError>) -> Option<BusError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(BusError::Multiple(errors)),
        }
    }

    /// True when this is a [`BusError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }
}

struct JoinedErrors<'a>(&'a [BusError]);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// Error type returned by typed request handlers.
///
/// Handler errors never cross the wire as structured values: the bus
/// flattens them to their `Display` text inside the reply.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Business logic rejected the request (validation, invariant violation).
    #[error("rejected: {0}")]
    Rejected(String),

    /// Aggregate or resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or invalid authentication / authorization.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Payload decode / deserialization failed.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// Other error.
    #[error("handler error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}
