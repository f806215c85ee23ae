//! Topic naming and correlation ids.
//!
//! Requests for a type go to `cqrs:<type>`; each synchronous call listens
//! on its own `cqrs:<type>:reply:<correlation id>` topic, so concurrent
//! callers of one request type never see each other's replies.

use uuid::Uuid;

use super::request::RequestType;

/// Prefix of every request topic.
pub const TOPIC_PREFIX: &str = "cqrs:";
/// Separator between a request topic and the reply suffix.
pub const REPLY_SEPARATOR: &str = ":reply:";

/// Topic handlers of `request_type` subscribe to.
pub fn request_topic(request_type: &RequestType) -> String {
    format!("{}{}", TOPIC_PREFIX, request_type)
}

/// Unique reply topic for one call.
pub fn reply_topic(request_topic: &str, correlation_id: &str) -> String {
    format!("{}{}{}", request_topic, REPLY_SEPARATOR, correlation_id)
}

/// Time-ordered, globally unique correlation id (UUID v7).
pub fn new_correlation_id() -> String {
    Uuid::now_v7().to_string()
}
