//! Request/reply CQRS bus.
//!
//! Modules exchange typed requests over named topics instead of calling
//! each other: fire-and-forget with [`Bus::send`](bus::Bus::send), or
//! request/await-reply with [`Bus::request`](bus::Bus::request). The same
//! protocol runs over an in-process queue or a durable stream with
//! consumer groups.

pub mod bus;
mod config;
mod error;

pub use bus::{Bus, Request, RequestType};
pub use config::{
    BusConfig, ConfigError, HANDLER_TIMEOUT_ENV, REQUEST_TIMEOUT_ENV, SHUTDOWN_GRACE_ENV,
};
pub use error::{BusError, HandlerError};
