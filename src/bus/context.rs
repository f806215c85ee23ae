//! Context passed to request handlers.
//!
//! Each handler invocation gets a fresh context: cancelled when the
//! subscription that delivered the request is torn down, and carrying the
//! invocation deadline. The remote caller's own cancellation does not
//! reach the handler.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The context passed to every handler invocation.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Instant,
}

impl Context {
    /// Create a context cancelled by `cancel` and bounded by `timeout`.
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
        }
    }

    /// A context that is never cancelled, with the given deadline.
    ///
    /// Useful for calling handlers directly in tests.
    pub fn background(timeout: Duration) -> Self {
        Self::new(CancellationToken::new(), timeout)
    }

    /// The token cancelled when the subscription shuts down.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the subscription has shut down.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the subscription shuts down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// When the bus stops waiting for this invocation.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
