//! Error types for the broadcast hub and per-connection bridges

use std::io;

/// Failures reported by [`BroadcastHub`](crate::hub::BroadcastHub) operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The hub observed root cancellation or its control loop has exited
    #[error("broadcast hub is shut down")]
    ShutDown,
}

/// Terminal outcome of a single connection
///
/// Every variant ends exactly one connection; none of them reach the hub or
/// other connections. Cancellation and hub shutdown are not errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("failed to receive from client: {0}")]
    Receive(#[source] io::Error),

    #[error("failed to send to client: {0}")]
    Send(#[source] io::Error),
}

impl BridgeError {
    pub fn is_auth(&self) -> bool {
        matches!(self, BridgeError::Unauthenticated(_))
    }
}
