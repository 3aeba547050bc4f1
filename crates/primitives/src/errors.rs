//! Error taxonomy for coordination operations.
//!
//! The engine's retry logic hinges on one distinction: connection-loss-class
//! errors are transient and retried per policy, everything else is permanent
//! and surfaces immediately.

use thiserror::Error;

/// Failure of a single coordination-service operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CoordinationError {
    /// The connection to the service dropped mid-operation.
    #[error("connection to the coordination service was lost")]
    ConnectionLoss,

    /// The session expired; ephemeral state tied to it is gone.
    #[error("session with the coordination service expired")]
    SessionExpired,

    /// The operation did not complete within the service's deadline.
    #[error("operation timed out against the coordination service")]
    OperationTimeout,

    /// Create failed because the node already exists.
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    /// The target node does not exist.
    #[error("node does not exist: {path}")]
    NoNode { path: String },

    /// A conditional write named a version that no longer matches.
    #[error("version mismatch for node: {path}")]
    BadVersion { path: String },

    /// Delete refused because the node still has children.
    #[error("node has children: {path}")]
    NotEmpty { path: String },

    /// The supplied path is not a well-formed absolute namespace path.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// The client was closed before the operation could be dispatched.
    #[error("client is closed")]
    ClientClosed,
}

impl CoordinationError {
    /// Whether this failure is transient and eligible for retry.
    #[must_use]
    pub const fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLoss | Self::SessionExpired | Self::OperationTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_loss_classification() {
        assert!(CoordinationError::ConnectionLoss.is_connection_loss());
        assert!(CoordinationError::SessionExpired.is_connection_loss());
        assert!(CoordinationError::OperationTimeout.is_connection_loss());

        let permanent = [
            CoordinationError::NodeExists { path: "/a".to_owned() },
            CoordinationError::NoNode { path: "/a".to_owned() },
            CoordinationError::BadVersion { path: "/a".to_owned() },
            CoordinationError::NotEmpty { path: "/a".to_owned() },
            CoordinationError::ClientClosed,
        ];
        for err in permanent {
            assert!(!err.is_connection_loss(), "{err} must be permanent");
        }
    }
}
