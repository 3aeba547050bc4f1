//! Connection state as seen by framework consumers.

use core::fmt;

/// The framework's view of the session with the coordination service.
///
/// Exactly one state is current at any instant. Transitions are produced only
/// by the connection state manager from the service's raw connectivity
/// signals; every other component treats the value as read-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The session is gone. Operations will fail until a new session forms.
    Lost,
    /// The connection dropped but the session may still be recoverable.
    Suspended,
    /// First successful connection of this client instance.
    Connected,
    /// Connection recovered after a suspension or loss.
    Reconnected,
    /// Connected to a read-only replica; writes will be rejected.
    ReadOnly,
}

impl ConnectionState {
    /// Whether operations can currently be attempted at all.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnected | Self::ReadOnly)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lost => "LOST",
            Self::Suspended => "SUSPENDED",
            Self::Connected => "CONNECTED",
            Self::Reconnected => "RECONNECTED",
            Self::ReadOnly => "READ_ONLY",
        };
        f.write_str(name)
    }
}
