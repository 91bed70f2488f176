//! Peer session status surfaced to callers.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a [Peer Session](crate). `PeerTimeout` is recoverable:
/// any subsequent inbound activity returns the session to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerStatus {
    New,
    Connecting,
    Connected,
    PeerTimeout,
    Disconnected,
    Failed,
    Closed,
}

impl PeerStatus {
    /// True once the underlying transport has torn down and will not recover.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed | Self::Disconnected)
    }
}
