//! The result of a completed handshake, shared by both flows.

use std::sync::Arc;

use tokio::sync::mpsc;

use peer_session::{PeerSession, PeerSessionEvent};

/// The live session plus the event stream the caller should now drain,
/// typically by handing it to a [`file_transfer::TransferManager`].
pub struct Handshake {
    pub session: Arc<PeerSession>,
    pub events: mpsc::Receiver<PeerSessionEvent>,
}
