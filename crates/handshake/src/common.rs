//! Helpers shared by both handshake flows: waiting out the ICE connect and
//! the post-signal capability exchange.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use peer_session::{PeerSession, PeerSessionEvent};
use sharefile_protocol::{Capabilities, Configuration, ControlMessage, ErrorKind, PeerStatus, ShareResult};

/// Drain `events` until the session reports `Connected`, forwarding every
/// event to `carry` so the caller doesn't lose anything the session emitted
/// while the handshake was still watching the channel itself.
pub async fn wait_connected(
    events: &mut mpsc::Receiver<PeerSessionEvent>,
    carry: &mut Vec<PeerSessionEvent>,
    timeout: Duration,
) -> ShareResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(ErrorKind::Timeout("peer connection"));
        }
        let event = match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(ErrorKind::ChannelClosed),
            Err(_) => return Err(ErrorKind::Timeout("peer connection")),
        };
        let reached = matches!(event, PeerSessionEvent::StatusChanged(PeerStatus::Connected));
        carry.push(event);
        if reached {
            return Ok(());
        }
    }
}

/// Advertise our capabilities once the control channel is likely open.
/// Non-fatal on failure: a missed `hello` only means the peer falls back to
/// the conservative (non-striped) default.
pub async fn send_hello(session: &PeerSession, cfg: &Configuration) {
    let hello = ControlMessage::Hello {
        v: 1,
        caps: Capabilities::new(cfg.use_striping),
    };
    if let Err(e) = session.send_control(&hello).await {
        warn!(error = %e, "failed to send hello after connecting");
    }
}

/// Splice `carried` (events consumed by the handshake itself while watching
/// for `Connected`) back in front of `rest`, so the caller's receiver sees
/// exactly the event order the session produced.
pub fn replay_and_forward(
    carried: Vec<PeerSessionEvent>,
    mut rest: mpsc::Receiver<PeerSessionEvent>,
) -> mpsc::Receiver<PeerSessionEvent> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        for event in carried {
            if tx.send(event).await.is_err() {
                return;
            }
        }
        while let Some(event) = rest.recv().await {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });
    rx
}
