//! Receiver-side rendezvous flow: broadcast `join` until the host's offer
//! arrives, answer it, then wait for the connection to come up.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peer_session::PeerSession;
use rendezvous_client::{RendezvousClient, RendezvousEvent};
use sharefile_protocol::{Configuration, ErrorKind, ShareResult};

use crate::common::{replay_and_forward, send_hello, wait_connected};
use crate::outcome::Handshake;
use crate::room::{RoomMessage, room_url};

const JOIN_RESEND_INTERVAL: Duration = Duration::from_secs(3);
const OFFER_WAIT_TIMEOUT: Duration = Duration::from_secs(180);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Join the room at `code`, answer the first valid offer, and wait for the
/// connection to come up.
pub async fn join(ws_base: &str, code: &str, cfg: Configuration) -> ShareResult<Handshake> {
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let session = std::sync::Arc::new(PeerSession::new(cfg.clone(), events_tx).await?);

    let url = room_url(ws_base, code);
    let (rendezvous, mut bus_events) = RendezvousClient::connect(&url).await.map_err(|e| {
        ErrorKind::ProtocolViolation(format!("rendezvous connect failed: {e}"))
    })?;

    match bus_events.recv().await {
        Some(RendezvousEvent::Open) => {}
        Some(RendezvousEvent::Error(e)) => return Err(ErrorKind::ProtocolViolation(e.to_string())),
        _ => return Err(ErrorKind::ChannelClosed),
    }

    let join_msg = RoomMessage::Join.to_wire();
    rendezvous
        .send(join_msg.clone())
        .await
        .map_err(|e| ErrorKind::ProtocolViolation(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + OFFER_WAIT_TIMEOUT;
    let mut resend = tokio::time::interval(JOIN_RESEND_INTERVAL);
    resend.tick().await;

    let answer = loop {
        if tokio::time::Instant::now() >= deadline {
            rendezvous.disconnect();
            return Err(ErrorKind::Timeout("host offer"));
        }

        tokio::select! {
            _ = resend.tick() => {
                if let Err(e) = rendezvous.send(join_msg.clone()).await {
                    warn!(error = %e, "failed to resend join");
                }
            }
            event = bus_events.recv() => {
                match event {
                    Some(RendezvousEvent::Message(payload)) => {
                        let Some(RoomMessage::Signal { content }) = RoomMessage::parse(&payload) else {
                            continue;
                        };
                        match session.create_answer(&content).await {
                            Ok(answer) => break answer,
                            Err(ErrorKind::ProtocolViolation(_)) => {
                                debug!("ignoring signal that is not a valid offer");
                            }
                            Err(e) => {
                                rendezvous.disconnect();
                                return Err(e);
                            }
                        }
                    }
                    Some(RendezvousEvent::Error(e)) => warn!(error = %e, "rendezvous bus error"),
                    Some(RendezvousEvent::Open) => {}
                    None => {
                        rendezvous.disconnect();
                        return Err(ErrorKind::ChannelClosed);
                    }
                }
            }
        }
    };

    let signal = RoomMessage::Signal { content: answer }.to_wire();
    if let Err(e) = rendezvous.send(signal).await {
        rendezvous.disconnect();
        return Err(ErrorKind::ProtocolViolation(e.to_string()));
    }

    info!(%code, "offer answered, waiting for connection");
    let mut carried = Vec::new();
    let connect_result = wait_connected(&mut events_rx, &mut carried, CONNECT_TIMEOUT).await;
    rendezvous.disconnect();
    connect_result?;

    send_hello(&session, &cfg).await;

    Ok(Handshake {
        session,
        events: replay_and_forward(carried, events_rx),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_resend_interval_is_reasonable() {
        assert!(JOIN_RESEND_INTERVAL >= Duration::from_secs(1));
        assert!(JOIN_RESEND_INTERVAL <= OFFER_WAIT_TIMEOUT);
    }
}
