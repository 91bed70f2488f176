//! Sender-side rendezvous flow: mint a code, broadcast the offer until the
//! first valid answer lands, then hand off to the connected session.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peer_session::PeerSession;
use rendezvous_client::{RendezvousClient, RendezvousEvent};
use sharefile_protocol::{Configuration, ErrorKind, ShareResult};

use crate::common::{replay_and_forward, send_hello, wait_connected};
use crate::outcome::Handshake;
use crate::room::{RoomMessage, generate_room_code, room_url};

const OFFER_RESEND_INTERVAL: Duration = Duration::from_secs(3);
const ANSWER_WAIT_TIMEOUT: Duration = Duration::from_secs(180);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Mint a rendezvous code, publish the offer, and wait for the peer to
/// answer and connect. Returns the code (so the caller can display it)
/// alongside the completed handshake.
pub async fn host(ws_base: &str, cfg: Configuration) -> ShareResult<(String, Handshake)> {
    let code = generate_room_code();
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let session = std::sync::Arc::new(PeerSession::new(cfg.clone(), events_tx).await?);

    let offer = session.create_offer().await?;

    let url = room_url(ws_base, &code);
    let (rendezvous, mut bus_events) = RendezvousClient::connect(&url).await.map_err(|e| {
        ErrorKind::ProtocolViolation(format!("rendezvous connect failed: {e}"))
    })?;

    // Wait for the bus to open before broadcasting; `Open` is always the
    // first event a fresh connection surfaces.
    match bus_events.recv().await {
        Some(RendezvousEvent::Open) => {}
        Some(RendezvousEvent::Error(e)) => return Err(ErrorKind::ProtocolViolation(e.to_string())),
        _ => return Err(ErrorKind::ChannelClosed),
    }

    let signal = RoomMessage::Signal { content: offer }.to_wire();
    rendezvous
        .send(signal.clone())
        .await
        .map_err(|e| ErrorKind::ProtocolViolation(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + ANSWER_WAIT_TIMEOUT;
    let mut resend = tokio::time::interval(OFFER_RESEND_INTERVAL);
    resend.tick().await; // first tick fires immediately; we already sent once

    loop {
        if tokio::time::Instant::now() >= deadline {
            rendezvous.disconnect();
            return Err(ErrorKind::Timeout("peer to answer"));
        }

        tokio::select! {
            _ = resend.tick() => {
                if let Err(e) = rendezvous.send(signal.clone()).await {
                    warn!(error = %e, "failed to resend offer");
                }
            }
            event = bus_events.recv() => {
                match event {
                    Some(RendezvousEvent::Message(payload)) => {
                        let Some(RoomMessage::Signal { content }) = RoomMessage::parse(&payload) else {
                            continue;
                        };
                        match session.apply_answer(&content).await {
                            Ok(()) => break,
                            Err(ErrorKind::ProtocolViolation(_)) => {
                                debug!("ignoring signal that is not a valid answer");
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
    }

    info!(%code, "answer applied, waiting for connection");
    let mut carried = Vec::new();
    let connect_result = wait_connected(&mut events_rx, &mut carried, CONNECT_TIMEOUT).await;
    rendezvous.disconnect();
    connect_result?;

    send_hello(&session, &cfg).await;

    Ok((
        code,
        Handshake {
            session,
            events: replay_and_forward(carried, events_rx),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_resend_interval_is_reasonable() {
        assert!(OFFER_RESEND_INTERVAL >= Duration::from_secs(1));
        assert!(OFFER_RESEND_INTERVAL <= ANSWER_WAIT_TIMEOUT);
    }
}
