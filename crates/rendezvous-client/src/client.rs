//! Thin adapter over a WebSocket broadcast bus: joins a room, filters
//! self-echo, surfaces messages, reports link status, debounces errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::envelope::BusEnvelope;
use crate::error::RendezvousError;

const ERROR_DEBOUNCE: Duration = Duration::from_secs(4);

/// Event surfaced to the handshake orchestrator.
#[derive(Debug, Clone)]
pub enum RendezvousEvent {
    Open,
    Message(String),
    Error(RendezvousError),
}

/// A joined room connection. The background task owns the socket; this
/// handle only exposes channel ends, matching the teacher's
/// connect()-returns-channel-pair shape.
pub struct RendezvousClient {
    client_id: String,
    outbound: mpsc::Sender<String>,
    shutdown: Arc<Notify>,
}

impl RendezvousClient {
    /// Connect to `url` (already scoped to the target room by the caller)
    /// and start the background I/O task. Returns the client handle plus an
    /// event receiver.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<RendezvousEvent>), RendezvousError> {
        let client_id = generate_client_id();
        info!(%url, %client_id, "connecting to rendezvous bus");

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| RendezvousError::ChannelError(e.to_string()))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let (event_tx, event_rx) = mpsc::channel::<RendezvousEvent>(64);

        let shutdown = Arc::new(Notify::new());
        let task_shutdown = shutdown.clone();
        let self_id = client_id.clone();

        let _ = event_tx.send(RendezvousEvent::Open).await;

        tokio::spawn(async move {
            let mut last_error_at: HashMap<String, Instant> = HashMap::new();

            loop {
                tokio::select! {
                    _ = task_shutdown.notified() => break,

                    Some(payload) = outbound_rx.recv() => {
                        let envelope = BusEnvelope {
                            sender_id: self_id.clone(),
                            data_str: payload,
                        };
                        let json = match serde_json::to_string(&envelope) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize outgoing envelope");
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                            emit_rate_limited(
                                &event_tx,
                                &mut last_error_at,
                                RendezvousError::ChannelError(e.to_string()),
                            ).await;
                            break;
                        }
                    }

                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<BusEnvelope>(&text) {
                                    Ok(envelope) if envelope.sender_id == self_id => {
                                        debug!("dropped self-echo");
                                    }
                                    Ok(envelope) => {
                                        if event_tx.send(RendezvousEvent::Message(envelope.data_str)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        emit_rate_limited(
                                            &event_tx,
                                            &mut last_error_at,
                                            RendezvousError::ChannelError(e.to_string()),
                                        ).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("rendezvous bus closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                emit_rate_limited(
                                    &event_tx,
                                    &mut last_error_at,
                                    RendezvousError::ChannelError(e.to_string()),
                                ).await;
                            }
                        }
                    }

                    else => break,
                }
            }
            info!("rendezvous client loop ended");
        });

        Ok((
            Self {
                client_id,
                outbound: outbound_tx,
                shutdown,
            },
            event_rx,
        ))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Broadcast `payload` to the room. Surfaces an error only if the
    /// background task has already stopped; the bus's own ack is implicit in
    /// the channel send succeeding.
    pub async fn send(&self, payload: String) -> Result<(), RendezvousError> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| RendezvousError::ChannelError("rendezvous task stopped".into()))
    }

    /// Idempotent: tears down the background task and clears state. Safe to
    /// call more than once; a missed wakeup just leaves a stored permit that
    /// the next `notified()` call consumes immediately.
    pub fn disconnect(&self) {
        self.shutdown.notify_one();
    }
}

async fn emit_rate_limited(
    event_tx: &mpsc::Sender<RendezvousEvent>,
    last_error_at: &mut HashMap<String, Instant>,
    error: RendezvousError,
) {
    let key = error.to_string();
    let now = Instant::now();
    if let Some(last) = last_error_at.get(&key) {
        if now.duration_since(*last) < ERROR_DEBOUNCE {
            return;
        }
    }
    last_error_at.insert(key, now);
    let _ = event_tx.send(RendezvousEvent::Error(error)).await;
}

fn generate_client_id() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_client_ids_are_distinct() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
