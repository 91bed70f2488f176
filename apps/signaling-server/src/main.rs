//! Sharefile Signaling Server
//!
//! A dumb pub/sub broadcast bus: peers join a room named by the rendezvous
//! code and every text message one sends is relayed verbatim to every
//! member of that room, sender included. The bus never inspects payloads —
//! envelope shape, self-echo suppression and signal decoding are entirely
//! the Rendezvous Client's and Handshake Orchestrator's concern.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

type PeerTx = mpsc::Sender<String>;
type Room = DashMap<Uuid, PeerTx>;

#[derive(Clone, Default)]
struct AppState {
    rooms: Arc<DashMap<String, Arc<Room>>>,
}

impl AppState {
    fn room(&self, code: &str) -> Arc<Room> {
        self.rooms
            .entry(code.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("signaling_server=debug".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    info!("Starting Sharefile Signaling Server");

    let state = AppState::default();

    let app = Router::new()
        .route("/ws/{code}", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn stats_handler(State(state): State<AppState>) -> String {
    let room_count = state.rooms.len();
    let peer_count: usize = state.rooms.iter().map(|r| r.len()).sum();
    format!(r#"{{"rooms": {room_count}, "peers": {peer_count}}}"#)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_room_member(socket, code, state))
}

async fn handle_room_member(socket: WebSocket, code: String, state: AppState) {
    let id = Uuid::new_v4();
    let room = state.room(&code);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (msg_tx, mut msg_rx) = mpsc::channel::<String>(64);

    room.insert(id, msg_tx);
    info!(%code, members = room.len(), "peer joined room");

    let forward_task = tokio::spawn(async move {
        while let Some(payload) = msg_rx.recv().await {
            if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => broadcast(&room, text.to_string()).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {
                debug!(%code, "ignoring non-text frame on the bus");
            }
            Err(e) => {
                warn!(%code, error = %e, "websocket error");
                break;
            }
        }
    }

    room.remove(&id);
    if room.is_empty() {
        state.rooms.remove(&code);
    }
    info!(%code, "peer left room");
    forward_task.abort();
}

/// Relay `payload` to every member currently in `room`, sender included —
/// self-echo suppression happens client-side, keyed by `senderId`.
async fn broadcast(room: &Room, payload: String) {
    for entry in room.iter() {
        let _ = entry.value().send(payload.clone()).await;
    }
}
