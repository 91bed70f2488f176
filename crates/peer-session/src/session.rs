//! Peer Session — owns the negotiated transport: one control channel plus a
//! dynamic set of file channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use sharefile_protocol::{
    CONTROL_CHANNEL_LABEL, CancelToken, Capabilities, Configuration, ControlMessage, ErrorKind,
    FRAME_HEADER_SIZE, FILE_CHANNEL_PREFIX, Frame, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS,
    PeerStatus, ShareResult, file_channel_label,
};
use signal_codec::{SignalCfg, SignalDescriptor, SignalKind, decode, encode, rewrite_host_candidates};

use crate::error::from_webrtc;

/// Event surfaced to whatever orchestrates this session.
#[derive(Debug, Clone)]
pub enum PeerSessionEvent {
    StatusChanged(PeerStatus),
    Control(ControlMessage),
    FileFrame { label: String, frame: Frame },
}

struct SharedState {
    file_channels: DashMap<String, Arc<RTCDataChannel>>,
    control_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    remote_caps: Mutex<Option<Capabilities>>,
    caps_notify: Notify,
    status: RwLock<PeerStatus>,
    last_activity: Mutex<Instant>,
    hello_sent: AtomicBool,
    events_tx: mpsc::Sender<PeerSessionEvent>,
}

impl SharedState {
    fn new(events_tx: mpsc::Sender<PeerSessionEvent>) -> Self {
        Self {
            file_channels: DashMap::new(),
            control_channel: Mutex::new(None),
            remote_caps: Mutex::new(None),
            caps_notify: Notify::new(),
            status: RwLock::new(PeerStatus::New),
            last_activity: Mutex::new(Instant::now()),
            hello_sent: AtomicBool::new(false),
            events_tx,
        }
    }

    fn set_status(&self, status: PeerStatus) {
        let changed = *self.status.read() != status;
        if changed {
            *self.status.write() = status;
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(PeerSessionEvent::StatusChanged(status)).await;
            });
        }
    }

    fn mark_active(&self) {
        *self.last_activity.lock() = Instant::now();
        if *self.status.read() == PeerStatus::PeerTimeout {
            self.set_status(PeerStatus::Connected);
        }
    }
}

/// Owns one negotiated `RTCPeerConnection` and its channels.
pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    cfg: Configuration,
    shared: Arc<SharedState>,
    cancel: CancelToken,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerSession {
    /// Build a fresh session with configured ICE servers. Does not create
    /// any channel yet; call [`create_offer`](Self::create_offer) or wait for
    /// an inbound data channel (answerer side).
    pub async fn new(
        cfg: Configuration,
        events_tx: mpsc::Sender<PeerSessionEvent>,
    ) -> ShareResult<Self> {
        let shared = Arc::new(SharedState::new(events_tx));
        let pc = build_peer_connection(&cfg).await?;
        wire_connection_callbacks(&pc, shared.clone());

        Ok(Self {
            pc,
            cfg,
            shared,
            cancel: CancelToken::new(),
            heartbeat: Mutex::new(None),
        })
    }

    pub fn status(&self) -> PeerStatus {
        *self.shared.status.read()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Build a fresh pc, open the control channel, gather ICE, and return
    /// the encoded offer signal.
    pub async fn create_offer(&self) -> ShareResult<String> {
        self.shared.set_status(PeerStatus::Connecting);

        let dc_init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(CONTROL_CHANNEL_LABEL, Some(dc_init))
            .await
            .map_err(from_webrtc)?;
        *self.shared.control_channel.lock() = Some(dc.clone());
        wire_control_channel(dc, self.shared.clone());

        let offer = self.pc.create_offer(None).await.map_err(from_webrtc)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(from_webrtc)?;
        self.wait_ice_gathering_complete().await?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| ErrorKind::ProtocolViolation("no local description after gathering".into()))?;

        self.encode_local(SignalKind::Offer, &local.sdp)
    }

    /// Decode a peer's offer, mirror construction, and return the encoded
    /// answer signal.
    pub async fn create_answer(&self, offer_signal: &str) -> ShareResult<String> {
        self.shared.set_status(PeerStatus::Connecting);

        let (desc, _remote_cfg) = decode(offer_signal).map_err(Into::<ErrorKind>::into)?;
        if desc.kind != SignalKind::Offer {
            return Err(ErrorKind::ProtocolViolation("expected an offer signal".into()));
        }

        let remote = RTCSessionDescription::offer(desc.description).map_err(from_webrtc)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(from_webrtc)?;

        let answer = self.pc.create_answer(None).await.map_err(from_webrtc)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(from_webrtc)?;
        self.wait_ice_gathering_complete().await?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| ErrorKind::ProtocolViolation("no local description after gathering".into()))?;

        self.encode_local(SignalKind::Answer, &local.sdp)
    }

    /// Apply a peer's answer to our offer.
    pub async fn apply_answer(&self, answer_signal: &str) -> ShareResult<()> {
        let (desc, _remote_cfg) = decode(answer_signal).map_err(Into::<ErrorKind>::into)?;
        if desc.kind != SignalKind::Answer {
            return Err(ErrorKind::ProtocolViolation("expected an answer signal".into()));
        }
        let remote = RTCSessionDescription::answer(desc.description).map_err(from_webrtc)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(from_webrtc)?;
        Ok(())
    }

    fn encode_local(&self, kind: SignalKind, sdp: &str) -> ShareResult<String> {
        let rewritten = rewrite_host_candidates(sdp, self.cfg.lan_host_override);
        let signal_cfg = SignalCfg {
            stun: self.cfg.use_stun,
            file_unordered: self.cfg.use_unordered_file_channels,
            fast: self.cfg.transfer_fast,
        };
        Ok(encode(
            &SignalDescriptor {
                kind,
                description: rewritten,
            },
            signal_cfg,
            self.cfg.use_compression,
        ))
    }

    async fn wait_ice_gathering_complete(&self) -> ShareResult<()> {
        let budget = if self.cfg.use_stun {
            Duration::from_secs(15)
        } else {
            Duration::from_secs(7)
        };
        let mut gather_rx = self.pc.gathering_complete_promise().await;
        timeout(budget, gather_rx.recv())
            .await
            .map_err(|_| ErrorKind::Timeout("ice gathering"))?;
        Ok(())
    }

    /// Open `count` file channels for stripe base `base`, idempotent for
    /// channels already open or opening. Returns their wire labels in
    /// stripe order.
    pub async fn ensure_file_channels(
        &self,
        base: &str,
        count: usize,
        timeout_ms: u64,
    ) -> ShareResult<Vec<String>> {
        let mut labels = Vec::with_capacity(count);
        for k in 0..count {
            let label = file_channel_label(base, k);
            if !self.shared.file_channels.contains_key(&label) {
                let init = RTCDataChannelInit {
                    ordered: Some(!self.cfg.use_unordered_file_channels),
                    ..Default::default()
                };
                let dc = self
                    .pc
                    .create_data_channel(&label, Some(init))
                    .await
                    .map_err(from_webrtc)?;
                self.shared.file_channels.insert(label.clone(), dc.clone());
                wire_file_channel(dc, label.clone(), self.shared.clone());
            }
            labels.push(label);
        }

        for label in &labels {
            self.wait_channel_open(label, timeout_ms).await?;
        }
        Ok(labels)
    }

    async fn wait_channel_open(&self, label: &str, timeout_ms: u64) -> ShareResult<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let state = {
                let entry = self
                    .shared
                    .file_channels
                    .get(label)
                    .ok_or(ErrorKind::ChannelClosed)?;
                entry.value().ready_state()
            };
            if state == RTCDataChannelState::Open {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ErrorKind::Timeout("file channel open"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Current `bufferedAmount` of the named file channel.
    pub async fn buffered_amount(&self, label: &str) -> ShareResult<u64> {
        let dc = self
            .shared
            .file_channels
            .get(label)
            .map(|e| e.value().clone())
            .ok_or(ErrorKind::NotConnected)?;
        Ok(dc.buffered_amount().await as u64)
    }

    /// Close every file channel whose label is `base` or begins with
    /// `base:`.
    pub async fn close_file_channels_by_prefix(&self, base: &str) {
        let stripe0 = file_channel_label(base, 0);
        let striped_prefix = format!("{FILE_CHANNEL_PREFIX}{base}:");
        let matches: Vec<String> = self
            .shared
            .file_channels
            .iter()
            .map(|e| e.key().clone())
            .filter(|label| *label == stripe0 || label.starts_with(&striped_prefix))
            .collect();

        for label in matches {
            if let Some((_, dc)) = self.shared.file_channels.remove(&label) {
                let _ = dc.close().await;
            }
        }
    }

    /// Resolve once a `hello` has set the remote capabilities, or `None` on
    /// timeout.
    pub async fn wait_for_remote_capabilities(&self, timeout_ms: u64) -> Option<Capabilities> {
        if let Some(caps) = *self.shared.remote_caps.lock() {
            return Some(caps);
        }
        let notified = self.shared.caps_notify.notified();
        tokio::select! {
            _ = notified => *self.shared.remote_caps.lock(),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
        }
    }

    /// Send a control message iff the control channel is open.
    pub async fn send_control(&self, msg: &ControlMessage) -> ShareResult<()> {
        let dc = {
            let guard = self.shared.control_channel.lock();
            guard.clone().ok_or(ErrorKind::NotConnected)?
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(ErrorKind::NotConnected);
        }
        let wire = msg
            .to_wire()
            .map_err(|e| ErrorKind::ProtocolViolation(e.to_string()))?;
        dc.send_text(wire).await.map_err(from_webrtc)?;
        if matches!(msg, ControlMessage::Hello { .. }) {
            self.shared.hello_sent.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Send a raw frame on the file channel identified by `label`.
    pub async fn send_frame(&self, label: &str, frame: &Frame) -> ShareResult<()> {
        let dc = self
            .shared
            .file_channels
            .get(label)
            .map(|e| e.value().clone())
            .ok_or(ErrorKind::NotConnected)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(ErrorKind::NotConnected);
        }
        dc.send(&frame.encode()).await.map_err(from_webrtc)?;
        Ok(())
    }

    /// Resolve when `bufferedAmount <= low` or the channel leaves `open`.
    pub async fn wait_for_buffer(
        &self,
        label: &str,
        // `high` is the watermark the caller used to decide it should wait;
        // the wait itself only ever checks `low`.
        _high: u64,
        low: u64,
        timeout_ms: u64,
        cancel: &CancelToken,
    ) -> ShareResult<()> {
        let dc = self
            .shared
            .file_channels
            .get(label)
            .map(|e| e.value().clone())
            .ok_or(ErrorKind::NotConnected)?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if dc.ready_state() != RTCDataChannelState::Open {
                return Ok(());
            }
            if dc.buffered_amount().await as u64 <= low {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ErrorKind::Timeout("buffer drain"));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }

    /// Close the session: tears down the underlying connection, stops the
    /// heartbeat, and marks status closed. Idempotent.
    pub async fn close(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        self.cancel.abort();
        self.shared.caps_notify.notify_waiters();
        let _ = self.pc.close().await;
        self.shared.set_status(PeerStatus::Closed);
    }
}

async fn build_peer_connection(cfg: &Configuration) -> ShareResult<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(from_webrtc)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(from_webrtc)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let mut ice_servers = Vec::new();
    if cfg.use_stun {
        ice_servers.push(RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ..Default::default()
        });
    }
    let mut ice_transport_policy = RTCIceTransportPolicy::All;
    if let Some(turn) = &cfg.turn {
        ice_servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.user.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
        if turn.force_relay {
            ice_transport_policy = RTCIceTransportPolicy::Relay;
        }
    }

    let config = RTCConfiguration {
        ice_servers,
        ice_transport_policy,
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await.map_err(from_webrtc)?;
    Ok(Arc::new(pc))
}

fn wire_connection_callbacks(pc: &Arc<RTCPeerConnection>, shared: Arc<SharedState>) {
    let status_shared = shared.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let shared = status_shared.clone();
        Box::pin(async move {
            debug!(?state, "peer connection state changed");
            match state {
                RTCPeerConnectionState::Connected => shared.set_status(PeerStatus::Connected),
                RTCPeerConnectionState::Disconnected => shared.set_status(PeerStatus::Disconnected),
                RTCPeerConnectionState::Failed => shared.set_status(PeerStatus::Failed),
                RTCPeerConnectionState::Closed => shared.set_status(PeerStatus::Closed),
                _ => {}
            }
        })
    }));

    let dc_shared = shared.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let shared = dc_shared.clone();
        Box::pin(async move {
            let label = dc.label().to_string();
            if label == CONTROL_CHANNEL_LABEL || shared.control_channel.lock().is_none() {
                info!(%label, "inbound control channel");
                *shared.control_channel.lock() = Some(dc.clone());
                wire_control_channel(dc, shared);
            } else if label.starts_with(FILE_CHANNEL_PREFIX) {
                info!(%label, "inbound file channel");
                shared.file_channels.insert(label.clone(), dc.clone());
                wire_file_channel(dc, label, shared);
            } else {
                warn!(%label, "unroutable inbound data channel, ignoring");
            }
        })
    }));
}

fn wire_control_channel(dc: Arc<RTCDataChannel>, shared: Arc<SharedState>) {
    let open_shared = shared.clone();
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        let shared = open_shared.clone();
        let dc = open_dc.clone();
        Box::pin(async move {
            info!("control channel open");
            start_heartbeat(dc, shared);
        })
    }));

    let msg_shared = shared.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let shared = msg_shared.clone();
        Box::pin(async move {
            shared.mark_active();
            let Ok(text) = String::from_utf8(msg.data.to_vec()) else {
                warn!("non-utf8 payload on control channel");
                return;
            };
            let parsed = ControlMessage::parse(&text);

            if let ControlMessage::Hello { caps, .. } = &parsed {
                *shared.remote_caps.lock() = Some(*caps);
                shared.caps_notify.notify_waiters();
            }
            let _ = shared.events_tx.send(PeerSessionEvent::Control(parsed)).await;
        })
    }));
}

fn wire_file_channel(dc: Arc<RTCDataChannel>, label: String, shared: Arc<SharedState>) {
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let shared = shared.clone();
        let label = label.clone();
        Box::pin(async move {
            shared.mark_active();
            let bytes: Bytes = msg.data;
            if bytes.len() < FRAME_HEADER_SIZE {
                warn!(%label, "short frame on file channel, dropping");
                return;
            }
            if let Some(frame) = Frame::decode(&bytes) {
                let _ = shared
                    .events_tx
                    .send(PeerSessionEvent::FileFrame { label, frame })
                    .await;
            }
        })
    }));
}

/// `hello` must precede any `hb-*` message (spec.md's control-message
/// ordering invariant), but the data channel's `on_open` and the hello send
/// (triggered by the orchestrator observing `Connected`) fire from
/// independent callbacks with no ordering between them. Skip ticks until
/// `hello_sent` is observed rather than relying on the two racing to land in
/// the right order.
fn start_heartbeat(dc: Arc<RTCDataChannel>, shared: Arc<SharedState>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(HEARTBEAT_INTERVAL_MS)).await;
            if dc.ready_state() != RTCDataChannelState::Open {
                break;
            }
            if !shared.hello_sent.load(Ordering::SeqCst) {
                continue;
            }

            let ping = ControlMessage::HbPing { t: now_millis() };
            if let Ok(wire) = ping.to_wire() {
                if dc.send_text(wire).await.is_err() {
                    break;
                }
            }

            let elapsed = shared.last_activity.lock().elapsed();
            if elapsed >= Duration::from_millis(HEARTBEAT_TIMEOUT_MS) {
                shared.set_status(PeerStatus::PeerTimeout);
            }
        }
    });
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_active_recovers_from_peer_timeout() {
        let (tx, _rx) = mpsc::channel(8);
        let shared = SharedState::new(tx);
        shared.set_status(PeerStatus::Connected);
        *shared.status.write() = PeerStatus::PeerTimeout;
        assert_eq!(*shared.status.read(), PeerStatus::PeerTimeout);

        shared.mark_active();
        assert_eq!(*shared.status.read(), PeerStatus::Connected);
    }

    #[tokio::test]
    async fn set_status_emits_event_only_on_change() {
        let (tx, mut rx) = mpsc::channel(8);
        let shared = SharedState::new(tx);
        shared.set_status(PeerStatus::New);
        shared.set_status(PeerStatus::Connecting);
        shared.set_status(PeerStatus::Connecting);

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            PeerSessionEvent::StatusChanged(PeerStatus::Connecting)
        ));
        assert!(rx.try_recv().is_err());
    }
}
