//! Central dispatch: the single consumer of [`PeerSessionEvent`], routing
//! control messages and file frames to the outgoing/incoming state machines,
//! plus the serialized outgoing send queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use peer_session::{PeerSession, PeerSessionEvent};
use sharefile_protocol::{CancelToken, Configuration, ControlMessage, ErrorKind};

use crate::events::TransferEvent;
use crate::incoming::IncomingTransfer;
use crate::outgoing::{self, OutgoingSignals};
use crate::sink::{ByteSource, TransferSink};

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Owns the negotiated session's control/file event stream and drives every
/// transfer through to completion, cancellation, or failure.
pub struct TransferManager {
    session: Arc<PeerSession>,
    cfg: Configuration,
    active_outgoing: Mutex<Option<(Arc<OutgoingSignals>, CancelToken)>>,
    incoming: Mutex<Option<IncomingTransfer>>,
    jobs_tx: mpsc::UnboundedSender<BoxedJob>,
    events_tx: mpsc::Sender<TransferEvent>,
}

impl TransferManager {
    /// Spawn the dispatch loop and the serialized outgoing-send worker.
    /// Consumes `session_events`; returns the manager plus the channel its
    /// caller should drain for [`TransferEvent`]s.
    pub fn spawn(
        session: Arc<PeerSession>,
        cfg: Configuration,
        mut session_events: mpsc::Receiver<PeerSessionEvent>,
    ) -> (Arc<Self>, mpsc::Receiver<TransferEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<BoxedJob>();

        let manager = Arc::new(Self {
            session,
            cfg,
            active_outgoing: Mutex::new(None),
            incoming: Mutex::new(None),
            jobs_tx,
            events_tx,
        });

        tokio::spawn(async move {
            while let Some(job) = jobs_rx.recv().await {
                job.await;
            }
        });

        let dispatch_manager = manager.clone();
        tokio::spawn(async move {
            while let Some(event) = session_events.recv().await {
                dispatch_manager.handle_session_event(event).await;
            }
        });

        (manager, events_rx)
    }

    async fn handle_session_event(&self, event: PeerSessionEvent) {
        match event {
            PeerSessionEvent::StatusChanged(status) => {
                if status.is_terminal() {
                    self.teardown_on_session_termination().await;
                }
            }
            PeerSessionEvent::Control(msg) => self.handle_control(msg).await,
            PeerSessionEvent::FileFrame { label, frame } => {
                self.handle_file_frame(label, frame.seq, frame.payload).await
            }
        }
    }

    /// Session went `failed`/`closed`/`disconnected`: cancel every active
    /// transfer without notifying the (unreachable) peer.
    async fn teardown_on_session_termination(&self) {
        if let Some((_, cancel)) = self.active_outgoing.lock().take() {
            cancel.abort();
        }
        if let Some(mut transfer) = self.incoming.lock().take() {
            transfer.cancel_locally().await;
        }
    }

    async fn handle_control(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::Hello { .. } => {}
            ControlMessage::HbPing { t } => {
                if let Err(e) = self.session.send_control(&ControlMessage::HbPong { t }).await {
                    warn!(error = %e, "failed to reply to heartbeat ping");
                }
            }
            ControlMessage::HbPong { .. } => {}
            ControlMessage::Text { text } => {
                let _ = self.events_tx.send(TransferEvent::TextReceived(text)).await;
            }
            ControlMessage::FileMeta { id, sid, sc, name, size } => {
                let mut guard = self.incoming.lock();
                if guard.is_some() {
                    debug!(id, "ignoring file-meta, a transfer is already active");
                    return;
                }
                *guard = Some(IncomingTransfer::new(
                    id.clone(),
                    sid,
                    sc,
                    name.clone(),
                    size,
                    self.cfg.transfer_fast,
                ));
                drop(guard);
                let _ = self
                    .events_tx
                    .send(TransferEvent::FileOffered { id, name, size })
                    .await;
            }
            ControlMessage::FileAccept { id } => {
                let guard = self.active_outgoing.lock();
                if let Some((signals, _)) = guard.as_ref() {
                    if signals.id == id {
                        signals.mark_accept();
                    }
                }
            }
            ControlMessage::FileAcceptAck { id } => {
                let mut guard = self.incoming.lock();
                if let Some(transfer) = guard.as_mut() {
                    if transfer.file_id == id {
                        transfer.mark_accept_acked();
                    }
                }
            }
            ControlMessage::FileDone { id } => {
                let guard = self.active_outgoing.lock();
                if let Some((signals, _)) = guard.as_ref() {
                    if signals.id == id {
                        signals.mark_done();
                    }
                }
            }
            ControlMessage::FileCancel { id, reason } => {
                self.handle_peer_cancel(id, reason).await;
            }
        }
    }

    async fn handle_peer_cancel(&self, id: String, reason: String) {
        let outgoing_match = {
            let guard = self.active_outgoing.lock();
            guard.as_ref().filter(|(s, _)| s.id == id).map(|(s, c)| (s.clone(), c.clone()))
        };
        if let Some((signals, cancel)) = outgoing_match {
            signals.mark_peer_cancel(reason.clone());
            cancel.abort();
        }

        let incoming_match = {
            let mut guard = self.incoming.lock();
            if guard.as_ref().is_some_and(|t| t.file_id == id) {
                guard.take()
            } else {
                None
            }
        };
        if let Some(mut transfer) = incoming_match {
            transfer.cancel_locally().await;
            let _ = self
                .events_tx
                .send(TransferEvent::FileCancelled { id, reason })
                .await;
        }
    }

    async fn handle_file_frame(&self, label: String, seq: u32, payload: bytes::Bytes) {
        let mut transfer = match self.incoming.lock().take() {
            Some(t) => t,
            None => {
                warn!(%label, "file frame with no active incoming transfer, dropping");
                return;
            }
        };

        if !transfer.owns_label(&label) {
            warn!(%label, id = %transfer.file_id, "file frame does not match active transfer, dropping");
            *self.incoming.lock() = Some(transfer);
            return;
        }

        match transfer.handle_frame(seq, payload).await {
            Ok(true) => {
                let id = transfer.file_id.clone();
                if let Err(e) = transfer.finish().await {
                    let _ = self
                        .events_tx
                        .send(TransferEvent::FileFailed { id, reason: e.to_string() })
                        .await;
                    return;
                }
                let _ = self.session.send_control(&ControlMessage::FileDone { id: id.clone() }).await;
                let _ = self.events_tx.send(TransferEvent::FileCompleted { id }).await;
            }
            Ok(false) => {
                *self.incoming.lock() = Some(transfer);
            }
            Err(e) => {
                let id = transfer.file_id.clone();
                transfer.cancel_locally().await;
                let _ = self
                    .events_tx
                    .send(TransferEvent::FileFailed { id, reason: e.to_string() })
                    .await;
            }
        }
    }

    /// Queue a file for sending. Returns a [`CancelToken`] the caller can
    /// abort to cancel this transfer specifically. Jobs run one at a time,
    /// strictly in enqueue order.
    pub fn enqueue_send(
        self: &Arc<Self>,
        file_id: String,
        name: String,
        source: Arc<dyn ByteSource>,
    ) -> CancelToken {
        let cancel = CancelToken::new();
        let signals = Arc::new(OutgoingSignals::new(file_id.clone()));
        let manager = self.clone();
        let job_signals = signals.clone();
        let job_cancel = cancel.clone();

        let job: BoxedJob = Box::pin(async move {
            *manager.active_outgoing.lock() = Some((job_signals.clone(), job_cancel.clone()));
            outgoing::run(
                manager.session.clone(),
                manager.cfg.clone(),
                file_id,
                name,
                source,
                job_signals,
                job_cancel,
                manager.events_tx.clone(),
            )
            .await;
            *manager.active_outgoing.lock() = None;
        });

        let _ = self.jobs_tx.send(job);
        cancel
    }

    /// Abort whichever outgoing transfer is currently running, if any.
    pub fn cancel_outgoing(&self) {
        if let Some((_, cancel)) = self.active_outgoing.lock().as_ref() {
            cancel.abort();
        }
    }

    /// User accepted `file_id`: attach `sink`, then resend `file-accept`
    /// every 700ms (bounded at 20 attempts) until `file-accept-ack` lands.
    pub fn accept_incoming(self: &Arc<Self>, file_id: &str, sink: Box<dyn TransferSink>) -> Result<(), ErrorKind> {
        let mut guard = self.incoming.lock();
        let transfer = guard.as_mut().ok_or(ErrorKind::ProtocolViolation("no incoming transfer".into()))?;
        if transfer.file_id != file_id {
            return Err(ErrorKind::ProtocolViolation("file id mismatch".into()));
        }
        transfer.attach_sink(sink);
        drop(guard);

        let manager = self.clone();
        let id = file_id.to_string();
        tokio::spawn(async move { manager.resend_accept_until_acked(id).await });
        Ok(())
    }

    async fn resend_accept_until_acked(self: Arc<Self>, file_id: String) {
        for _ in 0..20 {
            let acked = self
                .incoming
                .lock()
                .as_ref()
                .is_some_and(|t| t.file_id == file_id && t.accept_acked);
            if acked {
                return;
            }
            if let Err(e) = self
                .session
                .send_control(&ControlMessage::FileAccept { id: file_id.clone() })
                .await
            {
                warn!(error = %e, "failed to send file-accept");
                return;
            }
            tokio::time::sleep(Duration::from_millis(700)).await;
        }
        warn!(id = %file_id, "file-accept never acknowledged after 20 attempts");
    }

    /// Cancel the currently-offered or in-flight incoming transfer, if any,
    /// notifying the peer.
    pub async fn cancel_incoming(&self, reason: &str) {
        let transfer = self.incoming.lock().take();
        if let Some(mut transfer) = transfer {
            let id = transfer.file_id.clone();
            transfer.cancel_locally().await;
            let _ = self
                .session
                .send_control(&ControlMessage::FileCancel {
                    id,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ErrorKind> {
        self.session.send_control(&ControlMessage::Text { text: text.into() }).await
    }
}
