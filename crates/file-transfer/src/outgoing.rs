//! Sender-side state machine: stripe channel acquisition, `file-meta`,
//! accept-wait, the chunked send pump, and cancel/failure unwinding.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tracing::warn;

use peer_session::PeerSession;
use sharefile_protocol::{CancelToken, Configuration, ControlMessage, ErrorKind, Frame, ShareResult};

use crate::events::TransferEvent;
use crate::framing::{self, BackpressureGovernor, StripeCursor};
use crate::sink::ByteSource;

/// Wait primitives for the single currently-active outgoing transfer.
/// Created before `file-meta` is sent, so a `file-accept` that arrives while
/// we're still between the meta send and the accept-wait simply sets the
/// flag early — no separate "early accept" buffer is needed.
pub struct OutgoingSignals {
    pub id: String,
    accept_seen: Mutex<bool>,
    accept_notify: Notify,
    done_seen: Mutex<bool>,
    done_notify: Notify,
    peer_cancel_reason: Mutex<Option<String>>,
}

impl OutgoingSignals {
    pub fn new(id: String) -> Self {
        Self {
            id,
            accept_seen: Mutex::new(false),
            accept_notify: Notify::new(),
            done_seen: Mutex::new(false),
            done_notify: Notify::new(),
            peer_cancel_reason: Mutex::new(None),
        }
    }

    pub fn mark_accept(&self) {
        *self.accept_seen.lock() = true;
        self.accept_notify.notify_waiters();
    }

    pub fn mark_done(&self) {
        *self.done_seen.lock() = true;
        self.done_notify.notify_waiters();
    }

    pub fn mark_peer_cancel(&self, reason: String) {
        *self.peer_cancel_reason.lock() = Some(reason);
    }

    pub fn peer_cancel_reason(&self) -> Option<String> {
        self.peer_cancel_reason.lock().clone()
    }
}

async fn wait_flag(
    notify: &Notify,
    seen: impl Fn() -> bool,
    total_timeout: Duration,
    cancel: &CancelToken,
) -> ShareResult<()> {
    let deadline = std::time::Instant::now() + total_timeout;
    loop {
        if seen() {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Err(ErrorKind::Timeout("waiting for peer"));
        }
        tokio::select! {
            _ = notify.notified() => {}
            _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
            _ = tokio::time::sleep(remaining) => return Err(ErrorKind::Timeout("waiting for peer")),
        }
    }
}

const STRIPE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Poll every stripe (via [`StripeCursor::pick_ready`]) until one drops back
/// under `high`, rather than committing to a single label's drain.
async fn wait_for_any_stripe_ready(
    cursor: &StripeCursor,
    session: &Arc<PeerSession>,
    high: u64,
    cancel: &CancelToken,
    total_timeout: Duration,
) -> ShareResult<String> {
    let deadline = std::time::Instant::now() + total_timeout;
    loop {
        if let Some(label) = cursor.pick_ready(session, high).await {
            return Ok(label);
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Err(ErrorKind::Timeout("waiting for a stripe to drain"));
        }
        tokio::select! {
            _ = tokio::time::sleep(STRIPE_POLL_INTERVAL.min(remaining)) => {}
            _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
        }
    }
}

fn classify_cancel(signals: &OutgoingSignals) -> ErrorKind {
    match signals.peer_cancel_reason() {
        Some(reason) => ErrorKind::PeerCancelled(reason),
        None => ErrorKind::Cancelled,
    }
}

pub fn random_base_id() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// Drive one outgoing transfer to completion, cancellation, or failure.
/// Emits the terminal [`TransferEvent`] itself; the caller only needs to
/// clear the active-outgoing slot afterwards.
pub async fn run(
    session: Arc<PeerSession>,
    cfg: Configuration,
    file_id: String,
    name: String,
    source: Arc<dyn ByteSource>,
    signals: Arc<OutgoingSignals>,
    cancel: CancelToken,
    events_tx: tokio::sync::mpsc::Sender<TransferEvent>,
) {
    let result = run_inner(&session, &cfg, &file_id, &name, &source, &signals, &cancel).await;
    match result {
        Ok(()) => {
            let _ = events_tx.send(TransferEvent::FileCompleted { id: file_id }).await;
        }
        Err(ErrorKind::Cancelled) | Err(ErrorKind::PeerCancelled(_)) => {
            let reason = match result {
                Err(ErrorKind::PeerCancelled(r)) => r,
                _ => "cancelled".to_string(),
            };
            let _ = events_tx
                .send(TransferEvent::FileCancelled { id: file_id, reason })
                .await;
        }
        Err(e) => {
            let _ = events_tx
                .send(TransferEvent::FileFailed {
                    id: file_id,
                    reason: e.to_string(),
                })
                .await;
        }
    }
}

async fn run_inner(
    session: &Arc<PeerSession>,
    cfg: &Configuration,
    file_id: &str,
    name: &str,
    source: &Arc<dyn ByteSource>,
    signals: &Arc<OutgoingSignals>,
    cancel: &CancelToken,
) -> ShareResult<()> {
    if cancel.is_aborted() {
        return Err(ErrorKind::Cancelled);
    }

    let remote_caps = session.wait_for_remote_capabilities(5_000).await;
    let stripe_n = framing::stripe_count(
        cfg.use_striping,
        remote_caps.map(|c| c.striping_enabled()).unwrap_or(false),
    );
    let base = random_base_id();
    let size = source.size();

    let labels = session.ensure_file_channels(&base, stripe_n, 10_000).await?;

    if let Err(e) = session
        .send_control(&ControlMessage::FileMeta {
            id: file_id.to_string(),
            sid: base.clone(),
            sc: stripe_n as u32,
            name: name.to_string(),
            size,
        })
        .await
    {
        session.close_file_channels_by_prefix(&base).await;
        return Err(e);
    }

    if let Err(e) = wait_flag(
        &signals.accept_notify,
        || *signals.accept_seen.lock(),
        Duration::from_secs(600),
        cancel,
    )
    .await
    {
        let final_err = if cancel.is_aborted() { classify_cancel(signals) } else { e };
        return finish_with_cleanup(session, &base, file_id, final_err).await;
    }

    if let Err(e) = session.send_control(&ControlMessage::FileAcceptAck { id: file_id.to_string() }).await {
        return finish_with_cleanup(session, &base, file_id, e).await;
    }

    let governor = BackpressureGovernor::new();
    let cursor = StripeCursor::new(labels.clone());
    let chunk = framing::chunk_size(None);
    let budget = framing::pump_time_budget(cfg.transfer_fast);
    let mut batch_start = std::time::Instant::now();
    let mut offset = 0u64;
    let mut seq: u32 = 0;

    loop {
        if cancel.is_aborted() {
            return finish_with_cleanup(session, &base, file_id, classify_cancel(signals)).await;
        }

        let end = (offset + chunk as u64).min(size);
        let len = (end - offset) as usize;
        let payload = match source.read_slice(offset, len).await {
            Ok(p) => p,
            Err(e) => return finish_with_cleanup(session, &base, file_id, ErrorKind::SinkError(e.to_string())).await,
        };

        let label = match cursor.pick_ready(session, governor.high()).await {
            Some(l) => l,
            None => match wait_for_any_stripe_ready(
                &cursor,
                session,
                governor.high(),
                cancel,
                Duration::from_secs(30),
            )
            .await
            {
                Ok(l) => l,
                Err(e) => return finish_with_cleanup(session, &base, file_id, e).await,
            },
        };

        let frame = Frame::new(seq, payload);
        match session.send_frame(&label, &frame).await {
            Ok(()) => {}
            Err(ErrorKind::QueueFull) => {
                let drain_target = governor.on_queue_full();
                if let Err(e) = session
                    .wait_for_buffer(&label, governor.high(), drain_target, 30_000, cancel)
                    .await
                {
                    return finish_with_cleanup(session, &base, file_id, e).await;
                }
                continue;
            }
            Err(e) => return finish_with_cleanup(session, &base, file_id, e).await,
        }

        offset = end;
        seq += 1;
        if offset >= size {
            break;
        }

        if batch_start.elapsed() >= budget {
            tokio::task::yield_now().await;
            batch_start = std::time::Instant::now();
        }
    }

    if cfg.use_unordered_file_channels {
        if let Err(e) = wait_flag(
            &signals.done_notify,
            || *signals.done_seen.lock(),
            Duration::from_secs(600),
            cancel,
        )
        .await
        {
            let final_err = if cancel.is_aborted() { classify_cancel(signals) } else { e };
            return finish_with_cleanup(session, &base, file_id, final_err).await;
        }
    }

    session.close_file_channels_by_prefix(&base).await;
    Ok(())
}

/// On any failure after `file-meta` has been sent: notify the peer unless
/// they are the one who cancelled, then close our stripe channels.
async fn finish_with_cleanup(
    session: &Arc<PeerSession>,
    base: &str,
    file_id: &str,
    err: ErrorKind,
) -> ShareResult<()> {
    if !matches!(err, ErrorKind::PeerCancelled(_)) {
        let reason = err.to_string();
        if let Err(e) = session
            .send_control(&ControlMessage::FileCancel {
                id: file_id.to_string(),
                reason,
            })
            .await
        {
            warn!(error = %e, "failed to notify peer of outgoing cancel");
        }
    }
    session.close_file_channels_by_prefix(base).await;
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_base_ids_are_distinct() {
        assert_ne!(random_base_id(), random_base_id());
    }

    #[tokio::test]
    async fn wait_flag_resolves_once_seen_is_true() {
        let notify = Notify::new();
        let seen = Mutex::new(false);
        *seen.lock() = true;
        let cancel = CancelToken::new();
        wait_flag(&notify, || *seen.lock(), Duration::from_millis(50), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_flag_times_out() {
        let notify = Notify::new();
        let cancel = CancelToken::new();
        let err = wait_flag(&notify, || false, Duration::from_millis(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Timeout(_)));
    }

    #[tokio::test]
    async fn wait_flag_cancels() {
        let notify = Notify::new();
        let cancel = CancelToken::new();
        cancel.abort();
        let err = wait_flag(&notify, || false, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Cancelled));
    }
}
