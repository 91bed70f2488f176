//! Receiver-side state: `file-meta` → user accept → per-seq reassembly
//! across stripes → streaming write → `file-done`.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use sharefile_protocol::ErrorKind;

use crate::framing::flush_batch_target;
use crate::sink::TransferSink;

/// Write queue compaction thresholds, carried over from the original
/// array-backed queue: compacting on every pop would be wasteful, so the
/// consumed prefix is only dropped once it both exceeds 4096 items and more
/// than half the backing vector.
const COMPACT_MIN_CONSUMED: usize = 4096;

struct WriteQueue {
    items: Vec<Bytes>,
    consumed: usize,
    queued_bytes: u64,
}

impl WriteQueue {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            consumed: 0,
            queued_bytes: 0,
        }
    }

    fn push(&mut self, bytes: Bytes) {
        self.queued_bytes += bytes.len() as u64;
        self.items.push(bytes);
    }

    fn pop_front(&mut self) -> Option<Bytes> {
        if self.consumed >= self.items.len() {
            return None;
        }
        let item = self.items[self.consumed].clone();
        self.queued_bytes -= item.len() as u64;
        self.consumed += 1;
        self.maybe_compact();
        Some(item)
    }

    fn maybe_compact(&mut self) {
        if self.consumed > COMPACT_MIN_CONSUMED && self.consumed > self.items.len() / 2 {
            self.items.drain(0..self.consumed);
            self.consumed = 0;
        }
    }

    fn queued_bytes(&self) -> u64 {
        self.queued_bytes
    }

    fn is_empty(&self) -> bool {
        self.consumed >= self.items.len()
    }
}

pub struct IncomingTransfer {
    pub file_id: String,
    pub stream_base: String,
    pub stream_count: u32,
    pub name: String,
    pub size: u64,
    received: u64,
    expected_seq: u32,
    pending: BTreeMap<u32, Bytes>,
    sink: Option<Box<dyn TransferSink>>,
    write_queue: WriteQueue,
    fast: bool,
    accepted: bool,
    pub(crate) accept_acked: bool,
    pub(crate) accept_ack_notify: Notify,
    cancelled: bool,
}

impl IncomingTransfer {
    pub fn new(
        file_id: String,
        stream_base: String,
        stream_count: u32,
        name: String,
        size: u64,
        fast: bool,
    ) -> Self {
        Self {
            file_id,
            stream_base,
            stream_count,
            name,
            size,
            received: 0,
            expected_seq: 0,
            pending: BTreeMap::new(),
            sink: None,
            write_queue: WriteQueue::new(),
            fast,
            accepted: false,
            accept_acked: false,
            accept_ack_notify: Notify::new(),
            cancelled: false,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn accepted(&self) -> bool {
        self.accepted
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.size
    }

    pub fn attach_sink(&mut self, sink: Box<dyn TransferSink>) {
        self.sink = Some(sink);
        self.accepted = true;
    }

    pub fn mark_accept_acked(&mut self) {
        self.accept_acked = true;
        self.accept_ack_notify.notify_waiters();
    }

    /// Route label ownership: does `label` belong to this transfer's stripe
    /// set?
    pub fn owns_label(&self, label: &str) -> bool {
        sharefile_protocol::parse_file_channel_label(label)
            .map(|(base, _)| base == self.stream_base)
            .unwrap_or(false)
    }

    /// Handle one inbound frame. Returns `Ok(true)` once `received >= size`.
    pub async fn handle_frame(&mut self, seq: u32, payload: Bytes) -> Result<bool, ErrorKind> {
        if self.cancelled {
            return Ok(false);
        }

        if seq < self.expected_seq {
            debug!(seq, expected = self.expected_seq, "dropping duplicate frame");
            return Ok(self.is_complete());
        }

        if seq > self.expected_seq {
            self.pending.insert(seq, payload);
            return Ok(self.is_complete());
        }

        self.commit(payload);
        while let Some(next) = self.pending.remove(&self.expected_seq) {
            self.commit(next);
        }

        self.flush_if_due().await?;
        if self.is_complete() {
            self.flush_all().await?;
        }
        Ok(self.is_complete())
    }

    fn commit(&mut self, payload: Bytes) {
        self.received += payload.len() as u64;
        self.expected_seq += 1;
        self.write_queue.push(payload);
    }

    async fn flush_if_due(&mut self) -> Result<(), ErrorKind> {
        if self.write_queue.queued_bytes() >= flush_batch_target(self.fast) {
            self.flush_all().await?;
        }
        Ok(())
    }

    async fn flush_all(&mut self) -> Result<(), ErrorKind> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        while !self.write_queue.is_empty() {
            if let Some(chunk) = self.write_queue.pop_front() {
                sink.write(chunk)
                    .await
                    .map_err(|e| ErrorKind::SinkError(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Final flush plus sink close, called once `is_complete()` holds.
    pub async fn finish(&mut self) -> Result<(), ErrorKind> {
        self.flush_all().await?;
        if let Some(sink) = self.sink.as_mut() {
            sink.close()
                .await
                .map_err(|e| ErrorKind::SinkError(e.to_string()))?;
        }
        Ok(())
    }

    /// Cancel locally: abort the sink, clear all buffering. No peer
    /// notification — callers use this both for peer-initiated cancel and
    /// for session teardown.
    pub async fn cancel_locally(&mut self) {
        self.cancelled = true;
        self.pending.clear();
        self.write_queue = WriteQueue::new();
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.abort().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemorySink;

    fn transfer(size: u64) -> IncomingTransfer {
        IncomingTransfer::new("f1".into(), "base".into(), 1, "a.bin".into(), size, false)
    }

    #[tokio::test]
    async fn in_order_frames_commit_immediately() {
        let mut t = transfer(10);
        t.attach_sink(Box::new(InMemorySink::new()));
        assert!(!t.handle_frame(0, Bytes::from_static(b"01234")).await.unwrap());
        assert!(t.handle_frame(1, Bytes::from_static(b"56789")).await.unwrap());
        assert_eq!(t.received(), 10);
    }

    #[tokio::test]
    async fn reordered_frame_is_buffered_then_drained() {
        let mut t = transfer(10);
        t.attach_sink(Box::new(InMemorySink::new()));
        assert!(!t.handle_frame(1, Bytes::from_static(b"56789")).await.unwrap());
        assert_eq!(t.received(), 0);
        assert!(t.handle_frame(0, Bytes::from_static(b"01234")).await.unwrap());
        assert_eq!(t.received(), 10);
    }

    #[tokio::test]
    async fn duplicate_frame_is_dropped() {
        let mut t = transfer(10);
        t.attach_sink(Box::new(InMemorySink::new()));
        t.handle_frame(0, Bytes::from_static(b"01234")).await.unwrap();
        t.handle_frame(0, Bytes::from_static(b"01234")).await.unwrap();
        assert_eq!(t.received(), 5);
    }

    #[tokio::test]
    async fn empty_file_completes_on_single_zero_length_frame() {
        let mut t = transfer(0);
        t.attach_sink(Box::new(InMemorySink::new()));
        assert!(t.handle_frame(0, Bytes::new()).await.unwrap());
        assert_eq!(t.received(), 0);
    }

    #[tokio::test]
    async fn cancel_locally_clears_pending_and_aborts_sink() {
        let mut t = transfer(100);
        t.attach_sink(Box::new(InMemorySink::new()));
        t.handle_frame(5, Bytes::from_static(b"later")).await.unwrap();
        t.cancel_locally().await;
        assert!(t.handle_frame(0, Bytes::from_static(b"ignored")).await.unwrap() == false);
        assert_eq!(t.received(), 0);
    }
}
