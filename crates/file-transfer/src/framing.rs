//! Binary framing & backpressure: watermarks, adaptive pacing, the
//! round-robin stripe cursor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use peer_session::PeerSession;
use sharefile_protocol::{FRAME_HEADER_SIZE, MAX_STRIPE_COUNT, TARGET_CHUNK_SIZE};
use sysinfo::System;

const MIB: u64 = 1024 * 1024;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn host_memory_gib() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() as f64 / GIB
}

fn host_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Per-channel high watermark for the current host, before any adaptation.
pub fn default_high_watermark() -> u64 {
    let mem_gib = host_memory_gib();
    if mem_gib >= 8.0 {
        64 * MIB
    } else if mem_gib >= 4.0 {
        32 * MIB
    } else if mem_gib < 2.0 {
        8 * MIB
    } else {
        16 * MIB
    }
}

pub fn low_watermark_for(high: u64) -> u64 {
    (high / 4).max(MIB)
}

/// How many parallel file channels an outgoing transfer should open.
pub fn stripe_count(striping_enabled: bool, remote_supports_striping: bool) -> usize {
    if !striping_enabled || !remote_supports_striping {
        return 1;
    }
    let mem_gib = host_memory_gib();
    let mut count = 2usize;
    if mem_gib >= 4.0 {
        count = 3;
    }
    if mem_gib >= 8.0 {
        count = 4;
    }
    if host_cores() <= 4 {
        count = count.min(2);
    }
    count.clamp(1, MAX_STRIPE_COUNT)
}

/// Chunk size, clamped to the transport's max message size if known.
pub fn chunk_size(max_message_size: Option<usize>) -> usize {
    match max_message_size {
        Some(max) => TARGET_CHUNK_SIZE.min(max.saturating_sub(FRAME_HEADER_SIZE)),
        None => TARGET_CHUNK_SIZE,
    }
}

/// Write-queue flush batch target in bytes.
pub fn flush_batch_target(fast: bool) -> u64 {
    let mem_gib = host_memory_gib();
    let mut target = 4 * MIB;
    if mem_gib >= 4.0 {
        target = 8 * MIB;
    }
    if mem_gib >= 8.0 {
        target = 16 * MIB;
    }
    if fast {
        target *= 2;
    }
    target
}

/// Send-pump time budget before yielding.
pub fn pump_time_budget(fast: bool) -> Duration {
    if fast {
        Duration::from_millis(180)
    } else {
        Duration::from_millis(32)
    }
}

/// Per-transfer backpressure state. Shared across all stripes of one
/// outgoing transfer: a queue-full error on any stripe adapts the watermark
/// used by all of them.
pub struct BackpressureGovernor {
    high: AtomicU64,
    low: AtomicU64,
}

impl BackpressureGovernor {
    pub fn new() -> Self {
        let high = default_high_watermark();
        Self {
            high: AtomicU64::new(high),
            low: AtomicU64::new(low_watermark_for(high)),
        }
    }

    pub fn high(&self) -> u64 {
        self.high.load(Ordering::Relaxed)
    }

    pub fn low(&self) -> u64 {
        self.low.load(Ordering::Relaxed)
    }

    /// React to a "send queue is full" error: halve `high` (floor 1 MiB),
    /// recompute `low`. Returns the 1 MiB drain target the caller should
    /// wait for before resuming.
    pub fn on_queue_full(&self) -> u64 {
        let new_high = (self.high() / 2).max(MIB);
        self.high.store(new_high, Ordering::Relaxed);
        self.low.store(low_watermark_for(new_high), Ordering::Relaxed);
        MIB
    }
}

impl Default for BackpressureGovernor {
    fn default() -> Self {
        Self::new()
    }
}

/// Round-robins across a file transfer's stripe channels, skipping any
/// whose `bufferedAmount` is at or above the governor's high watermark.
pub struct StripeCursor {
    labels: Vec<String>,
    next: AtomicUsize,
}

impl StripeCursor {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Pick the next channel whose `bufferedAmount < high`, trying each
    /// stripe once starting from the cursor. Returns `None` if every stripe
    /// is currently over the watermark.
    pub async fn pick_ready(
        &self,
        session: &Arc<PeerSession>,
        high: u64,
    ) -> Option<String> {
        let count = self.labels.len();
        for _ in 0..count {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % count;
            let label = &self.labels[idx];
            if let Ok(buffered) = session.buffered_amount(label).await {
                if buffered < high {
                    return Some(label.clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_halves_high_with_floor() {
        let governor = BackpressureGovernor::new();
        governor.high.store(2 * MIB, Ordering::Relaxed);
        let drain_target = governor.on_queue_full();
        assert_eq!(governor.high(), MIB);
        assert_eq!(governor.low(), MIB);
        assert_eq!(drain_target, MIB);
    }

    #[test]
    fn queue_full_never_drops_high_below_one_mib() {
        let governor = BackpressureGovernor::new();
        governor.high.store(512 * 1024, Ordering::Relaxed);
        governor.on_queue_full();
        assert_eq!(governor.high(), MIB);
    }

    #[test]
    fn chunk_size_clamps_to_transport_max() {
        assert_eq!(chunk_size(None), TARGET_CHUNK_SIZE);
        assert_eq!(chunk_size(Some(1024)), 1024 - FRAME_HEADER_SIZE);
    }

    #[test]
    fn stripe_count_is_one_unless_both_sides_stripe() {
        assert_eq!(stripe_count(false, true), 1);
        assert_eq!(stripe_count(true, false), 1);
        assert!(stripe_count(true, true) >= 1);
    }
}
