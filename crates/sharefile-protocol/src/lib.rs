//! Shared Protocol Definitions for sharefile
//!
//! Wire-level message shapes, the Configuration record, the closed error
//! taxonomy, and the cancellation primitive shared across every other crate
//! in the workspace.

mod cancel;
mod config;
mod control;
mod error;
mod frame;
mod status;

pub use cancel::*;
pub use config::*;
pub use control::*;
pub use error::*;
pub use frame::*;
pub use status::*;

/// Control channel label (exact match).
pub const CONTROL_CHANNEL_LABEL: &str = "sharefile-ctrl";

/// File channel label prefix; stripe 0 uses this bare, stripe k>=1 appends `:<k>`.
pub const FILE_CHANNEL_PREFIX: &str = "sharefile-file:";

/// Target chunk size before clamping to the transport's max message size.
pub const TARGET_CHUNK_SIZE: usize = 256 * 1024;

/// Frame header size in bytes: 4-byte seq + 4-byte len.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Heartbeat ping interval.
pub const HEARTBEAT_INTERVAL_MS: u64 = 1_200;

/// Peer considered timed out after this long without inbound activity.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

/// Maximum stripe count for a single outgoing file.
pub const MAX_STRIPE_COUNT: usize = 8;

/// Build a file channel label for stripe `k` of stripe base `base`.
pub fn file_channel_label(base: &str, k: usize) -> String {
    if k == 0 {
        format!("{FILE_CHANNEL_PREFIX}{base}")
    } else {
        format!("{FILE_CHANNEL_PREFIX}{base}:{k}")
    }
}

/// Parse a file channel label into `(base, stripe index)`, or `None` if the
/// label is not a file channel label.
pub fn parse_file_channel_label(label: &str) -> Option<(&str, usize)> {
    let rest = label.strip_prefix(FILE_CHANNEL_PREFIX)?;
    match rest.rsplit_once(':') {
        Some((base, idx)) => idx.parse::<usize>().ok().map(|i| (base, i)),
        None => Some((rest, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_label_roundtrip() {
        assert_eq!(file_channel_label("abc123", 0), "sharefile-file:abc123");
        assert_eq!(file_channel_label("abc123", 3), "sharefile-file:abc123:3");

        assert_eq!(
            parse_file_channel_label("sharefile-file:abc123"),
            Some(("abc123", 0))
        );
        assert_eq!(
            parse_file_channel_label("sharefile-file:abc123:3"),
            Some(("abc123", 3))
        );
        assert_eq!(parse_file_channel_label("sharefile-ctrl"), None);
    }
}
