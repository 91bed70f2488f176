//! File-channel binary frame layout: `[u32 seq BE][u32 len BE][payload]`.

use bytes::{Bytes, BytesMut};

use crate::FRAME_HEADER_SIZE;

/// A single decoded frame off a file channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(seq: u32, payload: Bytes) -> Self {
        Self { seq, payload }
    }

    /// Encode to `header ‖ payload`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame off the wire. `len` is clamped to the bytes actually
    /// trailing the header, matching the truncate-on-mismatch contract in
    /// spec.md §3/§6.
    pub fn decode(bytes: &[u8]) -> Option<Frame> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let seq = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        let declared_len = u32::from_be_bytes(bytes[4..8].try_into().ok()?) as usize;
        let trailing = &bytes[FRAME_HEADER_SIZE..];
        let len = declared_len.min(trailing.len());
        Some(Frame {
            seq,
            payload: Bytes::copy_from_slice(&trailing[..len]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame::new(42, Bytes::from_static(b"hello world"));
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_roundtrips() {
        let frame = Frame::new(0, Bytes::new());
        let encoded = frame.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.payload.len(), 0);
        assert_eq!(decoded.seq, 0);
    }

    #[test]
    fn declared_length_beyond_trailing_bytes_is_clamped() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(b"short");
        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded.seq, 7);
        assert_eq!(&decoded.payload[..], b"short");
    }

    #[test]
    fn truncated_header_fails_to_decode() {
        assert!(Frame::decode(&[0, 0, 0]).is_none());
    }
}
