//! The rendezvous room's app-level message layer, carried inside the bus
//! envelope's `dataStr` field.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Messages exchanged over a joined room, one layer above the transport
/// envelope the Rendezvous Client already strips.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoomMessage {
    #[serde(rename = "join")]
    Join,

    #[serde(rename = "signal")]
    Signal { content: String },
}

impl RoomMessage {
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).expect("room message always serializes")
    }

    pub fn parse(raw: &str) -> Option<RoomMessage> {
        serde_json::from_str(raw).ok()
    }
}

/// A fresh six-digit rendezvous code, zero-padded.
pub fn generate_room_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{n:06}")
}

/// Scope the bus URL to the room identified by `code`.
pub fn room_url(ws_base: &str, code: &str) -> String {
    format!("{}/{code}", ws_base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_code_is_six_digits() {
        for _ in 0..20 {
            let code = generate_room_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn room_url_appends_code_once() {
        assert_eq!(room_url("wss://example.com/ws", "123456"), "wss://example.com/ws/123456");
        assert_eq!(room_url("wss://example.com/ws/", "123456"), "wss://example.com/ws/123456");
    }

    #[test]
    fn room_message_wire_shapes() {
        assert_eq!(RoomMessage::Join.to_wire(), r#"{"type":"join"}"#);
        let signal = RoomMessage::Signal { content: "SHR2:abc".to_string() };
        assert_eq!(signal.to_wire(), r#"{"type":"signal","content":"SHR2:abc"}"#);

        assert!(matches!(RoomMessage::parse(r#"{"type":"join"}"#), Some(RoomMessage::Join)));
        assert!(matches!(
            RoomMessage::parse(r#"{"type":"signal","content":"x"}"#),
            Some(RoomMessage::Signal { .. })
        ));
        assert!(RoomMessage::parse("not json").is_none());
    }
}
