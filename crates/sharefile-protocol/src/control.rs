//! Control-channel message schemas (spec-exact JSON shapes).

use serde::{Deserialize, Serialize};

/// Capability set advertised in `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `0|1` on the wire.
    pub striping: u8,
}

impl Capabilities {
    pub fn new(striping: bool) -> Self {
        Self {
            striping: striping as u8,
        }
    }

    pub fn striping_enabled(self) -> bool {
        self.striping != 0
    }
}

/// Every message exchanged on the ordered control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "hello")]
    Hello { v: u32, caps: Capabilities },

    #[serde(rename = "hb-ping")]
    HbPing { t: u64 },

    #[serde(rename = "hb-pong")]
    HbPong { t: u64 },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "file-meta")]
    FileMeta {
        id: String,
        sid: String,
        sc: u32,
        name: String,
        size: u64,
    },

    #[serde(rename = "file-accept")]
    FileAccept { id: String },

    #[serde(rename = "file-accept-ack")]
    FileAcceptAck { id: String },

    #[serde(rename = "file-done")]
    FileDone { id: String },

    #[serde(rename = "file-cancel")]
    FileCancel { id: String, reason: String },
}

impl ControlMessage {
    /// Parse a raw control-channel string. Plain strings that fail JSON
    /// parsing are delivered upstream as `Text`, matching the wire contract
    /// for non-JSON payloads.
    pub fn parse(raw: &str) -> ControlMessage {
        serde_json::from_str(raw).unwrap_or_else(|_| ControlMessage::Text {
            text: raw.to_string(),
        })
    }

    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrips() {
        let msg = ControlMessage::Hello {
            v: 1,
            caps: Capabilities::new(true),
        };
        let wire = msg.to_wire().unwrap();
        assert_eq!(wire, r#"{"type":"hello","v":1,"caps":{"striping":1}}"#);
        assert_eq!(ControlMessage::parse(&wire), msg);
    }

    #[test]
    fn invalid_json_falls_back_to_text() {
        let parsed = ControlMessage::parse("hello there, not json");
        assert_eq!(
            parsed,
            ControlMessage::Text {
                text: "hello there, not json".to_string()
            }
        );
    }

    #[test]
    fn file_meta_fields_match_wire_names() {
        let msg = ControlMessage::FileMeta {
            id: "f1".into(),
            sid: "base".into(),
            sc: 2,
            name: "a.bin".into(),
            size: 300_000,
        };
        let wire = msg.to_wire().unwrap();
        assert!(wire.contains("\"sid\":\"base\""));
        assert!(wire.contains("\"sc\":2"));
        assert_eq!(ControlMessage::parse(&wire), msg);
    }
}
