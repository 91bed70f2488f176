//! The bus transport envelope: `{senderId, dataStr}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "dataStr")]
    pub data_str: String,
}
