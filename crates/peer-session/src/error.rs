//! Maps `webrtc` crate failures onto the shared error taxonomy.

use sharefile_protocol::ErrorKind;

pub(crate) fn from_webrtc(err: webrtc::Error) -> ErrorKind {
    let msg = err.to_string();
    if msg.contains("send queue is full") {
        ErrorKind::QueueFull
    } else {
        ErrorKind::ProtocolViolation(msg)
    }
}
