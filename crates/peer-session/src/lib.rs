//! Peer Session — owns the negotiated WebRTC transport: one control channel
//! plus a dynamic set of file channels. Drives ICE gathering, applies
//! remote descriptions, exposes capability exchange, heartbeat, and channel
//! open/close lifecycle.

mod error;
mod session;

pub use session::{PeerSession, PeerSessionEvent};
