//! Handshake Orchestrator — the sender and receiver rendezvous-code flows
//! that get two Peer Sessions from nothing in common to a negotiated
//! connection, gluing together the Signal Codec, the Rendezvous Client and
//! the Peer Session.

mod common;
mod host;
mod join;
mod outcome;
mod room;

pub use host::host;
pub use join::join;
pub use outcome::Handshake;
pub use room::{generate_room_code, room_url, RoomMessage};
