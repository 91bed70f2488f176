//! Signal Codec — encodes/decodes the opaque session-description blob
//! exchanged during handshake.

mod codec;
mod error;

pub use codec::{SignalCfg, SignalDescriptor, SignalKind, decode, encode, rewrite_host_candidates};
pub use error::SignalCodecError;
