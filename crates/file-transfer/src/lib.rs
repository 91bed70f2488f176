//! File Transfer — outgoing/incoming file state machines, backpressure and
//! striping policy, and the [`TransferManager`] that dispatches a Peer
//! Session's control/file events to them.

mod events;
pub mod framing;
pub mod incoming;
mod manager;
pub mod outgoing;
mod sink;

pub use events::TransferEvent;
pub use incoming::IncomingTransfer;
pub use manager::TransferManager;
pub use outgoing::{random_base_id, OutgoingSignals};
pub use sink::{ByteSource, InMemorySink, InMemorySource, TransferSink};
