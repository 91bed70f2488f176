//! Rendezvous client errors.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum RendezvousError {
    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
