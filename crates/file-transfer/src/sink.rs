//! Streaming write and random-access read capabilities, plus the in-memory
//! fallbacks used when no external collaborator is supplied.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Random-access byte source with known size, backing an outgoing transfer.
#[async_trait]
pub trait ByteSource: Send + Sync {
    fn size(&self) -> u64;
    async fn read_slice(&self, offset: u64, len: usize) -> std::io::Result<Bytes>;
}

/// Polymorphic write capability for an incoming transfer. When no sink is
/// supplied, transfers fall back to [`InMemorySink`].
#[async_trait]
pub trait TransferSink: Send + Sync {
    async fn write(&mut self, bytes: Bytes) -> std::io::Result<()>;
    async fn close(&mut self) -> std::io::Result<()>;
    async fn abort(&mut self) -> std::io::Result<()>;
}

/// In-memory byte source, mainly for tests.
pub struct InMemorySource {
    data: Bytes,
}

impl InMemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ByteSource for InMemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_slice(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let start = offset as usize;
        let end = (start + len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}

/// Appends every committed chunk into one buffer. The fallback sink used
/// when the caller supplies none, and the vehicle tests read completed
/// transfers back through.
#[derive(Default)]
pub struct InMemorySink {
    buffer: Mutex<BytesMut>,
    closed: Mutex<bool>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Bytes {
        self.buffer.lock().clone().freeze()
    }
}

#[async_trait]
impl TransferSink for InMemorySink {
    async fn write(&mut self, bytes: Bytes) -> std::io::Result<()> {
        self.buffer.lock().extend_from_slice(&bytes);
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }

    async fn abort(&mut self) -> std::io::Result<()> {
        self.buffer.lock().clear();
        *self.closed.lock() = true;
        Ok(())
    }
}
