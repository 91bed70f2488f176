//! A single cancellation primitive shared down every transfer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

struct Inner {
    aborted: AtomicBool,
    notify: Notify,
}

/// Cheaply cloneable cancel token. Every blocking wait in the core
/// (`waitForBuffer`, `waitForAccept`, `waitForDone`, `waitForRemoteCaps`, the
/// send pump) races against [`CancelToken::cancelled`] and fails with
/// `ErrorKind::Cancelled` when it wins.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                aborted: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Abort the token. Idempotent: a second call is a no-op.
    pub fn abort(&self) {
        if !self.inner.aborted.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once [`abort`](Self::abort) has been called. Resolves
    /// immediately if already aborted.
    pub async fn cancelled(&self) {
        if self.is_aborted() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_is_idempotent_and_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_aborted());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        token.abort();
        token.abort();
        assert!(token.is_aborted());

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_aborted() {
        let token = CancelToken::new();
        token.abort();
        token.cancelled().await;
    }
}
