use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// One-shot cancellation flag shared between a motion and whoever may supersede it.
///
/// Clones observe the same flag. Cancelling is idempotent and never blocks.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// True when both handles refer to the same token.
    pub fn same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` only returns on a cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleeps for `duration` unless cancelled first. Returns true if the full
    /// duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
        }
    }
}
