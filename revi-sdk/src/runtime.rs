//! Small scheduling primitives shared by the long-running parts of the SDK.
//!
//! Every retry loop, sync drain and health probe accepts a [`CancelToken`].
//! Cancellation is cooperative: in-flight work is allowed to settle
//! naturally, pending delays and remaining work are skipped.

use tokio::sync::watch;

/// A cloneable cancellation signal.
///
/// Any clone can cancel; all clones observe it. Dropping tokens never
/// cancels implicitly — destruction of the agent calls [`CancelToken::cancel`]
/// explicitly so background tasks wind down in a defined order.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelToken {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the signal fires. Resolves immediately if it already
    /// has.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Closed sender means the token can no longer fire; treat as
        // cancelled so waiters do not hang forever.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
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
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_is_observed_by_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        // Does not hang.
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(task.await.unwrap());
    }
}
