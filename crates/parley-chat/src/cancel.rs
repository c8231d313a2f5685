//! Cooperative cancellation for one pipeline run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

/// A settable flag the pipeline checks at every suspension point.
///
/// Clones share the same flag. Setting it wakes any task waiting in
/// [`CancelFlag::cancelled`], so a pending countdown tick or token wait ends
/// early instead of running to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<Inner>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    /// Resolves once the flag is set. Returns immediately if it already is.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a `set` in between is not missed.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_and_clear() {
        let flag = CancelFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        flag.clear();
        assert!(!flag.is_set());
    }

    #[test]
    fn test_clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.set();
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn test_cancelled_returns_when_already_set() {
        let flag = CancelFlag::new();
        flag.set();
        tokio::time::timeout(Duration::from_millis(100), flag.cancelled())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn test_cancelled_wakes_on_set() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.set();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_pending_while_clear() {
        let flag = CancelFlag::new();
        let result = tokio::time::timeout(Duration::from_millis(20), flag.cancelled()).await;
        assert!(result.is_err());
    }
}
