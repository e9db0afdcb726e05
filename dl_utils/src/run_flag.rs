use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::broadcast;

/// Cancellation flag shared by a group of cooperating tasks.
/// Cloneable object that shall be distributed to each task that needs to observe
/// the stop request. Based on tokio::sync::broadcast so a single `stop` reaches
/// all clones, no matter how many receivers are still running.
#[derive(Clone, Debug)]
pub struct RunFlag {
    run: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl RunFlag {
    /// Set flag to `false` and notify all clones.
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// Non-blocking check of the flag value.
    pub fn load(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Wait for stop request. Return immediately if already stopped.
    pub async fn wait(&self) {
        if !self.load() {
            return;
        }
        let mut rx = self.tx.subscribe();
        // `stop` flips the flag before sending, so a request that raced the
        // subscription is visible here.
        if !self.load() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Run `future` to completion unless stopped first.
    /// Returns `None` if the flag was stopped before the future resolved.
    pub async fn select<T>(&self, future: impl Future<Output = T>) -> Option<T> {
        tokio::select!(
            res = future => Some(res),
            _ = self.wait() => None,
        )
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self {
            run: Arc::new(AtomicBool::new(true)),
            tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_observed_by_all_clones() {
        let flag = RunFlag::default();
        let a = flag.clone();
        let b = flag.clone();
        assert!(a.load());
        assert!(b.load());
        flag.stop();
        assert!(!a.load());
        assert!(!b.load());
        // wait on an already stopped flag must not block
        a.wait().await;
        b.wait().await;
    }

    #[tokio::test]
    async fn test_select_cancels_pending_future() {
        let flag = RunFlag::default();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move {
            waiter
                .select(tokio::time::sleep(Duration::from_secs(60)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.stop();
        assert_eq!(None, handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_select_returns_value_when_running() {
        let flag = RunFlag::default();
        assert_eq!(Some(7), flag.select(async { 7 }).await);
    }
}
