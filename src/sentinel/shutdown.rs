use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Shutdown signal shared by every background loop
pub struct ShutdownSignal {
    /// Flag to indicate shutdown requested
    shutdown: AtomicBool,
    /// Wakes sleepers when shutdown is requested
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Request shutdown
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check if shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`. Returns `false` if shutdown interrupted the sleep.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_shutdown_requested() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_shutdown_requested(),
            _ = notified => false,
        }
    }

    /// Resolves once shutdown is requested
    pub async fn wait(&self) {
        while !self.is_shutdown_requested() {
            self.sleep(Duration::from_secs(3600)).await;
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sleep_completes_without_shutdown() {
        let signal = ShutdownSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let signal = Arc::new(ShutdownSignal::new());
        let sleeper = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.sleep(Duration::from_secs(60)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.request_shutdown();

        let completed = tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
        assert!(signal.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_sleep_after_shutdown_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.request_shutdown();
        assert!(!signal.sleep(Duration::from_secs(60)).await);
        signal.wait().await;
    }
}
