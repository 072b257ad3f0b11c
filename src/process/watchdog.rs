//! Timer that kills a process which outlives its timeout

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Kill timer for one process run.
///
/// `stopped` is set exactly once, either when the timer fires, when the
/// process halts or when a caller destroys it, independently of whether the
/// process is still alive. Whether the expiry actually killed the process is
/// decided by the kill callback, not recorded here.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Option<Duration>,
    stopped: AtomicBool,
    cancel: Notify,
}

impl Watchdog {
    /// `None` means no timeout: the watchdog never fires
    pub fn new(timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            stopped: AtomicBool::new(false),
            cancel: Notify::new(),
        })
    }

    /// Start the timer. `kill` runs on expiry unless the watchdog was stopped first.
    pub fn arm<F>(self: &Arc<Self>, kill: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = self.timeout?;
        if self.is_stopped() {
            return None;
        }
        let watchdog = Arc::clone(self);
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = watchdog.cancel.notified() => {}
                _ = tokio::time::sleep(timeout) => {
                    if watchdog.stopped.swap(true, Ordering::AcqRel) {
                        return;
                    }
                    tracing::warn!("Watchdog timeout of {:?} elapsed, killing process", timeout);
                    kill();
                }
            }
        }))
    }

    /// Cancel the timer; idempotent
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.cancel.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_fires_after_timeout() {
        let watchdog = Watchdog::new(Some(Duration::from_millis(20)));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let handle = watchdog
            .arm(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        handle.await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(watchdog.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_before_expiry() {
        let watchdog = Watchdog::new(Some(Duration::from_secs(30)));
        let handle = watchdog.arm(|| panic!("must not fire")).unwrap();
        watchdog.stop();
        watchdog.stop();
        handle.await.unwrap();

        assert!(watchdog.is_stopped());
    }

    #[tokio::test]
    async fn test_no_timeout_never_arms() {
        let watchdog = Watchdog::new(None);
        assert!(watchdog.arm(|| {}).is_none());
        assert!(!watchdog.is_stopped());
    }

    #[tokio::test]
    async fn test_arm_after_stop_is_noop() {
        let watchdog = Watchdog::new(Some(Duration::from_millis(10)));
        watchdog.stop();
        assert!(watchdog.arm(|| {}).is_none());
    }
}
