//! Single-assignment outcome of a managed process

use tokio::sync::watch;

/// How a process reached its terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own with an exit code accepted as success
    Completed { exit_code: i32 },
    /// Exited on its own with a failing exit code, or could not be waited on
    Failed { exit_code: i32, cause: String },
    /// Killed because the watchdog timeout elapsed
    DestroyedByWatchdog { exit_code: i32 },
    /// Killed by an explicit destroy request
    DestroyedByCaller { exit_code: i32 },
}

impl ExitOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitOutcome::Completed { exit_code }
            | ExitOutcome::Failed { exit_code, .. }
            | ExitOutcome::DestroyedByWatchdog { exit_code }
            | ExitOutcome::DestroyedByCaller { exit_code } => *exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Completed { .. })
    }
}

/// Receives the terminal notification of a process.
///
/// Exactly one of the two methods is called, at most once, from the task
/// that observed termination.
pub trait ProcessListener: Send + Sync {
    fn on_complete(&self, exit_code: i32);

    fn on_failed(&self, exit_code: i32, cause: &str);
}

/// Create a connected publisher / watcher pair
pub fn completion_signal() -> (CompletionPublisher, CompletionWatch) {
    let (tx, rx) = watch::channel(None);
    (CompletionPublisher { tx }, CompletionWatch { rx })
}

/// Write side; only the first publish takes effect
pub struct CompletionPublisher {
    tx: watch::Sender<Option<ExitOutcome>>,
}

impl CompletionPublisher {
    /// Record the outcome unless one was recorded already.
    /// Returns whether this call was the one that recorded it.
    pub fn publish(&self, outcome: ExitOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }
}

/// Read side, shared by every waiting operation
#[derive(Clone)]
pub struct CompletionWatch {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

/// The publisher went away without recording an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherGone;

impl CompletionWatch {
    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.rx.borrow().clone()
    }

    pub async fn wait(&self) -> Result<ExitOutcome, PublisherGone> {
        let mut rx = self.rx.clone();
        let outcome = rx.wait_for(Option::is_some).await.map_err(|_| PublisherGone)?;
        outcome.clone().ok_or(PublisherGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_writer_wins() {
        let (publisher, watch) = completion_signal();
        assert!(watch.outcome().is_none());

        assert!(publisher.publish(ExitOutcome::DestroyedByWatchdog { exit_code: 137 }));
        assert!(!publisher.publish(ExitOutcome::Completed { exit_code: 0 }));

        assert_eq!(
            watch.outcome(),
            Some(ExitOutcome::DestroyedByWatchdog { exit_code: 137 })
        );
    }

    #[tokio::test]
    async fn test_concurrent_publishers_record_once() {
        let (publisher, watch) = completion_signal();
        let publisher = Arc::new(publisher);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let publisher = Arc::clone(&publisher);
                tokio::spawn(async move { publisher.publish(ExitOutcome::Completed { exit_code: i }) })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(watch.outcome().is_some());
    }

    #[tokio::test]
    async fn test_wait_sees_published_value() {
        let (publisher, watch) = completion_signal();
        let waiter = {
            let watch = watch.clone();
            tokio::spawn(async move { watch.wait().await })
        };
        publisher.publish(ExitOutcome::Failed {
            exit_code: 2,
            cause: "exit code 2".to_string(),
        });
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome.exit_code(), 2);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_wait_after_publisher_dropped() {
        let (publisher, watch) = completion_signal();
        publisher.publish(ExitOutcome::Completed { exit_code: 0 });
        drop(publisher);
        assert_eq!(watch.wait().await, Ok(ExitOutcome::Completed { exit_code: 0 }));

        let (publisher, watch) = completion_signal();
        drop(publisher);
        assert_eq!(watch.wait().await, Err(PublisherGone));
    }
}
