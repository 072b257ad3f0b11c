//! Explicit registry of processes to destroy when the host shuts down

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type KillFn = Arc<dyn Fn() -> bool + Send + Sync>;

struct Entry {
    name: String,
    kill: KillFn,
}

/// Tracks live processes started with destroy-on-shutdown.
///
/// Cloning shares the same registry. The owner decides when shutdown
/// happens and calls [`ProcessRegistry::destroy_all`].
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<BTreeMap<u64, Entry>>>,
    next_id: Arc<AtomicU64>,
}

/// Handle used to deregister a process once it halted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationId(u64);

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        name: impl Into<String>,
        kill: impl Fn() -> bool + Send + Sync + 'static,
    ) -> RegistrationId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            id,
            Entry {
                name: name.into(),
                kill: Arc::new(kill),
            },
        );
        RegistrationId(id)
    }

    pub(crate) fn deregister(&self, id: RegistrationId) {
        self.lock().remove(&id.0);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Force-kill every registered process; returns how many kills were issued
    pub fn destroy_all(&self) -> usize {
        let entries: Vec<Entry> = std::mem::take(&mut *self.lock()).into_values().collect();
        if entries.is_empty() {
            return 0;
        }
        tracing::info!(
            "Shutdown: going to kill {} destroy-on-shutdown process(es)",
            entries.len()
        );
        entries
            .into_iter()
            .filter(|entry| {
                let killed = (entry.kill)();
                if killed {
                    tracing::info!("Shutdown: killed {}", entry.name);
                }
                killed
            })
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_destroy_all_kills_registered() {
        let registry = ProcessRegistry::new();
        let kills = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let kills = Arc::clone(&kills);
            registry.register("proc", move || {
                kills.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        let gone = registry.register("gone", || panic!("deregistered"));
        registry.deregister(gone);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.clone().destroy_all(), 3);
        assert_eq!(kills.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.destroy_all(), 0);
    }
}
