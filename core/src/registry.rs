//! Registry of children under supervision
//!
//! Children are spread over a fixed set of independently locked buckets so
//! worker threads registering and removing children contend with the
//! babysitter only bucket by bucket, never on one global lock. A child's
//! bucket is derived from its allocation address, which is stable for its
//! whole life.

use crate::child::{Child, State};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Prime, and comfortably above typical worker-thread counts
const BUCKET_COUNT: usize = 17;

/// Fixed-size hashed collection of live children
pub struct Registry {
    buckets: Vec<Mutex<Vec<Arc<Child>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn bucket(&self, child: &Arc<Child>) -> &Mutex<Vec<Arc<Child>>> {
        let index = Arc::as_ptr(child) as usize % BUCKET_COUNT;
        &self.buckets[index]
    }

    /// Register a child; the registry holds its own reference
    pub fn insert(&self, child: Arc<Child>) {
        self.bucket(&child).lock().unwrap().push(child);
    }

    /// Unregister a child, returning whether it was present
    pub fn remove(&self, child: &Arc<Child>) -> bool {
        let mut bucket = self.bucket(child).lock().unwrap();
        let before = bucket.len();
        bucket.retain(|entry| !Arc::ptr_eq(entry, child));
        bucket.len() != before
    }

    /// Run one supervision pass over every registered child, dropping the
    /// registry's reference to children that reached Finished. Returns how
    /// many children were seen, Finished ones included.
    pub fn sweep(&self, now: Instant, grace: Duration) -> usize {
        let mut seen = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().unwrap();
            if bucket.is_empty() {
                continue;
            }
            seen += bucket.len();
            for child in bucket.iter() {
                child.check(now, grace);
            }
            bucket.retain(|child| {
                let finished = child.state() == State::Finished;
                if finished {
                    debug!(program = %child.program(), "unlinking finished child");
                }
                !finished
            });
        }
        seen
    }

    /// Number of currently registered children
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::mock::MockLauncher;
    use crate::launch::ExitStatus;
    use schema::ChildOptions;
    use std::path::Path;

    const GRACE: Duration = Duration::from_secs(30);

    fn running_child(launcher: &MockLauncher) -> Arc<Child> {
        let child = Arc::new(Child::new("true", None));
        child
            .exec(
                launcher,
                Path::new("/bin/true"),
                &[],
                &[],
                &ChildOptions::default(),
                None,
            )
            .expect("exec");
        child
    }

    #[test]
    fn test_insert_remove() {
        let registry = Registry::new();
        let child = Arc::new(Child::new("true", None));

        registry.insert(Arc::clone(&child));
        assert_eq!(registry.len(), 1);
        assert_eq!(Arc::strong_count(&child), 2);

        assert!(registry.remove(&child));
        assert!(registry.is_empty());
        assert_eq!(Arc::strong_count(&child), 1);
        assert!(!registry.remove(&child));
    }

    #[test]
    fn test_sweep_unlinks_finished_children() {
        let launcher = MockLauncher::new();
        let registry = Registry::new();

        let exited = running_child(&launcher);
        let alive = running_child(&launcher);
        registry.insert(Arc::clone(&exited));
        registry.insert(Arc::clone(&alive));

        // the live child's far pipe ends stay open on its launcher record,
        // so sweeps leave it Running
        launcher.spawned()[0].exit(ExitStatus::Exited(0));

        // one sweep observes the EOFs, reaps the exited child and unlinks it
        assert_eq!(registry.sweep(Instant::now(), GRACE), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(exited.state(), State::Finished);
        assert_eq!(alive.state(), State::Running);
        // the registry's reference to the finished child is gone
        assert_eq!(Arc::strong_count(&exited), 1);
    }

    #[test]
    fn test_bucket_locks_are_independent() {
        let registry = Registry::new();
        let index = |child: &Arc<Child>| Arc::as_ptr(child) as usize % BUCKET_COUNT;

        let first = Arc::new(Child::new("a", None));
        let mut second = Arc::new(Child::new("b", None));
        while index(&second) == index(&first) {
            second = Arc::new(Child::new("b", None));
        }
        registry.insert(Arc::clone(&first));
        registry.insert(Arc::clone(&second));

        // a sweep stuck on the first child holds only that child's bucket
        let stalled = registry.buckets[index(&first)].lock().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                tx.send(registry.remove(&second)).unwrap();
            });
            let removed = rx
                .recv_timeout(Duration::from_secs(2))
                .expect("removal blocked on an unrelated bucket");
            assert!(removed);
        });

        drop(stalled);
        assert!(registry.remove(&first));
    }

    #[test]
    fn test_children_spread_over_buckets() {
        let registry = Registry::new();
        let children: Vec<_> = (0..64)
            .map(|_| Arc::new(Child::new("true", None)))
            .collect();
        for child in &children {
            registry.insert(Arc::clone(child));
        }
        assert_eq!(registry.len(), 64);

        let populated = registry
            .buckets
            .iter()
            .filter(|bucket| !bucket.lock().unwrap().is_empty())
            .count();
        assert!(populated > 1, "all children hashed into one bucket");

        for child in &children {
            assert!(registry.remove(child));
        }
        assert!(registry.is_empty());
    }
}
