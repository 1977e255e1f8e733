//! The babysitter thread
//!
//! One background thread sweeps the [`Registry`] on an adaptive cadence: a
//! short interval while any child is being tracked, a long one while the
//! registry is empty. Threads blocked in `wait` nudge it with [`wake`] so an
//! exit is noticed without waiting out the idle interval.
//!
//! [`wake`]: Babysitter::wake

use crate::error::{CoreError, Result};
use crate::registry::Registry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct Shared {
    registry: Arc<Registry>,
    /// Grace period for cooperative termination, milliseconds
    grace_ms: AtomicU64,
    shutdown: AtomicBool,
    /// True while a wake request is pending
    nudged: Mutex<bool>,
    bell: Condvar,
    busy_interval: Duration,
    idle_interval: Duration,
}

/// Owns the sweep thread; dropping it shuts the thread down and joins it
pub struct Babysitter {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Babysitter {
    pub fn start(
        registry: Arc<Registry>,
        grace: Duration,
        busy_interval: Duration,
        idle_interval: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            registry,
            grace_ms: AtomicU64::new(grace.as_millis() as u64),
            shutdown: AtomicBool::new(false),
            nudged: Mutex::new(false),
            bell: Condvar::new(),
            busy_interval,
            idle_interval,
        });

        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("babysitter".to_string())
            .spawn(move || run(worker))
            .map_err(|e| {
                CoreError::InitializationError(format!("failed to spawn babysitter thread: {e}"))
            })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Have the next sweep happen promptly
    pub fn wake(&self) {
        let mut nudged = self.shared.nudged.lock().unwrap();
        *nudged = true;
        self.shared.bell.notify_one();
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.shared.grace_ms.load(Ordering::Relaxed))
    }

    pub fn set_grace(&self, grace: Duration) {
        self.shared
            .grace_ms
            .store(grace.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Drop for Babysitter {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!("babysitter stopped");
    }
}

fn run(shared: Arc<Shared>) {
    debug!("babysitter started");
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let grace = Duration::from_millis(shared.grace_ms.load(Ordering::Relaxed));
        let seen = shared.registry.sweep(Instant::now(), grace);
        trace!(seen, "sweep complete");

        let interval = if seen > 0 {
            shared.busy_interval
        } else {
            shared.idle_interval
        };

        let mut nudged = shared.nudged.lock().unwrap();
        if !*nudged && !shared.shutdown.load(Ordering::SeqCst) {
            let (guard, _) = shared.bell.wait_timeout(nudged, interval).unwrap();
            nudged = guard;
        }
        *nudged = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::{Child, State};
    use crate::launch::mock::MockLauncher;
    use crate::launch::ExitStatus;
    use schema::ChildOptions;
    use std::path::Path;

    fn start_registry_and_sitter() -> (Arc<Registry>, Babysitter) {
        let registry = Arc::new(Registry::new());
        let sitter = Babysitter::start(
            Arc::clone(&registry),
            Duration::from_secs(30),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .expect("start babysitter");
        (registry, sitter)
    }

    fn wait_for(child: &Child, state: State) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while child.state() != state {
            assert!(Instant::now() < deadline, "child never reached {state:?}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_sweeps_reap_an_exited_child() {
        let launcher = MockLauncher::new();
        let (registry, sitter) = start_registry_and_sitter();

        let child = Arc::new(Child::new("true", None));
        child
            .exec(
                &launcher,
                Path::new("/bin/true"),
                &[],
                &[],
                &ChildOptions::default(),
                None,
            )
            .expect("exec");
        registry.insert(Arc::clone(&child));

        launcher.spawned()[0].exit(ExitStatus::Exited(0));
        sitter.wake();

        wait_for(&child, State::Finished);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !registry.is_empty() {
            assert!(Instant::now() < deadline, "registry never drained");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(Arc::strong_count(&child), 1);
    }

    #[test]
    fn test_grace_escalation_end_to_end() {
        let launcher = MockLauncher::new();
        launcher.set_ignore_term(true);
        let registry = Arc::new(Registry::new());
        let sitter = Babysitter::start(
            Arc::clone(&registry),
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .expect("start babysitter");

        let child = Arc::new(Child::new("stubborn", None));
        child
            .exec(
                &launcher,
                Path::new("/bin/true"),
                &[],
                &[],
                &ChildOptions::default(),
                None,
            )
            .expect("exec");
        registry.insert(Arc::clone(&child));

        child.term(Instant::now(), sitter.grace());
        wait_for(&child, State::Finished);

        let process = &launcher.spawned()[0];
        assert_eq!(process.kill_signals(), 1);
        assert_eq!(
            child.exit_status(),
            Some(ExitStatus::Signaled(libc::SIGKILL))
        );
    }

    #[test]
    fn test_drop_stops_the_thread() {
        let (_registry, sitter) = start_registry_and_sitter();
        drop(sitter); // must not hang waiting out the idle interval
    }

    #[test]
    fn test_grace_is_adjustable() {
        let (_registry, sitter) = start_registry_and_sitter();
        assert_eq!(sitter.grace(), Duration::from_secs(30));
        sitter.set_grace(Duration::from_secs(5));
        assert_eq!(sitter.grace(), Duration::from_secs(5));
    }
}
