//! procsitter-core: child process supervision for a multi-threaded server
//!
//! Worker threads create, launch and talk to child processes through a
//! [`Supervisor`]; a single babysitter thread watches every launched child,
//! logs its unclaimed output, reaps it when it exits, and escalates from
//! cooperative to forceful termination when it misbehaves. Pipe I/O to a
//! child goes through endpoints that can be detached out from under a
//! blocked caller, so no worker thread is ever stuck on a dead child.

pub mod babysitter;
pub mod child;
pub mod config;
pub mod error;
pub mod launch;
pub mod pipe;
pub mod registry;
pub mod supervisor;
mod timer;

pub use child::State;
pub use error::{CoreError, Result};
pub use launch::{ExitStatus, ProcessHandle, ProcessLauncher};
pub use supervisor::{ChildHandle, Supervisor};

/// Utility functions for procsitter-core
pub mod utils {
    use tracing_subscriber::EnvFilter;

    /// Initialize tracing subscriber with env filter
    ///
    /// Uses `RUST_LOG` when set, otherwise falls back to the given default
    /// level.
    pub fn init_tracing(default_level: &str) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}
