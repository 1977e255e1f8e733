//! Process launching seam
//!
//! The supervision core is written against [`ProcessLauncher`] and
//! [`ProcessHandle`] rather than any particular process-creation mechanism.
//! [`unix::UnixLauncher`] starts processes directly; [`mock::MockLauncher`]
//! drives the state machine from tests without real processes.

use crate::error::Result;
use schema::ChildOptions;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

pub mod mock;
#[cfg(unix)]
pub mod unix;

/// How a launched process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with the given code
    Exited(i32),
    /// Terminated by the given signal
    Signaled(i32),
}

/// Everything a launcher needs to start one process
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Path of the program image to execute
    pub program: PathBuf,
    /// Full argument vector, `argv[0]` included
    pub argv: Vec<String>,
    /// Complete environment for the new process
    pub env: Vec<(String, String)>,
    /// Identity, directory and resource-limit options
    pub options: ChildOptions,
    /// Whether the caller wants a pipe wired to the child's stdin
    pub pipe_stdin: bool,
    /// Whether the caller wants a pipe wired to the child's stdout
    pub pipe_stdout: bool,
    /// Whether the caller wants a pipe wired to the child's stderr
    pub pipe_stderr: bool,
}

/// A successfully started process and the server-side pipe ends
pub struct Launched {
    pub handle: Box<dyn ProcessHandle>,
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl std::fmt::Debug for Launched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launched")
            .field("pid", &self.handle.pid())
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .finish()
    }
}

/// Starts processes on behalf of the supervision core
pub trait ProcessLauncher: Send + Sync {
    /// Start the requested process. Errors are surfaced synchronously to the
    /// exec caller; no process exists when this fails.
    fn launch(&self, request: &LaunchRequest) -> Result<Launched>;
}

/// One running (or exited) process as seen by the supervision core.
///
/// Handles own the underlying process record until it is reaped: the
/// operating system may not reuse the process identifier while a handle
/// holds an unreaped process, so signals sent through a handle cannot land
/// on an unrelated process.
pub trait ProcessHandle: Send + Sync {
    /// Operating-system process identifier
    fn pid(&self) -> i32;

    /// Reap the process if it has ended, without blocking
    fn poll_exit(&self) -> Result<Option<ExitStatus>>;

    /// Block until the process ends and reap it
    fn wait_exit(&self) -> Result<ExitStatus>;

    /// Deliver a cooperative termination request to the process group.
    /// A process that is already gone is not an error.
    fn terminate(&self) -> Result<()>;

    /// Forcefully end the process group. A process that is already gone is
    /// not an error.
    fn kill(&self) -> Result<()>;
}
