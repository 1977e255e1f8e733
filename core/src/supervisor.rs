//! Public supervision API
//!
//! A [`Supervisor`] owns the [`Registry`], the babysitter thread, and the
//! [`ProcessLauncher`] it starts children through. Worker threads obtain a
//! [`ChildHandle`] from [`create`], launch through [`exec`] or [`shell`],
//! and relinquish the child through exactly one of [`wait`], [`term`] or
//! [`done`], each of which consumes the handle.
//!
//! Only launch failures and pipe timeouts surface as errors; a child that
//! runs too long or refuses to die is dealt with internally by escalation
//! and is at most a log line to the caller.
//!
//! [`create`]: Supervisor::create
//! [`exec`]: Supervisor::exec
//! [`shell`]: Supervisor::shell
//! [`wait`]: Supervisor::wait
//! [`term`]: Supervisor::term
//! [`done`]: Supervisor::done

use crate::babysitter::Babysitter;
use crate::child::Child;
use crate::error::Result;
use crate::launch::{ExitStatus, ProcessLauncher};
use crate::registry::Registry;
use schema::{ChildOptions, SupervisorConfig};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// An owner's reference to one child. Launch, pipe and state accessors are
/// available through deref; the handle is consumed by whichever of
/// `wait`/`term`/`done` ends the owner's involvement.
pub struct ChildHandle {
    child: Arc<Child>,
}

impl Deref for ChildHandle {
    type Target = Child;

    fn deref(&self) -> &Child {
        &self.child
    }
}

impl std::fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.child.fmt(f)
    }
}

/// Child process supervision for the whole server
pub struct Supervisor {
    launcher: Arc<dyn ProcessLauncher>,
    registry: Arc<Registry>,
    babysitter: Babysitter,
    shell: PathBuf,
}

impl Supervisor {
    /// Start supervision: an empty registry and a running babysitter thread
    pub fn new(launcher: Arc<dyn ProcessLauncher>, config: &SupervisorConfig) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let babysitter = Babysitter::start(
            Arc::clone(&registry),
            Duration::from_secs(config.term_grace_secs),
            Duration::from_millis(config.busy_interval_ms),
            Duration::from_millis(config.idle_interval_ms),
        )?;
        let shell = std::env::var_os("SHELL")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/bin/sh"));
        Ok(Self {
            launcher,
            registry,
            babysitter,
            shell,
        })
    }

    /// Create an Inactive child for `program`. `ctx` is a free-form owner
    /// description (session, request) carried into the child's log lines.
    pub fn create(&self, program: impl Into<String>, ctx: Option<&str>) -> ChildHandle {
        ChildHandle {
            child: Arc::new(Child::new(program, ctx.map(str::to_string))),
        }
    }

    /// Launch the child's program directly. On success the child is Running
    /// and registered; on failure the handle is consumed and the child
    /// freed, and the error belongs to the caller.
    pub fn exec(
        &self,
        handle: ChildHandle,
        argv: &[String],
        env: &[(String, String)],
        options: &ChildOptions,
        timeout: Option<Duration>,
    ) -> Result<ChildHandle> {
        let program = PathBuf::from(handle.child.program());
        self.exec_inner(handle, &program, argv, env, options, timeout)
    }

    /// Launch the child's program through the shell (`$SHELL -c program`,
    /// `/bin/sh` when unset)
    pub fn shell(
        &self,
        handle: ChildHandle,
        env: &[(String, String)],
        options: &ChildOptions,
        timeout: Option<Duration>,
    ) -> Result<ChildHandle> {
        let command = handle.child.program().to_string();
        self.shell_command(handle, command, env, options, timeout)
    }

    /// Launch through the shell with an explicit argument vector; the
    /// command line is assembled with each argument quoted for the shell
    pub fn shell_with_args(
        &self,
        handle: ChildHandle,
        argv: &[String],
        env: &[(String, String)],
        options: &ChildOptions,
        timeout: Option<Duration>,
    ) -> Result<ChildHandle> {
        let command = argv
            .iter()
            .map(|arg| sh_escape(arg))
            .collect::<Vec<_>>()
            .join(" ");
        self.shell_command(handle, command, env, options, timeout)
    }

    fn shell_command(
        &self,
        handle: ChildHandle,
        command: String,
        env: &[(String, String)],
        options: &ChildOptions,
        timeout: Option<Duration>,
    ) -> Result<ChildHandle> {
        let shell = self.shell.clone();
        let argv = vec![
            shell.display().to_string(),
            "-c".to_string(),
            command,
        ];
        self.exec_inner(handle, &shell, &argv, env, options, timeout)
    }

    fn exec_inner(
        &self,
        handle: ChildHandle,
        program: &Path,
        argv: &[String],
        env: &[(String, String)],
        options: &ChildOptions,
        timeout: Option<Duration>,
    ) -> Result<ChildHandle> {
        // a launch failure drops the handle, freeing the child
        handle
            .child
            .exec(self.launcher.as_ref(), program, argv, env, options, timeout)?;
        self.registry.insert(Arc::clone(&handle.child));
        self.babysitter.wake();
        Ok(handle)
    }

    /// Block until the child finishes, then release it. The babysitter is
    /// woken first so an exit is noticed promptly.
    pub fn wait(&self, handle: ChildHandle) -> Option<ExitStatus> {
        self.babysitter.wake();
        handle.child.wait_finished();
        let status = handle.child.exit_status();
        handle.child.abandon();
        status
    }

    /// Begin cooperative termination and release the child; the babysitter
    /// finishes it (escalating if necessary)
    pub fn term(&self, handle: ChildHandle) {
        handle.child.log_pending();
        handle
            .child
            .term(Instant::now(), self.babysitter.grace());
        handle.child.abandon();
        self.babysitter.wake();
    }

    /// Release a child the owner is finished with. An already-exited child
    /// is reaped and freed immediately (true); a live one is left with the
    /// babysitter to terminate (false).
    pub fn done(&self, handle: ChildHandle) -> bool {
        let child = handle.child;
        let registered = self.registry.remove(&child);
        child.drain_output();
        if child.done(Instant::now(), self.babysitter.grace()) {
            debug!(program = %child.program(), "child released and reaped");
            true
        } else {
            if registered {
                self.registry.insert(Arc::clone(&child));
            }
            child.abandon();
            self.babysitter.wake();
            false
        }
    }

    /// How long a child has to exit after cooperative termination before it
    /// is forcefully killed
    pub fn termination_grace_period(&self) -> Duration {
        self.babysitter.grace()
    }

    /// Adjust the grace period for subsequent terminations
    pub fn set_termination_grace_period(&self, grace: Duration) {
        self.babysitter.set_grace(grace);
    }

    /// Number of children currently under supervision
    pub fn supervised_count(&self) -> usize {
        self.registry.len()
    }
}

/// Quote one argument for `sh -c`
fn sh_escape(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':'));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
