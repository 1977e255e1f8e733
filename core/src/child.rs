//! One supervised child process
//!
//! A [`Child`] moves through `Inactive → Running → Terminating → Finished`,
//! never backwards; `Running → Finished` is taken directly when the process
//! is first observed already exited. The owning worker thread drives it
//! through the [`Supervisor`](crate::supervisor::Supervisor) API while the
//! babysitter thread calls [`Child::check`] once per sweep; the two sides
//! meet on the per-child state lock.

use crate::error::Result;
use crate::launch::{ExitStatus, LaunchRequest, ProcessHandle, ProcessLauncher};
use crate::pipe::{PipeReader, PipeWriter};
use crate::timer::Timer;
use schema::ChildOptions;
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Most output a single child can log per babysitter sweep, per stream
const LOG_BUF_SIZE: usize = 1024;

/// Lifecycle states, in order. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Created, not yet launched
    Inactive,
    /// Process launched and not known to need termination
    Running,
    /// Cooperative termination requested, grace timer running
    Terminating,
    /// Process ended and reaped; waiters released
    Finished,
}

struct ChildInner {
    state: State,
    handle: Option<Box<dyn ProcessHandle>>,
    exit: Option<ExitStatus>,
    /// Started at launch; expiry means the process ran too long
    running: Option<Timer>,
    /// Started at cooperative termination; expiry escalates to forceful
    terminating: Option<Timer>,
    /// Whether the caller asked for a stdin pipe before launch
    pipe_stdin: bool,
    /// Stream output is logged by the babysitter unless the caller took the
    /// pipe for itself
    log_stdout: bool,
    log_stderr: bool,
}

/// A child process under supervision
pub struct Child {
    program: String,
    /// Free-form owner description carried into log lines, cleared when the
    /// owner abandons the child
    ctx: Mutex<Option<String>>,
    stdin: PipeWriter,
    stdout: PipeReader,
    stderr: PipeReader,
    inner: Mutex<ChildInner>,
    finished: Condvar,
}

impl Child {
    pub(crate) fn new(program: impl Into<String>, ctx: Option<String>) -> Self {
        Self {
            program: program.into(),
            ctx: Mutex::new(ctx),
            stdin: PipeWriter::new(),
            stdout: PipeReader::new(),
            stderr: PipeReader::new(),
            inner: Mutex::new(ChildInner {
                state: State::Inactive,
                handle: None,
                exit: None,
                running: None,
                terminating: None,
                pipe_stdin: false,
                log_stdout: true,
                log_stderr: true,
            }),
            finished: Condvar::new(),
        }
    }

    /// Program name the child was created for
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Exit status, once the child is Finished and the process was reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.lock().unwrap().exit
    }

    /// Process identifier while a process exists
    pub fn pid(&self) -> Option<i32> {
        self.inner
            .lock()
            .unwrap()
            .handle
            .as_ref()
            .map(|h| h.pid())
    }

    /// The writable endpoint wired to the child's stdin.
    ///
    /// Called before launch, this requests the pipe and sets its I/O
    /// timeout; after launch it hands back the endpoint for writing.
    pub fn stdin_pipe(&self, timeout: Option<Duration>) -> &PipeWriter {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Inactive {
                inner.pipe_stdin = true;
            }
        }
        self.stdin.set_timeout(timeout);
        &self.stdin
    }

    /// The readable endpoint wired to the child's stdout. Taking it claims
    /// the stream for the caller; the babysitter stops logging it.
    pub fn stdout_pipe(&self, timeout: Option<Duration>) -> &PipeReader {
        self.inner.lock().unwrap().log_stdout = false;
        self.stdout.set_timeout(timeout);
        &self.stdout
    }

    /// The readable endpoint wired to the child's stderr. Taking it claims
    /// the stream for the caller; the babysitter stops logging it.
    pub fn stderr_pipe(&self, timeout: Option<Duration>) -> &PipeReader {
        self.inner.lock().unwrap().log_stderr = false;
        self.stderr.set_timeout(timeout);
        &self.stderr
    }

    /// Launch the process. On failure the child stays Inactive and the error
    /// is the caller's; no process exists.
    pub(crate) fn exec(
        &self,
        launcher: &dyn ProcessLauncher,
        program: &Path,
        argv: &[String],
        env: &[(String, String)],
        options: &ChildOptions,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state, State::Inactive);

        let argv = if argv.is_empty() {
            vec![program.display().to_string()]
        } else {
            argv.to_vec()
        };
        let request = LaunchRequest {
            program: program.to_path_buf(),
            argv,
            env: env.to_vec(),
            options: options.clone(),
            pipe_stdin: inner.pipe_stdin,
            // stdout/stderr always come back so unclaimed output can be
            // logged and end of stream observed
            pipe_stdout: true,
            pipe_stderr: true,
        };

        let launched = launcher.launch(&request)?;
        if let Some(fd) = launched.stdin {
            self.stdin.attach(fd);
        }
        if let Some(fd) = launched.stdout {
            self.stdout.attach(fd);
        }
        if let Some(fd) = launched.stderr {
            self.stderr.attach(fd);
        }
        info!(
            program = %self.program,
            pid = launched.handle.pid(),
            "child process started"
        );
        inner.handle = Some(launched.handle);
        inner.running = Some(Timer::start(timeout));
        inner.state = State::Running;
        Ok(())
    }

    /// Request cooperative termination. Idempotent; does nothing unless the
    /// child is Running.
    pub(crate) fn term(&self, now: Instant, grace: Duration) {
        let mut inner = self.inner.lock().unwrap();
        self.term_locked(&mut inner, now, grace);
    }

    fn term_locked(&self, inner: &mut ChildInner, now: Instant, grace: Duration) {
        if inner.state != State::Running {
            return;
        }
        debug!(program = %self.program, "terminating child process");
        self.stdin.detach();
        self.stdout.detach();
        self.stderr.detach();
        if let Some(handle) = &inner.handle {
            if let Err(e) = handle.terminate() {
                warn!(program = %self.program, error = %e, "termination signal failed");
            }
        }
        inner.terminating = Some(Timer::start_at(now, Some(grace)));
        inner.state = State::Terminating;
    }

    /// Finish now if the process already ended; otherwise begin cooperative
    /// termination. True means the child is Finished on return.
    pub(crate) fn done(&self, now: Instant, grace: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Inactive => {
                self.finish_locked(&mut inner);
                true
            }
            State::Finished => true,
            _ => {
                let exited = match inner.handle.as_ref() {
                    Some(handle) => handle.poll_exit().unwrap_or(None).is_some(),
                    None => true,
                };
                if exited {
                    self.finish_locked(&mut inner);
                    true
                } else {
                    self.term_locked(&mut inner, now, grace);
                    false
                }
            }
        }
    }

    /// One babysitter sweep over this child. Ordering is fixed: pending
    /// output is logged first, end of stream is acted on next, a Terminating
    /// child is finished or escalated, and only then are timeouts tested.
    /// An EOF-driven term falls through to the Terminating handling, so a
    /// child observed both at EOF and exited finishes within one call.
    pub(crate) fn check(&self, now: Instant, grace: Duration) {
        self.log_pending();

        let mut inner = self.inner.lock().unwrap();

        if inner.state == State::Running && self.stdout.at_eof() && self.stderr.at_eof() {
            debug!(program = %self.program, "child closed its output");
            self.term_locked(&mut inner, now, grace);
        }

        if inner.state == State::Terminating {
            let exited = match inner.handle.as_ref() {
                Some(handle) => handle.poll_exit().unwrap_or(None).is_some(),
                None => true,
            };
            if exited {
                self.finish_locked(&mut inner);
            } else if inner.terminating.is_some_and(|t| t.expired(now)) {
                warn!(program = %self.program, "child ignored termination request, killing");
                if let Some(handle) = &inner.handle {
                    if let Err(e) = handle.kill() {
                        warn!(program = %self.program, error = %e, "kill failed");
                    }
                    inner.exit = handle.wait_exit().ok();
                }
                self.finish_locked(&mut inner);
            }
        }

        if inner.state == State::Running {
            let run_expired = inner.running.is_some_and(|t| t.expired(now));
            let io_expired = self.stdin.expired(now)
                || self.stdout.expired(now)
                || self.stderr.expired(now);
            if run_expired || io_expired {
                warn!(
                    program = %self.program,
                    reason = if run_expired { "ran too long" } else { "pipe I/O stalled" },
                    "terminating child process"
                );
                self.term_locked(&mut inner, now, grace);
            }
        }
    }

    fn finish_locked(&self, inner: &mut ChildInner) {
        self.stdin.detach();
        self.stdout.detach();
        self.stderr.detach();
        if inner.exit.is_none() {
            if let Some(handle) = &inner.handle {
                inner.exit = handle.poll_exit().unwrap_or(None);
            }
        }
        debug!(program = %self.program, exit = ?inner.exit, "child process finished");
        inner.state = State::Finished;
        self.finished.notify_all();
    }

    /// Block until the child reaches Finished. A child that was never
    /// launched has nothing to wait for.
    pub(crate) fn wait_finished(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !matches!(inner.state, State::Finished | State::Inactive) {
            inner = self.finished.wait(inner).unwrap();
        }
    }

    /// Drop the owner's context; subsequent log lines carry only the program
    pub(crate) fn abandon(&self) {
        self.ctx.lock().unwrap().take();
    }

    /// Log at most one buffer of pending output per unclaimed stream
    pub(crate) fn log_pending(&self) {
        let (log_stdout, log_stderr) = {
            let inner = self.inner.lock().unwrap();
            (inner.log_stdout, inner.log_stderr)
        };
        if log_stdout {
            self.log_stream(&self.stdout, false);
        }
        if log_stderr {
            self.log_stream(&self.stderr, true);
        }
    }

    /// Log everything still pending on unclaimed streams
    pub(crate) fn drain_output(&self) {
        let (log_stdout, log_stderr) = {
            let inner = self.inner.lock().unwrap();
            (inner.log_stdout, inner.log_stderr)
        };
        if log_stdout {
            while !self.stdout.at_eof() && self.stdout.ready() {
                if !self.log_stream(&self.stdout, false) {
                    break;
                }
            }
        }
        if log_stderr {
            while !self.stderr.at_eof() && self.stderr.ready() {
                if !self.log_stream(&self.stderr, true) {
                    break;
                }
            }
        }
    }

    /// One non-blocking read of a stream, logged line by line. Returns
    /// whether any data was consumed.
    fn log_stream(&self, reader: &PipeReader, is_stderr: bool) -> bool {
        if reader.at_eof() || !reader.ready() {
            return false;
        }
        let mut buf = [0u8; LOG_BUF_SIZE];
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(_) => return false,
        };
        if n == 0 {
            return false;
        }
        let text = String::from_utf8_lossy(&buf[..n]);
        let ctx = self.ctx.lock().unwrap().clone();
        let ctx = ctx.as_deref().unwrap_or("-");
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if is_stderr {
                warn!(program = %self.program, ctx, "{line}");
            } else {
                info!(program = %self.program, ctx, "{line}");
            }
        }
        true
    }
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Child")
            .field("program", &self.program)
            .field("state", &self.state())
            .finish()
    }
}
