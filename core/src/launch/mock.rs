//! Scripted launcher for exercising supervision without real processes

use super::{ExitStatus, LaunchRequest, Launched, ProcessHandle, ProcessLauncher};
use crate::error::{CoreError, Result};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Launcher whose processes exist only as in-memory records. Tests drive
/// exits and observe signals through the [`MockProcess`] records it keeps.
///
/// Requested pipes are backed by real OS pipes so endpoint I/O behaves
/// normally; the far ends are parked on the process record for tests to
/// write to, read from, or close.
pub struct MockLauncher {
    next_pid: AtomicI32,
    fail_next: AtomicBool,
    ignore_term: AtomicBool,
    spawned: Mutex<Vec<Arc<MockProcess>>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicI32::new(1000),
            fail_next: AtomicBool::new(false),
            ignore_term: AtomicBool::new(false),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Make the next launch fail as if the OS refused it
    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Subsequently launched processes survive cooperative termination and
    /// end only on [`ProcessHandle::kill`]
    pub fn set_ignore_term(&self, ignore: bool) {
        self.ignore_term.store(ignore, Ordering::SeqCst);
    }

    /// Records of every process launched so far, in launch order
    pub fn spawned(&self) -> Vec<Arc<MockProcess>> {
        self.spawned.lock().unwrap().clone()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher for MockLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<Launched> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CoreError::Launch(format!(
                "{}: refused by launcher",
                request.program.display()
            )));
        }

        let process = Arc::new(MockProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            program: request.program.display().to_string(),
            argv: request.argv.clone(),
            env: request.env.clone(),
            ignore_term: AtomicBool::new(self.ignore_term.load(Ordering::SeqCst)),
            status: Mutex::new(None),
            exited: Condvar::new(),
            term_signals: AtomicUsize::new(0),
            kill_signals: AtomicUsize::new(0),
            stdin_read: Mutex::new(None),
            stdout_write: Mutex::new(None),
            stderr_write: Mutex::new(None),
        });

        let mut stdin = None;
        let mut stdout = None;
        let mut stderr = None;
        if request.pipe_stdin {
            let (read_end, write_end) = os_pipe()?;
            *process.stdin_read.lock().unwrap() = Some(read_end);
            stdin = Some(write_end);
        }
        if request.pipe_stdout {
            let (read_end, write_end) = os_pipe()?;
            *process.stdout_write.lock().unwrap() = Some(write_end);
            stdout = Some(read_end);
        }
        if request.pipe_stderr {
            let (read_end, write_end) = os_pipe()?;
            *process.stderr_write.lock().unwrap() = Some(write_end);
            stderr = Some(read_end);
        }

        self.spawned.lock().unwrap().push(Arc::clone(&process));

        Ok(Launched {
            handle: Box::new(MockHandle(process)),
            stdin,
            stdout,
            stderr,
        })
    }
}

fn os_pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe()
        .map_err(|e| CoreError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

/// One scripted process
pub struct MockProcess {
    pid: i32,
    program: String,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    ignore_term: AtomicBool,
    status: Mutex<Option<ExitStatus>>,
    exited: Condvar,
    term_signals: AtomicUsize,
    kill_signals: AtomicUsize,
    /// Far end of the child's stdin pipe, for tests to read what the server
    /// wrote
    pub stdin_read: Mutex<Option<OwnedFd>>,
    /// Far end of the child's stdout pipe, for tests to feed output through
    pub stdout_write: Mutex<Option<OwnedFd>>,
    /// Far end of the child's stderr pipe
    pub stderr_write: Mutex<Option<OwnedFd>>,
}

impl MockProcess {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Script the process's end. Far pipe ends close with it, as they would
    /// when a real process exits.
    pub fn exit(&self, status: ExitStatus) {
        let mut current = self.status.lock().unwrap();
        if current.is_none() {
            *current = Some(status);
            self.stdin_read.lock().unwrap().take();
            self.stdout_write.lock().unwrap().take();
            self.stderr_write.lock().unwrap().take();
            self.exited.notify_all();
        }
    }

    pub fn has_exited(&self) -> bool {
        self.status.lock().unwrap().is_some()
    }

    /// Cooperative termination requests observed so far
    pub fn term_signals(&self) -> usize {
        self.term_signals.load(Ordering::SeqCst)
    }

    /// Forceful termination requests observed so far
    pub fn kill_signals(&self) -> usize {
        self.kill_signals.load(Ordering::SeqCst)
    }
}

struct MockHandle(Arc<MockProcess>);

impl ProcessHandle for MockHandle {
    fn pid(&self) -> i32 {
        self.0.pid
    }

    fn poll_exit(&self) -> Result<Option<ExitStatus>> {
        Ok(*self.0.status.lock().unwrap())
    }

    fn wait_exit(&self) -> Result<ExitStatus> {
        let mut status = self.0.status.lock().unwrap();
        while status.is_none() {
            status = self.0.exited.wait(status).unwrap();
        }
        Ok(status.unwrap())
    }

    fn terminate(&self) -> Result<()> {
        self.0.term_signals.fetch_add(1, Ordering::SeqCst);
        if !self.0.ignore_term.load(Ordering::SeqCst) {
            self.0.exit(ExitStatus::Signaled(libc::SIGTERM));
        }
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        self.0.kill_signals.fetch_add(1, Ordering::SeqCst);
        self.0.exit(ExitStatus::Signaled(libc::SIGKILL));
        Ok(())
    }
}
