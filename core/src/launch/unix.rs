//! Direct Unix process launcher

#![allow(unsafe_code)]

use super::{ExitStatus, LaunchRequest, Launched, ProcessHandle, ProcessLauncher};
use crate::error::{CoreError, Result};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::debug;

/// Launcher that forks and execs directly in the server process.
///
/// Every child is made the leader of a new session so that cooperative and
/// forceful termination reach the child's own descendants as well.
#[derive(Debug, Default)]
pub struct UnixLauncher;

impl UnixLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for UnixLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<Launched> {
        let mut command = Command::new(&request.program);
        if let Some(arg0) = request.argv.first() {
            command.arg0(arg0);
        }
        command.args(&request.argv[1.min(request.argv.len())..]);
        command.env_clear();
        command.envs(request.env.iter().map(|(k, v)| (k, v)));

        command.stdin(stdio_for(request.pipe_stdin));
        command.stdout(stdio_for(request.pipe_stdout));
        command.stderr(stdio_for(request.pipe_stderr));

        // Directory changes without a chroot can happen before the fork's
        // privileged setup; with a chroot they must happen inside it.
        let options = request.options.clone();
        if options.root.is_none() {
            if let Some(dir) = &options.dir {
                command.current_dir(dir);
            }
        }

        unsafe {
            command.pre_exec(move || child_setup(&options));
        }

        let mut child = command
            .spawn()
            .map_err(|e| CoreError::Launch(format!("{}: {e}", request.program.display())))?;

        debug!(pid = child.id(), program = %request.program.display(), "launched child process");

        let stdin = child.stdin.take().map(Into::into);
        let stdout = child.stdout.take().map(Into::into);
        let stderr = child.stderr.take().map(Into::into);

        Ok(Launched {
            handle: Box::new(UnixHandle::new(child)),
            stdin,
            stdout,
            stderr,
        })
    }
}

fn stdio_for(piped: bool) -> Stdio {
    if piped {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Runs in the forked child before exec. Ordering matters: the session and
/// limits are set first, the root change happens while still privileged, and
/// identity is dropped last.
fn child_setup(options: &schema::ChildOptions) -> std::io::Result<()> {
    nix::unistd::setsid().map_err(io_err)?;

    let limits = &options.rlimits;
    if let Some(bytes) = limits.address_space {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(io_err)?;
    }
    if let Some(bytes) = limits.core_size {
        setrlimit(Resource::RLIMIT_CORE, bytes, bytes).map_err(io_err)?;
    }
    if let Some(secs) = limits.cpu_seconds {
        setrlimit(Resource::RLIMIT_CPU, secs, secs).map_err(io_err)?;
    }
    if let Some(count) = limits.open_files {
        setrlimit(Resource::RLIMIT_NOFILE, count, count).map_err(io_err)?;
    }

    if let Some(increment) = options.nice_increment {
        // nice(2) can legitimately return -1; only errno distinguishes failure
        nix::errno::Errno::clear();
        if unsafe { libc::nice(increment) } == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(0) {
                return Err(err);
            }
        }
    }

    if let Some(root) = &options.root {
        nix::unistd::chroot(root.as_str()).map_err(io_err)?;
        let dir = options.dir.as_deref().unwrap_or("/");
        nix::unistd::chdir(dir).map_err(io_err)?;
    }

    if let Some(gid) = options.group {
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).map_err(io_err)?;
    }
    if let Some(uid) = options.user {
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid)).map_err(io_err)?;
    }

    Ok(())
}

fn io_err(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Handle over a directly spawned process.
///
/// The [`std::process::Child`] is held until reaped so the kernel keeps the
/// pid reserved; the cached status makes reaping idempotent.
struct UnixHandle {
    pid: i32,
    inner: Mutex<HandleInner>,
}

struct HandleInner {
    child: std::process::Child,
    status: Option<ExitStatus>,
}

impl UnixHandle {
    fn new(child: std::process::Child) -> Self {
        Self {
            pid: child.id() as i32,
            inner: Mutex::new(HandleInner {
                child,
                status: None,
            }),
        }
    }

    fn signal_group(&self, signal: Signal) -> Result<()> {
        match killpg(Pid::from_raw(self.pid), signal) {
            Ok(()) => Ok(()),
            // Already gone, or already so far into exit that the kernel
            // refuses: both mean there is nothing left to signal.
            Err(nix::errno::Errno::ESRCH) | Err(nix::errno::Errno::EPERM) => {
                debug!(pid = self.pid, %signal, "signal target already gone");
                Ok(())
            }
            Err(e) => Err(CoreError::Io(io_err(e))),
        }
    }
}

fn convert_status(status: std::process::ExitStatus) -> ExitStatus {
    match status.code() {
        Some(code) => ExitStatus::Exited(code),
        None => ExitStatus::Signaled(status.signal().unwrap_or(0)),
    }
}

impl ProcessHandle for UnixHandle {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn poll_exit(&self) -> Result<Option<ExitStatus>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = inner.status {
            return Ok(Some(status));
        }
        match inner.child.try_wait()? {
            Some(status) => {
                let status = convert_status(status);
                inner.status = Some(status);
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    fn wait_exit(&self) -> Result<ExitStatus> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = inner.status {
            return Ok(status);
        }
        let status = convert_status(inner.child.wait()?);
        inner.status = Some(status);
        Ok(status)
    }

    fn terminate(&self) -> Result<()> {
        self.signal_group(Signal::SIGTERM)
    }

    fn kill(&self) -> Result<()> {
        self.signal_group(Signal::SIGKILL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::ChildOptions;

    fn request(program: &str, argv: &[&str]) -> LaunchRequest {
        LaunchRequest {
            program: program.into(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
            options: ChildOptions::default(),
            pipe_stdin: false,
            pipe_stdout: true,
            pipe_stderr: false,
        }
    }

    #[test]
    fn test_launch_and_reap() {
        let launcher = UnixLauncher::new();
        let launched = launcher
            .launch(&request("/bin/echo", &["echo", "hi"]))
            .expect("launch");
        assert!(launched.handle.pid() > 0);
        assert!(launched.stdout.is_some());
        assert!(launched.stdin.is_none());

        let status = launched.handle.wait_exit().expect("wait");
        assert_eq!(status, ExitStatus::Exited(0));
        // reaping is idempotent
        assert_eq!(launched.handle.poll_exit().unwrap(), Some(status));
    }

    #[test]
    fn test_launch_missing_program_fails() {
        let launcher = UnixLauncher::new();
        let err = launcher
            .launch(&request("/no/such/program", &["x"]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Launch(_)));
    }

    #[test]
    fn test_kill_process_group() {
        let launcher = UnixLauncher::new();
        let launched = launcher
            .launch(&request("/bin/sleep", &["sleep", "60"]))
            .expect("launch");

        assert_eq!(launched.handle.poll_exit().unwrap(), None);
        launched.handle.kill().expect("kill");
        let status = launched.handle.wait_exit().expect("wait");
        assert_eq!(status, ExitStatus::Signaled(libc::SIGKILL));

        // signalling after the process is gone is tolerated
        launched.handle.terminate().expect("terminate after exit");
    }
}
