//! Pipe endpoints wired to a child process's stdio
//!
//! Each endpoint wraps one native pipe descriptor. The owning worker thread
//! does blocking reads/writes through it while the babysitter thread may
//! concurrently `detach()` the descriptor to fail that I/O fast. Closing a
//! descriptor is not guaranteed to unblock a blocking call already in flight
//! on every platform, so reads and writes poll in short slices and revalidate
//! the descriptor between waits; a detach is observed within one slice.
//!
//! `detach()` swaps the descriptor atomically: of any number of concurrent
//! callers, exactly one closes the handle. I/O against a detached endpoint
//! returns [`CoreError::PipeTimeout`].

#![allow(unsafe_code)]

use crate::error::{CoreError, Result};
use crate::timer::Timer;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const INVALID_FD: RawFd = -1;

/// How long read/write block before revalidating the descriptor
const POLL_SLICE_MS: u16 = 100;

/// State common to reader and writer endpoints
#[derive(Debug)]
struct Endpoint {
    /// The native descriptor, or -1 once detached
    fd: AtomicI32,
    /// I/O timeout enforced by the babysitter's expiry check
    timeout: Mutex<Option<Duration>>,
    /// Running while a read/write is blocked in this endpoint
    blocking: Mutex<Option<Timer>>,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            fd: AtomicI32::new(INVALID_FD),
            timeout: Mutex::new(None),
            blocking: Mutex::new(None),
        }
    }

    fn attach(&self, fd: OwnedFd) {
        let prev = self.fd.swap(fd.into_raw_fd(), Ordering::AcqRel);
        debug_assert_eq!(prev, INVALID_FD);
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock().unwrap() = timeout;
    }

    /// Atomically invalidate the descriptor. The first of any concurrent
    /// callers closes the handle; later calls are no-ops.
    fn detach(&self) {
        let fd = self.fd.swap(INVALID_FD, Ordering::AcqRel);
        if fd != INVALID_FD {
            // Close errors are ignored; the descriptor is gone either way.
            unsafe { libc::close(fd) };
        }
    }

    fn raw(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    fn is_detached(&self) -> bool {
        self.raw() == INVALID_FD
    }

    fn block(&self) {
        let timeout = *self.timeout.lock().unwrap();
        *self.blocking.lock().unwrap() = Some(Timer::start(timeout));
    }

    fn unblock(&self) {
        *self.blocking.lock().unwrap() = None;
    }

    /// True only while a read/write has been blocked longer than the
    /// configured timeout
    fn expired(&self, now: Instant) -> bool {
        self.blocking
            .lock()
            .unwrap()
            .is_some_and(|timer| timer.expired(now))
    }

    /// Wait up to one poll slice for `events` on the descriptor.
    /// `Ok(true)` means ready, `Ok(false)` means still waiting.
    fn wait_ready(&self, events: PollFlags) -> Result<bool> {
        let fd = self.raw();
        if fd == INVALID_FD {
            return Err(CoreError::PipeTimeout);
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, events)];
        match poll(&mut fds, PollTimeout::from(POLL_SLICE_MS)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(CoreError::Io(std::io::Error::from_raw_os_error(e as i32))),
        }
    }

    /// Non-blocking probe: true if `events` are ready right now
    fn probe(&self, events: PollFlags) -> bool {
        let fd = self.raw();
        if fd == INVALID_FD {
            return false;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, events)];
        matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Writable endpoint wired to a child's stdin
#[derive(Debug)]
pub struct PipeWriter {
    ep: Endpoint,
}

impl PipeWriter {
    pub(crate) fn new() -> Self {
        Self { ep: Endpoint::new() }
    }

    pub(crate) fn attach(&self, fd: OwnedFd) {
        self.ep.attach(fd);
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Duration>) {
        self.ep.set_timeout(timeout);
    }

    pub(crate) fn detach(&self) {
        self.ep.detach();
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.ep.expired(now)
    }

    /// Write as much of `buf` as the pipe accepts, blocking until the child
    /// reads or the endpoint is detached. Returns the number of bytes
    /// written; [`CoreError::PipeTimeout`] if the endpoint was detached.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ep.block();
        let rv = self.write_blocking(buf);
        self.ep.unblock();
        rv
    }

    /// Write all of `buf`, blocking as needed
    pub fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            written += self.write(&buf[written..])?;
        }
        Ok(())
    }

    fn write_blocking(&self, buf: &[u8]) -> Result<usize> {
        loop {
            if !self.ep.wait_ready(PollFlags::POLLOUT)? {
                continue;
            }
            let fd = self.ep.raw();
            if fd == INVALID_FD {
                return Err(CoreError::PipeTimeout);
            }
            let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if self.ep.is_detached() {
                return Err(CoreError::PipeTimeout);
            }
            return Err(CoreError::Io(err));
        }
    }
}

/// Readable endpoint wired to a child's stdout or stderr
#[derive(Debug)]
pub struct PipeReader {
    ep: Endpoint,
    eof: AtomicBool,
}

impl PipeReader {
    pub(crate) fn new() -> Self {
        Self {
            ep: Endpoint::new(),
            eof: AtomicBool::new(false),
        }
    }

    pub(crate) fn attach(&self, fd: OwnedFd) {
        self.ep.attach(fd);
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Duration>) {
        self.ep.set_timeout(timeout);
    }

    pub(crate) fn detach(&self) {
        self.ep.detach();
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.ep.expired(now)
    }

    /// Whether the stream has reached end of stream (or failed)
    pub fn at_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    /// Non-blocking probe: true if data is ready or the write end closed
    pub(crate) fn ready(&self) -> bool {
        self.ep.probe(PollFlags::POLLIN | PollFlags::POLLHUP)
    }

    /// Read up to `buf.len()` bytes, blocking until data arrives, the child
    /// closes its end (`Ok(0)`), or the endpoint is detached
    /// ([`CoreError::PipeTimeout`]).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ep.block();
        let rv = self.read_blocking(buf);
        self.ep.unblock();
        // End of stream and errors both mean no more data will arrive.
        if !matches!(rv, Ok(n) if n > 0) {
            self.eof.store(true, Ordering::Release);
        }
        rv
    }

    fn read_blocking(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.ep.wait_ready(PollFlags::POLLIN | PollFlags::POLLHUP)? {
                continue;
            }
            let fd = self.ep.raw();
            if fd == INVALID_FD {
                return Err(CoreError::PipeTimeout);
            }
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if self.ep.is_detached() {
                return Err(CoreError::PipeTimeout);
            }
            return Err(CoreError::Io(err));
        }
    }
}
