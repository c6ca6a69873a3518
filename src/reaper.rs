//! Guaranteed collection of the child's exit status.
//!
//! A [`Reaper`] is created as soon as the child exists. Consuming it with
//! [`Reaper::reap`] waits (optionally after killing the process group);
//! dropping it unreaped, e.g. on an error path, kills the group and waits.
//! Either way `waitpid` succeeds at most once per child.

use std::io;
use std::thread;
use std::time::Duration;

use libc::{c_int, pid_t};
use tracing::debug;

use crate::timeout;

/// Interval between non-blocking waits while a timeout is being watched.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Decoded wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the given status code.
    Exited(i32),
    /// Terminated by the given signal.
    Signaled(i32),
    /// `waitpid` failed, so the real status is not known.
    Unknown,
}

impl ExitStatus {
    pub fn from_raw(status: c_int) -> Self {
        if libc::WIFEXITED(status) {
            ExitStatus::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitStatus::Signaled(libc::WTERMSIG(status))
        } else {
            ExitStatus::Unknown
        }
    }

    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }

    /// Exit code, or signal number for signalled children; -1 when unknown.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) | ExitStatus::Signaled(code) => code,
            ExitStatus::Unknown => -1,
        }
    }

    pub fn signaled(self) -> bool {
        matches!(self, ExitStatus::Signaled(_))
    }
}

/// Scoped owner of a running child.
#[derive(Debug)]
pub struct Reaper {
    pid: Option<pid_t>,
}

impl Reaper {
    pub fn new(pid: pid_t) -> Self {
        Self { pid: Some(pid) }
    }

    pub fn pid(&self) -> Option<pid_t> {
        self.pid
    }

    /// Wait for the child, first killing its process group when `kill` is set.
    pub fn reap(mut self, kill: bool) -> ExitStatus {
        if kill {
            self.kill_group();
        }
        self.wait(false)
    }

    /// Wait for a child that was not killed, while an armed timer is live.
    ///
    /// If the timeout fires before the child exits, its group is killed so
    /// the wait cannot outlast the configured bound.
    pub fn reap_under_timeout(mut self) -> ExitStatus {
        self.wait(true)
    }

    /// Deliver SIGKILL to the child's whole process group.
    pub fn kill_group(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        // SAFETY: kill only sends a signal; pid is our unreaped child, so the
        // id cannot have been recycled.
        if unsafe { libc::kill(-pid, libc::SIGKILL) } == 0 {
            return;
        }
        let err = io::Error::last_os_error();
        debug!(pid, err = %err, "failed to kill process group; killing process");
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }

    fn wait(&mut self, watch_timeout: bool) -> ExitStatus {
        let Some(pid) = self.pid.take() else {
            return ExitStatus::Unknown;
        };
        let flags = if watch_timeout { libc::WNOHANG } else { 0 };
        let mut killed = false;
        let mut status: c_int = 0;
        loop {
            // SAFETY: waitpid writes the status into a stack local.
            let ret = unsafe { libc::waitpid(pid, &mut status, flags) };
            if ret == pid {
                return ExitStatus::from_raw(status);
            }
            if ret == 0 {
                if !killed && timeout::timed_out() {
                    debug!(pid, "timeout expired while waiting; killing process group");
                    unsafe {
                        libc::kill(-pid, libc::SIGKILL);
                    }
                    killed = true;
                }
                thread::sleep(REAP_POLL_INTERVAL);
                continue;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            debug!(pid, err = %err, "waitpid failed");
            return ExitStatus::Unknown;
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if self.pid.is_some() {
            self.kill_group();
            let status = self.wait(false);
            debug!(?status, "reaped child on abnormal exit");
        }
    }
}
