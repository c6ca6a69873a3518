//! Wall-clock timeout driven by `SIGALRM`.
//!
//! The handler only stores `true` into an atomic flag; the multiplexer polls
//! that flag on every tick. The flag is process-wide, so arming takes a
//! process-wide lock that the returned guard holds until it disarms: timed
//! executions on different threads run one after another instead of sharing
//! a timer.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::error::ExecError;

static TIMED_OUT: AtomicBool = AtomicBool::new(false);
static TIMER_LOCK: Mutex<()> = Mutex::new(());

extern "C" fn on_alarm(_signal: libc::c_int) {
    TIMED_OUT.store(true, Ordering::SeqCst);
}

/// Whether the armed timer has fired.
pub fn timed_out() -> bool {
    TIMED_OUT.load(Ordering::SeqCst)
}

/// Arm a one-shot timer for `timeout_sec` seconds. Zero means no timeout.
pub fn arm(timeout_sec: u64) -> Result<Option<TimeoutGuard>, ExecError> {
    if timeout_sec == 0 {
        return Ok(None);
    }
    TimeoutGuard::arm(timeout_sec).map(Some)
}

/// An armed timer. Dropping it cancels the timer, restores the previous
/// `SIGALRM` disposition and clears the flag.
pub struct TimeoutGuard {
    previous: libc::sigaction,
    _serial: MutexGuard<'static, ()>,
}

impl TimeoutGuard {
    fn arm(timeout_sec: u64) -> Result<Self, ExecError> {
        let serial = TIMER_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        TIMED_OUT.store(false, Ordering::SeqCst);

        // SAFETY: an all-zero sigaction is a valid "default" value.
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = on_alarm as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // No SA_RESTART: a blocked poll should wake with EINTR.
        action.sa_flags = 0;
        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        // SAFETY: both structs are valid for the duration of the calls.
        let installed = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGALRM, &action, &mut previous)
        };
        if installed == -1 {
            let source = io::Error::last_os_error();
            error!(err = %source, "sigaction failed");
            return Err(ExecError::Setup {
                what: "install the timeout signal handler",
                source,
            });
        }

        let timer = itimer(timeout_sec);
        // SAFETY: setitimer reads a valid itimerval from the stack.
        if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) } == -1 {
            let source = io::Error::last_os_error();
            error!(err = %source, "setitimer failed");
            unsafe {
                libc::sigaction(libc::SIGALRM, &previous, ptr::null_mut());
            }
            return Err(ExecError::Setup {
                what: "arm the timeout timer",
                source,
            });
        }

        debug!(timeout_sec, "timeout armed");
        Ok(Self {
            previous,
            _serial: serial,
        })
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        let timer = itimer(0);
        // SAFETY: a zero itimerval disarms the timer; sigaction restores the
        // disposition saved at arm time.
        unsafe {
            libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut());
            libc::sigaction(libc::SIGALRM, &self.previous, ptr::null_mut());
        }
        TIMED_OUT.store(false, Ordering::SeqCst);
    }
}

fn itimer(seconds: u64) -> libc::itimerval {
    libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: seconds.min(i32::MAX as u64) as libc::time_t,
            tv_usec: 0,
        },
    }
}
