//! Child process creation.
//!
//! Everything the child needs (program path, argv, envp) is converted to C
//! strings before forking. After `fork` the child runs [`exec_child`], which
//! is restricted to `setpgid`, `signal`, `sigprocmask`, `dup2`, `fcntl`,
//! `close`, `sysconf`, `getrlimit`, `write`, `execve` and `_exit`: no
//! allocation, no locks, no unwinding, no writes to memory shared with the
//! parent's logic.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use libc::{c_char, c_int, pid_t};

use crate::error::ExecError;
use crate::pipe::ChildFds;

/// Used when neither `sysconf` nor `getrlimit` reports a descriptor limit.
const DEFAULT_DESCRIPTOR_LIMIT: u64 = 256;

/// Program, argument and environment vectors ready for `execve`.
///
/// The pointer tables reference the heap buffers of the owned `CString`s,
/// which stay put for as long as the image lives.
#[derive(Debug)]
pub struct ExecImage {
    program: CString,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
}

impl ExecImage {
    pub fn new<A, E>(program: &Path, argv: &[A], envp: &[E]) -> Result<Self, ExecError>
    where
        A: AsRef<OsStr>,
        E: AsRef<OsStr>,
    {
        let program = to_cstring(program.as_os_str())?;
        let argv = argv
            .iter()
            .map(|a| to_cstring(a.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = envp
            .iter()
            .map(|e| to_cstring(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            program,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
        })
    }

    pub fn program(&self) -> &CString {
        &self.program
    }
}

fn to_cstring(value: &OsStr) -> Result<CString, ExecError> {
    CString::new(value.as_bytes()).map_err(|_| ExecError::InvalidArgument {
        detail: format!("{} contains an interior NUL byte", value.to_string_lossy()),
    })
}

fn null_terminated(values: &[CString]) -> Vec<*const c_char> {
    let mut ptrs: Vec<*const c_char> = values.iter().map(|v| v.as_ptr()).collect();
    ptrs.push(ptr::null());
    ptrs
}

/// Fork and exec `image` with its standard streams wired to `fds`.
///
/// Returns the child's pid, which is also its process group id. A failure to
/// fork is returned immediately. If exec fails, the child exits with the
/// `errno` of the failing step (or `EXIT_FAILURE`) after writing a short
/// message to its stderr descriptor.
pub fn spawn(image: &ExecImage, fds: ChildFds) -> io::Result<pid_t> {
    // Held open until the fork is done; the child has its own copies.
    let (fds, _lifted) = lift_above_stderr(fds)?;
    // SAFETY: the child branch only calls exec_child and _exit, both of which
    // stick to async-signal-safe calls on data prepared before the fork.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        // SAFETY: we are the freshly forked child; all pointers come from image.
        unsafe {
            let errno = exec_child(
                fds,
                image.program.as_ptr(),
                image.argv_ptrs.as_ptr(),
                image.envp_ptrs.as_ptr(),
            );
            libc::_exit(if errno == 0 { libc::EXIT_FAILURE } else { errno });
        }
    }

    // Also set the group from the parent so a kill issued before the child
    // reaches setpgid still hits the group. EACCES after exec is harmless.
    // SAFETY: setpgid on our own child only changes its group membership.
    unsafe {
        libc::setpgid(pid, pid);
    }
    Ok(pid)
}

/// Move any of `fds` that sits on 0, 1 or 2 to a new descriptor above
/// stderr.
///
/// The child redirects stdin, then stdout, then stderr. When the parent runs
/// with a standard slot closed, a pipe end can be allocated on that slot and
/// would be overwritten by an earlier `dup2` before its own turn. Descriptors
/// above stderr cannot collide with a redirect target.
fn lift_above_stderr(fds: ChildFds) -> io::Result<(ChildFds, Vec<OwnedFd>)> {
    let mut lifted = Vec::new();
    let mut lift = |fd: RawFd| -> io::Result<RawFd> {
        if fd > libc::STDERR_FILENO {
            return Ok(fd);
        }
        // SAFETY: F_DUPFD_CLOEXEC only creates a descriptor, which we own.
        let copy = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, libc::STDERR_FILENO + 1) };
        if copy == -1 {
            return Err(io::Error::last_os_error());
        }
        lifted.push(unsafe { OwnedFd::from_raw_fd(copy) });
        Ok(copy)
    };
    let fds = ChildFds {
        stdin: lift(fds.stdin)?,
        stdout: lift(fds.stdout)?,
        stderr: lift(fds.stderr)?,
    };
    Ok((fds, lifted))
}

/// Runs in the forked child. Only returns if a step failed; the return value
/// is the `errno` of that step.
///
/// # Safety
///
/// Must only be called in a freshly forked child. `program`, `argv` and
/// `envp` must be valid, null-terminated C data.
unsafe fn exec_child(
    fds: ChildFds,
    program: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    unsafe {
        if libc::setpgid(0, 0) == -1 {
            return fail(fds.stderr, b"failed to setpgid.\n");
        }
        // Rust ignores SIGPIPE and ignored signals survive exec; the child
        // gets default dispositions and an empty mask.
        let mut empty: libc::sigset_t = std::mem::zeroed();
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR
            || libc::sigemptyset(&mut empty) == -1
            || libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut()) == -1
        {
            return fail(fds.stderr, b"failed to reset child signal state.\n");
        }
        if !redirect(fds.stdin, libc::STDIN_FILENO) {
            return fail(fds.stderr, b"failed to redirect child stdin.\n");
        }
        if !redirect(fds.stdout, libc::STDOUT_FILENO) {
            return fail(fds.stderr, b"failed to redirect child stdout.\n");
        }
        if !redirect(fds.stderr, libc::STDERR_FILENO) {
            return fail(fds.stderr, b"failed to redirect child stderr.\n");
        }

        let limit = max_descriptor_limit();
        let mut fd: c_int = libc::STDERR_FILENO + 1;
        while (fd as u64) < limit {
            libc::close(fd);
            fd += 1;
        }

        libc::execve(program, argv, envp);
        fail(libc::STDERR_FILENO, b"failed to execute program.\n")
    }
}

/// Duplicate `fd` onto `target`. The copy does not inherit close-on-exec.
/// `fd` is always above stderr here, so it never equals `target`.
unsafe fn redirect(fd: c_int, target: c_int) -> bool {
    unsafe { libc::dup2(fd, target) != -1 }
}

/// Report a failure with a raw write and hand back the errno it was about.
unsafe fn fail(fd: c_int, message: &'static [u8]) -> c_int {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    // SAFETY: write on a static buffer; the result is deliberately ignored.
    unsafe {
        libc::write(fd, message.as_ptr().cast(), message.len());
    }
    errno
}

/// Highest descriptor number (exclusive) that may be open in this process.
pub(crate) fn max_descriptor_limit() -> u64 {
    // SAFETY: sysconf and getrlimit only read process limits.
    let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if open_max > 0 {
        return open_max as u64;
    }
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } == 0
        && lim.rlim_cur != libc::RLIM_INFINITY
    {
        return (lim.rlim_cur as u64).min(c_int::MAX as u64);
    }
    DEFAULT_DESCRIPTOR_LIMIT
}
