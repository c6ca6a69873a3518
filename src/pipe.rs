//! OS pipes connecting the parent to the child's standard streams.
//!
//! Every descriptor is an [`OwnedFd`], so a pipe end is closed exactly once,
//! by whichever owner holds it last. All ends are created close-on-exec; the
//! child's `dup2` onto 0/1/2 clears the flag on the copies it keeps.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::ExecError;
use crate::options::StderrPolicy;

const NULL_DEVICE: &str = "/dev/null";

/// Which standard stream a pipe end serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    Stdin,
    Stdout,
    Stderr,
}

impl PipeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PipeRole::Stdin => "stdin",
            PipeRole::Stdout => "stdout",
            PipeRole::Stderr => "stderr",
        }
    }
}

impl fmt::Display for PipeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An owned descriptor tagged with the stream it serves.
#[derive(Debug)]
pub struct PipeEndpoint {
    role: PipeRole,
    fd: OwnedFd,
}

impl PipeEndpoint {
    pub fn new(role: PipeRole, fd: OwnedFd) -> Self {
        Self { role, fd }
    }

    pub fn role(&self) -> PipeRole {
        self.role
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsRawFd for PipeEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for PipeEndpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Both ends of one pipe.
#[derive(Debug)]
pub struct Pipe {
    pub read: PipeEndpoint,
    pub write: PipeEndpoint,
}

impl Pipe {
    pub fn new(role: PipeRole) -> io::Result<Self> {
        let mut fds: [RawFd; 2] = [-1; 2];
        // SAFETY: pipe writes two descriptors into a stack array of length 2.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe succeeded, so both descriptors are open and unowned.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_cloexec(read.as_raw_fd())?;
        set_cloexec(write.as_raw_fd())?;
        Ok(Self {
            read: PipeEndpoint::new(role, read),
            write: PipeEndpoint::new(role, write),
        })
    }
}

/// Where the child's stderr is connected.
#[derive(Debug)]
pub enum StderrTarget {
    /// The stdout write end is reused.
    Stdout,
    Null(OwnedFd),
    Pipe(Pipe),
}

/// Descriptors the child duplicates onto its standard slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildFds {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

/// The ends the parent keeps once the child is running.
#[derive(Debug)]
pub struct ParentEnds {
    pub stdin: PipeEndpoint,
    pub stdout: PipeEndpoint,
    /// `None` unless stderr is captured on its own pipe.
    pub stderr: Option<PipeEndpoint>,
}

/// Every pipe needed for one execution, allocated right before spawning.
#[derive(Debug)]
pub struct PipeSet {
    stdin: Pipe,
    stdout: Pipe,
    stderr: StderrTarget,
}

impl PipeSet {
    pub fn allocate(policy: StderrPolicy) -> Result<Self, ExecError> {
        let stdin = Pipe::new(PipeRole::Stdin).map_err(|source| ExecError::Setup {
            what: "allocate pipe for stdin redirection",
            source,
        })?;
        let stdout = Pipe::new(PipeRole::Stdout).map_err(|source| ExecError::Setup {
            what: "allocate pipe for stdout redirection",
            source,
        })?;
        let stderr = match policy {
            StderrPolicy::Stdout => StderrTarget::Stdout,
            StderrPolicy::Null => StderrTarget::Null(open_null_device()?),
            StderrPolicy::Capture => {
                StderrTarget::Pipe(Pipe::new(PipeRole::Stderr).map_err(|source| {
                    ExecError::Setup {
                        what: "allocate pipe for stderr redirection",
                        source,
                    }
                })?)
            }
        };
        Ok(Self {
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn child_fds(&self) -> ChildFds {
        let stderr = match &self.stderr {
            StderrTarget::Stdout => self.stdout.write.as_raw_fd(),
            StderrTarget::Null(fd) => fd.as_raw_fd(),
            StderrTarget::Pipe(pipe) => pipe.write.as_raw_fd(),
        };
        ChildFds {
            stdin: self.stdin.read.as_raw_fd(),
            stdout: self.stdout.write.as_raw_fd(),
            stderr,
        }
    }

    /// Keep the parent's ends; the ends handed to the child are closed here.
    pub fn into_parent_ends(self) -> ParentEnds {
        let stderr = match self.stderr {
            StderrTarget::Pipe(pipe) => Some(pipe.read),
            StderrTarget::Stdout | StderrTarget::Null(_) => None,
        };
        ParentEnds {
            stdin: self.stdin.write,
            stdout: self.stdout.read,
            stderr,
        }
    }
}

fn open_null_device() -> Result<OwnedFd, ExecError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(NULL_DEVICE)
        .map(OwnedFd::from)
        .map_err(|source| ExecError::Setup {
            what: "open the null device for stderr redirection",
            source,
        })
}

/// Mark a descriptor close-on-exec so it does not leak into unrelated children.
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl only reads/updates descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Put a descriptor in non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl only reads/updates file status flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};

    fn fd_flags(fd: RawFd) -> i32 {
        unsafe { libc::fcntl(fd, libc::F_GETFD) }
    }

    #[test]
    fn pipe_ends_are_cloexec_and_connected() {
        let pipe = Pipe::new(PipeRole::Stdout).unwrap();
        assert_ne!(fd_flags(pipe.read.as_raw_fd()) & libc::FD_CLOEXEC, 0);
        assert_ne!(fd_flags(pipe.write.as_raw_fd()) & libc::FD_CLOEXEC, 0);
        assert_eq!(pipe.read.role(), PipeRole::Stdout);

        let mut writer = File::from(pipe.write.into_fd());
        writer.write_all(b"ping").unwrap();
        drop(writer);

        let mut reader = File::from(pipe.read.into_fd());
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "ping");
    }

    #[test]
    fn capture_policy_allocates_dedicated_stderr() {
        let set = PipeSet::allocate(StderrPolicy::Capture).unwrap();
        let fds = set.child_fds();
        assert_ne!(fds.stderr, fds.stdout);
        let ends = set.into_parent_ends();
        assert_eq!(ends.stderr.map(|e| e.role()), Some(PipeRole::Stderr));
        assert_eq!(ends.stdin.role(), PipeRole::Stdin);
    }

    #[test]
    fn stdout_policy_shares_stdout_write_end() {
        let set = PipeSet::allocate(StderrPolicy::Stdout).unwrap();
        let fds = set.child_fds();
        assert_eq!(fds.stderr, fds.stdout);
        assert!(set.into_parent_ends().stderr.is_none());
    }

    #[test]
    fn null_policy_uses_separate_descriptor() {
        let set = PipeSet::allocate(StderrPolicy::Null).unwrap();
        let fds = set.child_fds();
        assert_ne!(fds.stderr, fds.stdout);
        assert_ne!(fds.stderr, fds.stdin);
        assert!(set.into_parent_ends().stderr.is_none());
    }

    #[test]
    fn parent_ends_close_child_side() {
        let set = PipeSet::allocate(StderrPolicy::Capture).unwrap();
        let ends = set.into_parent_ends();
        // The write end went away with the set, so reading sees EOF at once.
        let mut reader = File::from(ends.stdout.into_fd());
        let mut buf = Vec::new();
        assert_eq!(reader.read_to_end(&mut buf).unwrap(), 0);
    }

    #[test]
    fn set_nonblocking_sets_flag() {
        let pipe = Pipe::new(PipeRole::Stdin).unwrap();
        set_nonblocking(pipe.write.as_raw_fd()).unwrap();
        let flags = unsafe { libc::fcntl(pipe.write.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }
}
