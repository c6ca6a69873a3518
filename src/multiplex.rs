//! Single-threaded readiness loop between the parent and the child.
//!
//! Each pass polls the open output pipes for input and, while payload
//! remains, the stdin pipe for output. Ready pipes are serviced once per pass;
//! the loop ends when every output pipe reached EOF, a sink asks to stop, or
//! the timeout flag is raised.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use libc::{c_int, pid_t};
use tracing::{debug, error, trace};

use crate::error::ExecError;
use crate::pipe::{self, PipeEndpoint, PipeRole};
use crate::streams::StreamSink;
use crate::timeout;

/// Poll bound while a timeout is configured, so the flag is seen promptly.
pub const TICK_MS: c_int = 500;

/// Read size when the kernel does not report how much is pending.
const DEFAULT_CHUNK: usize = 4096;
const MAX_CHUNK: usize = 64 * 1024;

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
const WRITE_EVENTS: libc::c_short = libc::POLLOUT | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every output pipe reached EOF.
    Drained,
    /// A sink returned `false`.
    Stopped,
    /// The timeout flag was raised; the child must be killed.
    TimedOut { pid: pid_t },
}

/// One output pipe and where its bytes go. `None` once EOF was read.
pub struct StreamState<'a> {
    role: PipeRole,
    endpoint: Option<PipeEndpoint>,
    buffer: Vec<u8>,
    sink: &'a mut dyn StreamSink,
}

impl<'a> StreamState<'a> {
    pub fn new(endpoint: PipeEndpoint, sink: &'a mut dyn StreamSink) -> Self {
        Self {
            role: endpoint.role(),
            endpoint: Some(endpoint),
            buffer: Vec::new(),
            sink,
        }
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.endpoint.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Read what is available. `Ok(false)` means the sink asked to stop.
    fn read_ready(&mut self) -> Result<bool, ExecError> {
        let Some(fd) = self.raw_fd() else {
            return Ok(true);
        };
        let chunk = match pending_bytes(fd) {
            0 => DEFAULT_CHUNK,
            n => n.min(MAX_CHUNK),
        };
        self.buffer.resize(chunk, 0);
        // SAFETY: the buffer is valid for `chunk` bytes and fd is open.
        let count = unsafe { libc::read(fd, self.buffer.as_mut_ptr().cast(), self.buffer.len()) };
        if count < 0 {
            let err = io::Error::last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ) {
                debug!(stream = %self.role, "pipe read was interrupted and will be retried");
                return Ok(true);
            }
            error!(stream = %self.role, err = %err, "pipe read failed");
            return Err(ExecError::Io {
                stream: self.role,
                source: err,
            });
        }
        if count == 0 {
            trace!(stream = %self.role, "pipe closed");
            self.endpoint = None;
            return Ok(true);
        }
        Ok(self.sink.accept(&self.buffer[..count as usize]))
    }
}

/// The stdin payload still owed to the child.
pub struct StdinFeed<'a> {
    endpoint: Option<PipeEndpoint>,
    remaining: &'a [u8],
}

impl<'a> StdinFeed<'a> {
    /// Feed `payload` through `endpoint`, which is switched to non-blocking
    /// so a write never waits for the child to drain the whole payload.
    pub fn new(endpoint: PipeEndpoint, payload: &'a [u8]) -> Result<Self, ExecError> {
        pipe::set_nonblocking(endpoint.as_raw_fd()).map_err(|source| ExecError::Setup {
            what: "make the stdin pipe non-blocking",
            source,
        })?;
        Ok(Self {
            endpoint: Some(endpoint),
            remaining: payload,
        })
    }

    /// No input: the child sees EOF on stdin.
    pub fn closed() -> Self {
        Self {
            endpoint: None,
            remaining: &[],
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.endpoint.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn close_if_exhausted(&mut self) {
        if self.remaining.is_empty() && self.endpoint.take().is_some() {
            trace!("stdin payload written; closing pipe");
        }
    }

    fn abandon(&mut self) {
        debug!(
            unwritten = self.remaining.len(),
            "child closed its stdin; abandoning remaining input"
        );
        self.endpoint = None;
        self.remaining = &[];
    }

    fn write_ready(&mut self) -> Result<(), ExecError> {
        let Some(fd) = self.raw_fd() else {
            return Ok(());
        };
        // SAFETY: `remaining` is a valid slice and fd is open.
        let count = unsafe { libc::write(fd, self.remaining.as_ptr().cast(), self.remaining.len()) };
        if count < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
                    debug!("stdin pipe write was interrupted and will be retried");
                    return Ok(());
                }
                io::ErrorKind::BrokenPipe => {
                    self.abandon();
                    return Ok(());
                }
                _ => {
                    error!(err = %err, "stdin pipe write failed");
                    return Err(ExecError::Io {
                        stream: PipeRole::Stdin,
                        source: err,
                    });
                }
            }
        }
        if count == 0 {
            self.abandon();
            return Ok(());
        }
        self.remaining = &self.remaining[count as usize..];
        Ok(())
    }
}

/// Shuttle bytes until the streams drain, a sink stops, or time runs out.
///
/// With `timeout_sec == 0` the readiness wait blocks indefinitely; otherwise
/// it wakes every [`TICK_MS`] to look at the timeout flag.
pub fn run(
    pid: pid_t,
    streams: &mut [StreamState<'_>],
    mut input: StdinFeed<'_>,
    timeout_sec: u64,
) -> Result<Completion, ExecError> {
    let timed = timeout_sec > 0;
    let wait_ms = if timed { TICK_MS } else { -1 };
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(streams.len() + 1);

    loop {
        // The flag is process-wide; only the holder of the timer may act on it.
        if timed && timeout::timed_out() {
            return Ok(Completion::TimedOut { pid });
        }
        input.close_if_exhausted();

        fds.clear();
        for fd in streams.iter().filter_map(StreamState::raw_fd) {
            fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        if fds.is_empty() {
            return Ok(Completion::Drained);
        }
        let input_slot = input.raw_fd().map(|fd| {
            fds.push(libc::pollfd {
                fd,
                events: libc::POLLOUT,
                revents: 0,
            });
            fds.len() - 1
        });

        // SAFETY: fds is a valid array of pollfd for its full length.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, wait_ms) };
        if ready == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                debug!("readiness wait was interrupted and will be retried");
                continue;
            }
            error!(err = %err, "poll failed");
            return Err(ExecError::Wait { source: err });
        }
        if ready == 0 {
            continue;
        }

        let mut slot = 0;
        for stream in streams.iter_mut() {
            if !stream.is_open() {
                continue;
            }
            let revents = fds[slot].revents;
            slot += 1;
            if revents & READ_EVENTS == 0 {
                continue;
            }
            if !stream.read_ready()? {
                debug!(stream = %stream.role, "stream callback requested early termination");
                return Ok(Completion::Stopped);
            }
        }

        if let Some(slot) = input_slot {
            if fds[slot].revents & WRITE_EVENTS != 0 {
                input.write_ready()?;
            }
        }
    }
}

/// Bytes the kernel reports as readable on `fd`, or 0 if unknown.
fn pending_bytes(fd: RawFd) -> usize {
    let mut available: c_int = 0;
    // SAFETY: FIONREAD writes a single int.
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available as *mut c_int) };
    if ret == -1 || available < 0 {
        return 0;
    }
    available as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::Pipe;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn drains_both_streams_in_order() {
        let out = Pipe::new(PipeRole::Stdout).unwrap();
        let err = Pipe::new(PipeRole::Stderr).unwrap();

        let mut out_writer = File::from(out.write.into_fd());
        let mut err_writer = File::from(err.write.into_fd());
        let writer = thread::spawn(move || {
            for i in 0..200 {
                writeln!(out_writer, "line {i}").unwrap();
            }
            err_writer.write_all(b"oops").unwrap();
        });

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut on_out = |data: &[u8]| {
            stdout.extend_from_slice(data);
            true
        };
        let mut on_err = |data: &[u8]| {
            stderr.extend_from_slice(data);
            true
        };
        let mut streams = [
            StreamState::new(out.read, &mut on_out),
            StreamState::new(err.read, &mut on_err),
        ];
        let completion = run(0, &mut streams, StdinFeed::closed(), 0).unwrap();
        assert_eq!(completion, Completion::Drained);
        assert!(streams.iter().all(|s| !s.is_open()));
        drop(streams);
        writer.join().unwrap();

        let expected: String = (0..200).map(|i| format!("line {i}\n")).collect();
        assert_eq!(String::from_utf8(stdout).unwrap(), expected);
        assert_eq!(stderr, b"oops");
    }

    #[test]
    fn sink_returning_false_stops_the_loop() {
        let out = Pipe::new(PipeRole::Stdout).unwrap();
        let mut writer = File::from(out.write.into_fd());
        writer.write_all(b"first").unwrap();

        let mut calls = 0;
        let mut on_out = |_: &[u8]| {
            calls += 1;
            false
        };
        let mut streams = [StreamState::new(out.read, &mut on_out)];
        // The writer is still open, so only the stop request can end the loop.
        let completion = run(0, &mut streams, StdinFeed::closed(), 0).unwrap();
        assert_eq!(completion, Completion::Stopped);
        drop(streams);
        assert_eq!(calls, 1);
        drop(writer);
    }

    #[test]
    fn writes_payload_larger_than_pipe_buffer() {
        // A "child" that echoes stdin to stdout, played by a thread.
        let stdin = Pipe::new(PipeRole::Stdin).unwrap();
        let out = Pipe::new(PipeRole::Stdout).unwrap();
        let mut child_in = File::from(stdin.read.into_fd());
        let mut child_out = File::from(out.write.into_fd());
        let echo = thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                let n = child_in.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                child_out.write_all(&buf[..n]).unwrap();
            }
        });

        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
        let mut echoed = Vec::new();
        let mut on_out = |data: &[u8]| {
            echoed.extend_from_slice(data);
            true
        };
        let mut streams = [StreamState::new(out.read, &mut on_out)];
        let feed = StdinFeed::new(stdin.write, &payload).unwrap();
        let completion = run(0, &mut streams, feed, 0).unwrap();
        assert_eq!(completion, Completion::Drained);
        drop(streams);
        echo.join().unwrap();
        assert_eq!(echoed, payload);
    }

    #[test]
    fn reader_that_closes_stdin_abandons_payload() {
        let stdin = Pipe::new(PipeRole::Stdin).unwrap();
        let out = Pipe::new(PipeRole::Stdout).unwrap();
        drop(stdin.read);
        let out_writer = File::from(out.write.into_fd());

        let mut on_out = |_: &[u8]| true;
        let mut streams = [StreamState::new(out.read, &mut on_out)];
        let feed = StdinFeed::new(stdin.write, b"ignored").unwrap();
        let closer = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(100));
            drop(out_writer);
        });
        let completion = run(0, &mut streams, feed, 0).unwrap();
        assert_eq!(completion, Completion::Drained);
        closer.join().unwrap();
    }

    #[test]
    fn pending_bytes_reports_buffered_data() {
        let pipe = Pipe::new(PipeRole::Stdout).unwrap();
        let mut writer = File::from(pipe.write.into_fd());
        writer.write_all(b"12345").unwrap();
        assert_eq!(pending_bytes(pipe.read.as_raw_fd()), 5);
    }
}
