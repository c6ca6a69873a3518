//! Helpers shared by the process tests.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Wait for a script to write a pid into `path` and return it.
pub(crate) fn read_pid(path: &Path) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(pid) = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse().ok())
        {
            return pid;
        }
        assert!(Instant::now() < deadline, "{} never written", path.display());
        thread::sleep(Duration::from_millis(10));
    }
}

/// True once `pid` is gone or a zombie. SIGKILL delivery is asynchronous,
/// so this polls briefly.
pub(crate) fn has_exited(pid: i32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let exited = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // The state field follows the parenthesised command name.
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| matches!(rest.trim_start().chars().next(), Some('Z' | 'X'))),
            Err(_) => (unsafe { libc::kill(pid, 0) }) == -1,
        };
        if exited || Instant::now() >= deadline {
            return exited;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
