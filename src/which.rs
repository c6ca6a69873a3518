//! Executable lookup.
//!
//! Resolves a program name to a regular file the current effective user may
//! execute, honouring owner/group/other permission bits the same way the
//! kernel does rather than accepting any execute bit.

use std::env;
use std::ffi::OsString;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Resolve `name` against the directories listed in `PATH`.
pub fn which_on_path(name: &str) -> Option<PathBuf> {
    which(name, &search_directories(env::var_os("PATH")))
}

/// Resolve `name` against `directories`.
///
/// - Absolute names are returned as-is when executable.
/// - Names containing a `/` are taken relative to the current directory.
/// - Bare names are tried in each directory in order; empty entries are skipped.
///
/// Returns `None` when nothing matches; a missing program is not an error.
pub fn which(name: &str, directories: &[PathBuf]) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    if name.contains('/') {
        let absolute = env::current_dir().ok()?.join(candidate);
        return is_executable(&absolute).then_some(absolute);
    }
    directories
        .iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
}

/// Split a `PATH`-style value into directories.
pub fn search_directories(path_var: Option<OsString>) -> Vec<PathBuf> {
    path_var
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default()
}

/// Returns `true` when `path` is a regular file executable by the effective
/// user: root needs any execute bit, the owner needs the user bit, group
/// members the group bit, everyone else the other bit.
pub(crate) fn is_executable(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    let mode = meta.mode();
    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        return mode & 0o111 != 0;
    }
    if meta.uid() == euid {
        return mode & 0o100 != 0;
    }
    if is_group_member(meta.gid()) {
        return mode & 0o010 != 0;
    }
    mode & 0o001 != 0
}

fn is_group_member(gid: libc::gid_t) -> bool {
    // SAFETY: getgid/getegid have no preconditions.
    if unsafe { libc::getgid() } == gid || unsafe { libc::getegid() } == gid {
        return true;
    }
    static GROUPS: OnceLock<Vec<libc::gid_t>> = OnceLock::new();
    GROUPS.get_or_init(supplementary_groups).contains(&gid)
}

fn supplementary_groups() -> Vec<libc::gid_t> {
    // SAFETY: a zero-sized query only returns the group count.
    let count = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    if count < 1 {
        return Vec::new();
    }
    let mut groups: Vec<libc::gid_t> = vec![0; count as usize];
    // SAFETY: the buffer holds exactly `count` entries.
    let filled = unsafe { libc::getgroups(count, groups.as_mut_ptr()) };
    if filled != count {
        return Vec::new();
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions, Permissions};
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    fn make_file(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        OpenOptions::new()
            .create(true)
            .write(true)
            .mode(mode)
            .open(&path)
            .unwrap();
        fs::set_permissions(&path, Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn resolves_sh_on_real_path() {
        let result = which_on_path("sh");
        assert!(result.as_deref().is_some_and(Path::is_absolute), "sh should exist on PATH: {result:?}");
    }

    #[test]
    fn missing_command_is_none() {
        assert!(which_on_path("childline-nonexistent-binary-xyz-999").is_none());
        assert!(which("", &[PathBuf::from("/bin")]).is_none());
    }

    #[test]
    fn explicit_absolute_path_is_checked_directly() {
        let sh = which_on_path("sh").expect("sh should exist");
        assert_eq!(which(sh.to_str().unwrap(), &[]), Some(sh));
        assert!(which("/no/such/binary", &[]).is_none());
    }

    #[test]
    fn finds_binary_in_custom_directories_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let expected = make_file(first.path(), "tool", 0o755);
        make_file(second.path(), "tool", 0o755);

        let dirs = vec![
            PathBuf::new(),
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ];
        assert_eq!(which("tool", &dirs), Some(expected));
    }

    #[test]
    fn skips_directory_with_same_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("tool")).unwrap();
        assert!(which("tool", &[dir.path().to_path_buf()]).is_none());
    }

    #[test]
    fn skips_file_without_execute_permission() {
        let dir = tempfile::tempdir().unwrap();
        make_file(dir.path(), "no-exec", 0o644);
        assert!(which("no-exec", &[dir.path().to_path_buf()]).is_none());
    }

    #[test]
    fn owner_needs_user_execute_bit() {
        // Group/other bits alone do not let the owner run the file, unless
        // running as root where any bit suffices.
        let dir = tempfile::tempdir().unwrap();
        let path = make_file(dir.path(), "group-only", 0o611);
        let root = unsafe { libc::geteuid() } == 0;
        assert_eq!(is_executable(&path), root);
    }

    #[test]
    fn search_directories_splits_path_value() {
        let dirs = search_directories(Some(OsString::from("/a:/b")));
        assert_eq!(dirs, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(search_directories(None).is_empty());
    }
}
