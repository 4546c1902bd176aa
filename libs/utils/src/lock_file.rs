//! Parsing of PostgreSQL's `postmaster.pid` lock file, used by the
//! Preflight Validator to tell "no postmaster running" apart from "lock
//! file is corrupt" (the two must be distinguished: a malformed lock file
//! is fatal on its own, never silently treated as "not running").

use std::path::Path;

use nix::sys::signal;
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum LockFileError {
    #[error("postmaster.pid is malformed: {0}")]
    Malformed(String),
}

/// Outcome of inspecting a destination data directory's lock file.
#[derive(Debug, Eq, PartialEq)]
pub enum PostmasterStatus {
    /// No lock file present.
    NotRunning,
    /// Lock file present but the PID it names is not alive.
    StaleLock,
    /// Lock file present and the PID it names is alive.
    Running(i32),
}

/// Reads and interprets `<data_dir>/postmaster.pid`.
pub fn check_postmaster(data_dir: &Path) -> Result<PostmasterStatus, LockFileError> {
    let path = data_dir.join("postmaster.pid");
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PostmasterStatus::NotRunning),
        Err(e) => return Err(LockFileError::Malformed(format!("cannot read {path:?}: {e}"))),
    };

    let first_line = contents
        .lines()
        .next()
        .ok_or_else(|| LockFileError::Malformed(format!("{path:?} is empty")))?;

    let pid: i32 = first_line
        .trim()
        .parse()
        .map_err(|_| LockFileError::Malformed(format!("{path:?}: first line is not a pid: {first_line:?}")))?;

    if pid <= 0 {
        return Err(LockFileError::Malformed(format!("{path:?}: non-positive pid {pid}")));
    }

    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => Ok(PostmasterStatus::Running(pid)),
        Err(nix::errno::Errno::ESRCH) => Ok(PostmasterStatus::StaleLock),
        Err(e) => Err(LockFileError::Malformed(format!(
            "{path:?}: cannot probe pid {pid}: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn missing_lock_file_is_not_running() {
        let dir = tempdir().unwrap();
        let status = check_postmaster(dir.path().as_std_path()).unwrap();
        assert_eq!(status, PostmasterStatus::NotRunning);
    }

    #[test]
    fn malformed_lock_file_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("postmaster.pid"), "not-a-pid\n").unwrap();
        let err = check_postmaster(dir.path().as_std_path()).unwrap_err();
        assert!(matches!(err, LockFileError::Malformed(_)));
    }

    #[test]
    fn dead_pid_is_stale_lock() {
        let dir = tempdir().unwrap();
        // pid 1 typically belongs to init/systemd in test containers, not us;
        // use a pid that is exceedingly unlikely to exist instead.
        std::fs::write(dir.path().join("postmaster.pid"), "2000000000\n").unwrap();
        let status = check_postmaster(dir.path().as_std_path()).unwrap();
        assert_eq!(status, PostmasterStatus::StaleLock);
    }
}
