use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::debug;

use crate::models::error::{Result, ShellError};

/// A spawned child and the bookkeeping its supervisor needs.
pub struct ProcessHandle {
    pub child: Child,
    pub pid: u32,
    pub started: Instant,
    pub timeout: Duration,
}

impl ProcessHandle {
    /// The child leads its own group, so the group id equals its pid.
    pub fn pgid(&self) -> i32 {
        self.pid as i32
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }
}

/// Run `command` through `sh -c` in a fresh process group with stdin closed.
pub fn spawn(command: &str, working_dir: &Path, timeout: Duration) -> Result<ProcessHandle> {
    debug!("Spawning '{}' in {}", command, working_dir.display());
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| ShellError::from_spawn(e, command))?;

    let pid = child.id();
    Ok(ProcessHandle {
        child,
        pid,
        started: Instant::now(),
        timeout,
    })
}

/// Reason text for shell exit codes that really mean a launch problem.
pub fn describe_exit_code(code: i32) -> Option<&'static str> {
    match code {
        126 => Some("command found but not executable (permission denied)"),
        127 => Some("command not found"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn child_leads_its_own_process_group() {
        let dir = TempDir::new().unwrap();
        let mut handle = spawn("sleep 1", dir.path(), Duration::from_secs(5)).unwrap();
        let pgid = unsafe { libc::getpgid(handle.pid as i32) };
        assert_eq!(pgid, handle.pgid());
        handle.child.kill().unwrap();
        handle.child.wait().unwrap();
    }

    #[test]
    fn missing_working_dir_is_not_found() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        match spawn("true", &missing, Duration::from_secs(1)) {
            Err(ShellError::NotFound(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[test]
    fn shell_exit_codes_are_annotated() {
        assert_eq!(describe_exit_code(127), Some("command not found"));
        assert!(describe_exit_code(126).is_some());
        assert_eq!(describe_exit_code(1), None);
    }
}
