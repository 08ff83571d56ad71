use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShellError>;

#[derive(Error, Debug)]
pub enum ShellError {
    /// Executable, shell or working directory missing
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Any other OS-level spawn error
    #[error("Failed to spawn process: {0}")]
    SpawnFailure(String),

    /// No output within the per-read wait; recoverable
    #[error("No output for {0:?}")]
    ReadTimeout(Duration),

    #[error("Command exceeded its {0}s timeout")]
    ProcessTimeout(u64),

    #[error("Process exited on signal {0}")]
    SignalTermination(i32),

    /// Timed lock acquisition failed; caller may retry
    #[error("Task registry unavailable (lock not acquired within {0:?})")]
    LockUnavailable(Duration),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Task '{0}' not found")]
    UnknownTask(String),
}

impl ShellError {
    /// Map a spawn error onto the launcher's three kinds.
    pub fn from_spawn(err: io::Error, command: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ShellError::NotFound(format!("{command}: {err}")),
            io::ErrorKind::PermissionDenied => {
                ShellError::PermissionDenied(format!("{command}: {err}"))
            }
            _ => ShellError::SpawnFailure(format!("{command}: {err}")),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ShellError::ReadTimeout(_) | ShellError::LockUnavailable(_) | ShellError::PersistenceFailure(_)
        )
    }
}

impl From<serde_json::Error> for ShellError {
    fn from(e: serde_json::Error) -> Self {
        ShellError::PersistenceFailure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_errors_map_to_distinct_kinds() {
        let nf = ShellError::from_spawn(io::Error::from(io::ErrorKind::NotFound), "x");
        let pd = ShellError::from_spawn(io::Error::from(io::ErrorKind::PermissionDenied), "x");
        let other = ShellError::from_spawn(io::Error::from(io::ErrorKind::WouldBlock), "x");
        assert!(matches!(nf, ShellError::NotFound(_)));
        assert!(matches!(pd, ShellError::PermissionDenied(_)));
        assert!(matches!(other, ShellError::SpawnFailure(_)));
    }

    #[test]
    fn only_counted_errors_are_recoverable() {
        assert!(ShellError::ReadTimeout(Duration::from_secs(1)).is_recoverable());
        assert!(ShellError::LockUnavailable(Duration::from_secs(5)).is_recoverable());
        assert!(!ShellError::ProcessTimeout(1).is_recoverable());
        assert!(!ShellError::SignalTermination(9).is_recoverable());
    }
}
