use std::path::{Path, PathBuf};
use std::time::Duration;

use super::task::ExecMode;

pub const STORE_FILE: &str = ".mcp_background_tasks.json";

/// Runtime knobs. Defaults mirror what the server ships with; tests shrink
/// the windows.
#[derive(Debug, Clone)]
pub struct Config {
    pub safe_root: PathBuf,
    pub default_timeout: Duration,
    pub stream_timeout: Duration,
    pub background_timeout: Duration,
    /// Longest a single read may stall before it counts as an error.
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub grace_period: Duration,
    pub kill_wait: Duration,
    pub lock_timeout: Duration,
    pub lock_retries: u32,
    pub max_stream_errors: u32,
    pub max_background_errors: u32,
    pub memory_retention: Duration,
    pub disk_retention: Duration,
    pub max_output_lines: usize,
    pub progress_line_cap: usize,
    pub store_file: String,
}

impl Config {
    pub fn new(safe_root: impl Into<PathBuf>) -> Self {
        Self {
            safe_root: safe_root.into(),
            default_timeout: Duration::from_secs(3600),
            stream_timeout: Duration::from_secs(300),
            background_timeout: Duration::from_secs(3600),
            read_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(2),
            grace_period: Duration::from_secs(5),
            kill_wait: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(5),
            lock_retries: 3,
            max_stream_errors: 10,
            max_background_errors: 5,
            memory_retention: Duration::from_secs(3600),
            disk_retention: Duration::from_secs(24 * 3600),
            max_output_lines: 10_000,
            progress_line_cap: 100,
            store_file: STORE_FILE.to_string(),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.safe_root.join(&self.store_file)
    }

    pub fn working_dir(&self) -> &Path {
        &self.safe_root
    }

    pub fn timeout_for(&self, mode: ExecMode) -> Duration {
        match mode {
            ExecMode::Sync => self.default_timeout,
            ExecMode::Stream => self.stream_timeout,
            ExecMode::Background => self.background_timeout,
        }
    }

    pub fn max_errors_for(&self, mode: ExecMode) -> u32 {
        match mode {
            ExecMode::Background => self.max_background_errors,
            ExecMode::Sync | ExecMode::Stream => self.max_stream_errors,
        }
    }

    /// Upper bound on how long a terminate caller waits for the worker.
    pub fn terminate_wait(&self) -> Duration {
        self.grace_period + self.kill_wait + Duration::from_secs(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_limits_depend_on_mode() {
        let config = Config::new("/tmp");
        assert_eq!(config.max_errors_for(ExecMode::Background), 5);
        assert_eq!(config.max_errors_for(ExecMode::Stream), 10);
        assert_eq!(config.timeout_for(ExecMode::Stream), Duration::from_secs(300));
        assert_eq!(config.store_path(), PathBuf::from("/tmp").join(STORE_FILE));
    }
}
