use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Sync,
    Stream,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Timeout,
    Lost,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Edges of the task state graph. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            // spawn failure, or a record recovered from disk
            (Pending, Failed) | (Pending, Lost) => true,
            (Running, Completed | Failed | Terminated | Timeout | Lost) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Terminated => "terminated",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Lost => "lost",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A tracked command execution. This is also the persisted record shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub command: String,
    /// Wall-clock budget in seconds.
    pub timeout: u64,
    pub mode: ExecMode,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output_lines: Vec<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(skip)]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revision: u64,
}

impl Task {
    pub fn new(task_id: TaskId, command: String, timeout: u64, mode: ExecMode) -> Self {
        Self {
            task_id,
            command,
            timeout,
            mode,
            status: TaskStatus::Pending,
            start_time: None,
            end_time: None,
            exit_code: None,
            output_lines: vec![],
            truncated: false,
            error_count: 0,
            reason: None,
            pid: None,
            created_at: Utc::now(),
            revision: 0,
        }
    }

    /// Seconds between start and end (or now, while running).
    pub fn elapsed_secs(&self) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id.clone(),
            command: self.command.clone(),
            status: self.status,
            pid: self.pid,
            elapsed_secs: self.elapsed_secs(),
            created_at: self.created_at,
        }
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            task_id: self.task_id.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            exit_code: self.exit_code,
            reason: self.reason.clone(),
            elapsed_secs: self.elapsed_secs(),
        }
    }
}

/// Final classification handed from a worker to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub elapsed_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub command: String,
    pub status: TaskStatus,
    /// Set only while a worker owns the process.
    pub pid: Option<u32>,
    pub elapsed_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Result of a sync or streamed run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub reason: Option<String>,
    pub warning: Option<String>,
}

impl ExecutionResult {
    pub fn combined_output(&self) -> String {
        self.output.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Terminated,
        TaskStatus::Timeout,
        TaskStatus::Lost,
    ];

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in ALL.iter().copied().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn running_reaches_every_terminal_state() {
        for to in ALL.iter().copied().filter(|s| s.is_terminal()) {
            assert!(TaskStatus::Running.can_transition_to(to));
        }
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn pending_cannot_skip_to_completed() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Timeout));
    }

    #[test]
    fn record_serializes_with_camel_case_fields() {
        let task = Task::new("abc".into(), "echo hi".into(), 10, ExecMode::Background);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["taskId"], "abc");
        assert_eq!(json["status"], "pending");
        assert!(json.get("outputLines").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("pid").is_none());
    }
}
