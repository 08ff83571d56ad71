use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};
use log::{error, info, warn};
use uuid::Uuid;

use crate::manager::classifier::{classify, Classification};
use crate::manager::registry::Registry;
use crate::manager::store::TaskStore;
use crate::models::config::Config;
use crate::models::error::{Result, ShellError};
use crate::models::message::ControlMessage;
use crate::models::task::{
    ExecMode, ExecutionResult, Outcome, StatusReport, Task, TaskId, TaskStatus, TaskSummary,
};
use crate::worker::collector::{Emitter, ProgressSink};
use crate::worker::terminator::{GroupSignaller, Terminator};
use crate::worker::worker::{run_task, spawn_worker_thread, Job, WorkerContext};

const ID_ATTEMPTS: usize = 16;

#[derive(Default)]
pub struct SubmitOptions {
    pub timeout: Option<Duration>,
    /// Tag carried on progress notifications; defaults to the task id.
    pub correlation_id: Option<String>,
    pub progress: Option<Box<dyn ProgressSink>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Finished(ExecutionResult),
    Started { task_id: TaskId, warning: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateResult {
    /// The worker stopped the task (or it finished first) and reported this.
    Stopped(TaskStatus),
    AlreadyTerminal(TaskStatus),
    /// No confirmation within the wait; the stop request is still queued.
    Requested(TaskStatus),
}

impl TerminateResult {
    pub fn status(self) -> TaskStatus {
        match self {
            TerminateResult::Stopped(s) | TerminateResult::AlreadyTerminal(s) | TerminateResult::Requested(s) => s,
        }
    }
}

pub struct TaskManager {
    ctx: WorkerContext,
    store: Arc<TaskStore>,
}

impl TaskManager {
    /// Load the durable store, recover interrupted tasks, and get ready for
    /// submissions.
    pub fn open(config: Config) -> Result<Self> {
        Self::with_terminator(config, Arc::new(GroupSignaller))
    }

    pub fn with_terminator(config: Config, terminator: Arc<dyn Terminator>) -> Result<Self> {
        let store = Arc::new(TaskStore::new(
            config.store_path(),
            config.disk_retention,
            config.lock_timeout,
        ));
        let registry = Arc::new(Registry::new(&config, Some(Arc::clone(&store))));
        let records = store.load();
        let loaded = records.len();
        let lost = registry.restore(records)?;
        info!(
            "Loaded {} task record(s) from {} ({} lost)",
            loaded,
            store.path().display(),
            lost
        );

        Ok(TaskManager {
            ctx: WorkerContext {
                registry,
                config: Arc::new(config),
                terminator,
            },
            store,
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn submit(&self, command: &str, mode: ExecMode, options: SubmitOptions) -> Result<Submission> {
        let warning = match classify(command) {
            Classification::Clear => None,
            flagged => {
                let warning = flagged.warning(command);
                if let Some(text) = &warning {
                    warn!("{}", text);
                }
                warning
            }
        };
        if mode == ExecMode::Background {
            if let Err(e) = self.ctx.registry.prune() {
                warn!("Skipping retention sweep: {}", e);
            }
        }

        let config = &self.ctx.config;
        let timeout = options.timeout.unwrap_or_else(|| config.timeout_for(mode));
        let (control_tx, control_rx) = unbounded();
        let task_id = self.register(command, mode, timeout, control_tx)?;

        let job = Job {
            task_id: task_id.clone(),
            command: command.to_string(),
            timeout,
            max_errors: config.max_errors_for(mode),
            count_stalls: mode == ExecMode::Stream,
            control: control_rx,
            emitter: Emitter::new(
                options.correlation_id.unwrap_or_else(|| task_id.clone()),
                options.progress,
                config.progress_line_cap,
            ),
        };

        if mode == ExecMode::Background {
            if let Err(e) = spawn_worker_thread(self.ctx.clone(), job) {
                error!("Failed to start worker for '{}': {}", task_id, e);
                let err = ShellError::SpawnFailure(e.to_string());
                let outcome = Outcome {
                    status: TaskStatus::Failed,
                    exit_code: None,
                    reason: Some(err.to_string()),
                };
                self.ctx.registry.finish(&task_id, outcome, &mut vec![])?;
                return Err(err);
            }
            info!("Background task '{}' started", task_id);
            return Ok(Submission::Started { task_id, warning });
        }

        let done = run_task(&self.ctx, job);
        Ok(Submission::Finished(ExecutionResult {
            task_id,
            status: done.status,
            exit_code: done.exit_code,
            output: done.output,
            reason: done.reason,
            warning,
        }))
    }

    fn register(
        &self,
        command: &str,
        mode: ExecMode,
        timeout: Duration,
        control: crossbeam_channel::Sender<ControlMessage>,
    ) -> Result<TaskId> {
        for _ in 0..ID_ATTEMPTS {
            let task_id = new_task_id();
            let task = Task::new(task_id.clone(), command.to_string(), timeout.as_secs(), mode);
            if self.ctx.registry.insert(task, control.clone())? {
                return Ok(task_id);
            }
        }
        Err(ShellError::SpawnFailure("could not allocate a unique task id".to_string()))
    }

    /// Memory first, then the durable store for evicted tasks.
    fn lookup(&self, task_id: &str) -> Result<Task> {
        if let Some(task) = self.ctx.registry.get(task_id)? {
            return Ok(task);
        }
        self.store
            .find(task_id)
            .ok_or_else(|| ShellError::UnknownTask(task_id.to_string()))
    }

    pub fn status(&self, task_id: &str) -> Result<StatusReport> {
        Ok(self.lookup(task_id)?.report())
    }

    /// Captured lines in order; with `max_lines`, only the last that many.
    pub fn output(&self, task_id: &str, max_lines: Option<usize>) -> Result<Vec<String>> {
        let mut lines = self.lookup(task_id)?.output_lines;
        if let Some(max) = max_lines {
            let skip = lines.len().saturating_sub(max);
            lines.drain(..skip);
        }
        Ok(lines)
    }

    pub fn terminate(&self, task_id: &str) -> Result<TerminateResult> {
        let Some((status, control)) = self.ctx.registry.control(task_id)? else {
            return self
                .store
                .find(task_id)
                .map(|task| TerminateResult::AlreadyTerminal(task.status))
                .ok_or_else(|| ShellError::UnknownTask(task_id.to_string()));
        };
        if status.is_terminal() {
            return Ok(TerminateResult::AlreadyTerminal(status));
        }
        let Some(control) = control else {
            return Ok(TerminateResult::Requested(status));
        };

        info!("Terminating task '{}'", task_id);
        let (reply_tx, reply_rx) = bounded(1);
        if control.send(ControlMessage::Terminate(reply_tx)).is_ok() {
            if let Ok(status) = reply_rx.recv_timeout(self.terminate_wait()) {
                return Ok(TerminateResult::Stopped(status));
            }
        }

        // The worker finished between our lookup and the send, or is slow.
        let status = self.lookup(task_id)?.status;
        if status.is_terminal() {
            Ok(TerminateResult::Stopped(status))
        } else {
            warn!("Task '{}' has not confirmed the stop yet", task_id);
            Ok(TerminateResult::Requested(status))
        }
    }

    fn terminate_wait(&self) -> Duration {
        let config = &self.ctx.config;
        config.terminate_wait() + config.lock_timeout * (config.lock_retries + 1)
    }

    pub fn list(&self) -> Result<Vec<TaskSummary>> {
        if let Err(e) = self.ctx.registry.prune() {
            warn!("Skipping retention sweep: {}", e);
        }
        self.ctx.registry.list()
    }
}

fn new_task_id() -> TaskId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
