use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::{error, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::manager::store::TaskStore;
use crate::models::config::Config;
use crate::models::error::{Result, ShellError};
use crate::models::message::ControlMessage;
use crate::models::task::{Outcome, Task, TaskId, TaskStatus, TaskSummary};

struct Entry {
    task: Task,
    /// Present while a worker owns the task's process.
    control: Option<Sender<ControlMessage>>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Entry>,
    /// Ids evicted from memory, with their end time; reserved until the
    /// store would have pruned the record too.
    retired: HashMap<TaskId, DateTime<Utc>>,
}

/// In-memory task table behind one timed lock, writing status changes
/// through to the store.
pub struct Registry {
    inner: Mutex<Inner>,
    lock_timeout: Duration,
    lock_retries: u32,
    max_output_lines: usize,
    memory_retention: Duration,
    disk_retention: Duration,
    store: Option<Arc<TaskStore>>,
}

impl Registry {
    pub fn new(config: &Config, store: Option<Arc<TaskStore>>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lock_timeout: config.lock_timeout,
            lock_retries: config.lock_retries,
            max_output_lines: config.max_output_lines,
            memory_retention: config.memory_retention,
            disk_retention: config.disk_retention,
            store,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .try_lock_for(self.lock_timeout)
            .ok_or(ShellError::LockUnavailable(self.lock_timeout))
    }

    /// Worker-side writes retry before giving up.
    fn lock_with_retry(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut attempt = 0;
        loop {
            match self.lock() {
                Ok(guard) => return Ok(guard),
                Err(e) if attempt >= self.lock_retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    warn!("{} (attempt {}/{})", e, attempt, self.lock_retries);
                }
            }
        }
    }

    /// Copy the changed records, release the lock, then write them through.
    fn persist(&self, guard: MutexGuard<'_, Inner>, task_ids: &[&str]) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let snapshot: Vec<Task> = task_ids
            .iter()
            .filter_map(|id| guard.tasks.get(*id))
            .map(|entry| entry.task.clone())
            .collect();
        drop(guard);
        if let Err(e) = store.merge(snapshot) {
            error!("{}", e);
        }
    }

    /// Register a freshly submitted task, failing if the id is taken.
    pub fn insert(&self, task: Task, control: Sender<ControlMessage>) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.tasks.contains_key(&task.task_id) || inner.retired.contains_key(&task.task_id) {
            return Ok(false);
        }
        info!("Task '{}' created: {}", task.task_id, task.command);
        let task_id = task.task_id.clone();
        inner.tasks.insert(
            task_id.clone(),
            Entry {
                task,
                control: Some(control),
            },
        );
        self.persist(inner, &[&task_id]);
        Ok(true)
    }

    pub fn mark_running(&self, task_id: &str, pid: u32) -> Result<()> {
        let mut inner = self.lock_with_retry()?;
        let entry = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ShellError::UnknownTask(task_id.to_string()))?;
        if !entry.task.status.can_transition_to(TaskStatus::Running) {
            warn!("Task '{}' cannot start from {}", task_id, entry.task.status);
            return Ok(());
        }
        entry.task.status = TaskStatus::Running;
        entry.task.start_time = Some(Utc::now());
        entry.task.pid = Some(pid);
        entry.task.revision += 1;
        info!("Task '{}' running as pid {}", task_id, pid);
        self.persist(inner, &[task_id]);
        Ok(())
    }

    /// Move `lines` into the task's output and write the record through, so
    /// the store holds them by the time this returns. On lock failure the
    /// lines stay in the caller's buffer for the next attempt.
    pub fn append_output(&self, task_id: &str, lines: &mut Vec<String>, error_count: u32) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(entry) = inner.tasks.get_mut(task_id) else {
            lines.clear();
            return Ok(());
        };
        self.push_lines(&mut entry.task, lines);
        lines.clear();
        entry.task.error_count = error_count;
        entry.task.revision += 1;
        self.persist(inner, &[task_id]);
        Ok(())
    }

    fn push_lines(&self, task: &mut Task, lines: &mut Vec<String>) {
        if task.status.is_terminal() {
            return;
        }
        let room = self.max_output_lines.saturating_sub(task.output_lines.len());
        if lines.len() > room {
            task.truncated = true;
        }
        task.output_lines.extend(lines.drain(..).take(room));
    }

    /// Record the terminal state. A task that is already terminal keeps its
    /// status, which is returned.
    pub fn finish(&self, task_id: &str, outcome: Outcome, lines: &mut Vec<String>) -> Result<TaskStatus> {
        let mut inner = self.lock_with_retry()?;
        let entry = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ShellError::UnknownTask(task_id.to_string()))?;
        let task = &mut entry.task;
        if task.status.is_terminal() {
            return Ok(task.status);
        }
        if !task.status.can_transition_to(outcome.status) {
            warn!("Rejected transition {} -> {} for '{}'", task.status, outcome.status, task_id);
            return Ok(task.status);
        }

        self.push_lines(task, lines);
        task.status = outcome.status;
        task.exit_code = outcome.exit_code;
        task.reason = outcome.reason;
        task.end_time = Some(Utc::now());
        task.pid = None;
        task.revision += 1;
        entry.control = None;
        let status = task.status;
        info!("Task '{}' {}", task_id, status);
        self.persist(inner, &[task_id]);
        Ok(status)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.lock()?.tasks.get(task_id).map(|entry| entry.task.clone()))
    }

    /// Current status and, while a worker is attached, its control channel.
    pub fn control(&self, task_id: &str) -> Result<Option<(TaskStatus, Option<Sender<ControlMessage>>)>> {
        Ok(self
            .lock()?
            .tasks
            .get(task_id)
            .map(|entry| (entry.task.status, entry.control.clone())))
    }

    pub fn list(&self) -> Result<Vec<TaskSummary>> {
        let mut summaries: Vec<_> = self.lock()?.tasks.values().map(|entry| entry.task.summary()).collect();
        summaries.sort_by_key(|summary| summary.created_at);
        Ok(summaries)
    }

    /// Evict terminal tasks past the memory retention window, and release
    /// reserved ids whose records are past the disk retention window.
    pub fn prune(&self) -> Result<usize> {
        let (Ok(memory), Ok(disk)) = (
            chrono::Duration::from_std(self.memory_retention),
            chrono::Duration::from_std(self.disk_retention),
        ) else {
            return Ok(0);
        };
        let now = Utc::now();
        let (memory_cutoff, disk_cutoff) = (now - memory, now - disk);
        let mut inner = self.lock()?;
        inner.retired.retain(|_, ended| *ended >= disk_cutoff);

        let expired: Vec<(TaskId, DateTime<Utc>)> = inner
            .tasks
            .values()
            .filter(|entry| entry.task.status.is_terminal())
            .filter_map(|entry| entry.task.end_time.map(|end| (entry.task.task_id.clone(), end)))
            .filter(|(_, end)| *end < memory_cutoff)
            .collect();
        for (task_id, ended) in &expired {
            inner.tasks.remove(task_id);
            if *ended >= disk_cutoff {
                inner.retired.insert(task_id.clone(), *ended);
            }
            info!("Evicted task '{}' from memory", task_id);
        }
        Ok(expired.len())
    }

    /// Load records recovered from disk. Anything that was not terminal has
    /// lost its process and becomes `lost`.
    pub fn restore(&self, records: Vec<Task>) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut lost = Vec::new();
        for mut task in records {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Lost;
                task.end_time = Some(Utc::now());
                task.reason = Some("process handle lost across restart".to_string());
                task.pid = None;
                task.revision += 1;
                lost.push(task.task_id.clone());
            }
            inner.tasks.insert(task.task_id.clone(), Entry { task, control: None });
        }
        if !lost.is_empty() {
            warn!("Marked {} interrupted task(s) as lost", lost.len());
            let ids: Vec<&str> = lost.iter().map(String::as_str).collect();
            self.persist(inner, &ids);
        }
        Ok(lost.len())
    }
}
