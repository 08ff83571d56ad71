//! Durable mirror of the task registry.
//!
//! One JSON document holds every retained record keyed by task id. Writers
//! merge their snapshot into it per record (higher `revision` wins), so an
//! older snapshot flushed late can never roll a record back, and records the
//! registry already evicted survive until the disk retention expires.
//!
//! Writes go to a side file, are fsynced, and renamed over the live file while
//! an advisory exclusive lock is held on a sibling `.lock` file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::models::error::{Result, ShellError};
use crate::models::task::{Task, TaskId};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    tasks: BTreeMap<TaskId, Task>,
}

pub struct TaskStore {
    path: PathBuf,
    lock_path: PathBuf,
    retention: Duration,
    lock_timeout: Duration,
    write_lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(path: PathBuf, retention: Duration, lock_timeout: Duration) -> Self {
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            retention,
            lock_timeout,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every retained record. A missing, corrupt or unreadable store yields
    /// an empty list.
    pub fn load(&self) -> Vec<Task> {
        let read = FileLock::acquire(&self.lock_path, false, self.lock_timeout)
            .and_then(|_lock| self.read_file());
        match read {
            Ok(file) => file.tasks.into_values().collect(),
            Err(e) => {
                warn!("Ignoring task store {}: {}", self.path.display(), e);
                vec![]
            }
        }
    }

    pub fn find(&self, task_id: &str) -> Option<Task> {
        self.load().into_iter().find(|task| task.task_id == task_id)
    }

    /// Merge `snapshot` into the durable file.
    pub fn merge(&self, snapshot: Vec<Task>) -> Result<()> {
        let _guard = self.write_lock.lock();
        let _lock = FileLock::acquire(&self.lock_path, true, self.lock_timeout)?;

        let mut file = self.read_file().unwrap_or_else(|e| {
            warn!("Rewriting unreadable task store {}: {}", self.path.display(), e);
            StoreFile::default()
        });
        // Expired records go first so a reused id is never compared against one.
        self.prune(&mut file);
        for task in snapshot {
            let newer = file
                .tasks
                .get(&task.task_id)
                .map_or(true, |stored| task.revision >= stored.revision);
            if newer {
                file.tasks.insert(task.task_id.clone(), task);
            }
        }
        self.prune(&mut file);
        file.version = FORMAT_VERSION;
        self.write_atomic(&file)
    }

    fn prune(&self, file: &mut StoreFile) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;
        file.tasks.retain(|_, task| {
            !task.status.is_terminal() || task.end_time.unwrap_or(task.created_at) >= cutoff
        });
    }

    fn read_file(&self) -> Result<StoreFile> {
        if !self.path.exists() {
            return Ok(StoreFile::default());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| ShellError::PersistenceFailure(format!("read {}: {}", self.path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(StoreFile::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_atomic(&self, file: &StoreFile) -> Result<()> {
        let json = serde_json::to_string_pretty(file)?;
        let tmp_path = self.temp_path();
        let io = |e: std::io::Error| ShellError::PersistenceFailure(format!("write {}: {}", tmp_path.display(), e));

        let mut tmp = File::create(&tmp_path).map_err(io)?;
        tmp.write_all(json.as_bytes()).map_err(io)?;
        tmp.sync_all().map_err(io)?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)
            .map_err(|e| ShellError::PersistenceFailure(format!("publish {}: {}", self.path.display(), e)))?;
        debug!("Wrote {} task record(s) to {}", file.tasks.len(), self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tasks".to_string());
        self.path.with_file_name(format!("{name}.tmp"))
    }
}

/// Advisory lock on the sibling lock file, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, exclusive: bool, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ShellError::PersistenceFailure(format!("open {}: {}", path.display(), e)))?;

        let deadline = Instant::now() + timeout;
        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => return Ok(Self { file }),
                Err(e) if Instant::now() >= deadline => {
                    return Err(ShellError::PersistenceFailure(format!(
                        "lock {} not acquired within {:?}: {}",
                        path.display(),
                        timeout,
                        e
                    )))
                }
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
