//! Persistence interface for the coordinator
//!
//! The coordinator saves on every transition and loads everything at startup.
//! [`crate::db::Database`] is the durable implementation; [`MemoryStorage`]
//! backs tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{DbError, Result};
use crate::rate_limiter::RateLimitState;
use crate::types::{ContentItem, MetricSnapshot, Task, TaskState};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace a task
    ///
    /// A stored `cancelled` row is never overwritten: the write is skipped and
    /// `false` returned, so a cancellation made by another process wins over
    /// this process's older view of the task.
    async fn save_task(&self, task: &Task) -> Result<bool>;

    /// Cancel a stored task, but only while it is still `pending` or `ready`
    ///
    /// Returns `false` when the task is missing or has moved on.
    async fn cancel_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Every stored task, in insertion order
    async fn load_tasks(&self) -> Result<Vec<Task>>;

    /// Tasks that are not in a terminal state, in insertion order
    async fn load_open_tasks(&self) -> Result<Vec<Task>> {
        Ok(self
            .load_tasks()
            .await?
            .into_iter()
            .filter(|t| !t.state.is_terminal())
            .collect())
    }

    async fn save_content(&self, item: &ContentItem) -> Result<()>;

    async fn load_content(&self) -> Result<Vec<ContentItem>>;

    async fn append_snapshot(&self, snapshot: &MetricSnapshot) -> Result<()>;

    async fn load_snapshots(&self) -> Result<Vec<MetricSnapshot>>;

    async fn save_rate_limit(&self, platform: &str, state: &RateLimitState) -> Result<()>;

    async fn load_rate_limits(&self) -> Result<Vec<(String, RateLimitState)>>;
}

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<String, Task>,
    content: HashMap<String, ContentItem>,
    snapshots: Vec<MetricSnapshot>,
    rate_limits: HashMap<String, RateLimitState>,
    fail_writes: bool,
}

/// Process-local storage; clones share the same data
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, to exercise storage outages
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Number of stored tasks in `state`
    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.state == state)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        let inner = self.lock();
        if inner.fail_writes {
            return Err(DbError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "storage unavailable",
            ))
            .into());
        }
        Ok(inner)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_task(&self, task: &Task) -> Result<bool> {
        let mut inner = self.write()?;
        if let Some(stored) = inner.tasks.get(&task.id) {
            if stored.state == TaskState::Cancelled {
                return Ok(false);
            }
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(true)
    }

    async fn cancel_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.tasks.get_mut(task_id) {
            Some(task) if matches!(task.state, TaskState::Pending | TaskState::Ready) => {
                task.state = TaskState::Cancelled;
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.sequence);
        Ok(tasks)
    }

    async fn save_content(&self, item: &ContentItem) -> Result<()> {
        self.write()?.content.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn load_content(&self) -> Result<Vec<ContentItem>> {
        let mut items: Vec<ContentItem> = self.lock().content.values().cloned().collect();
        items.sort_by_key(|c| c.created_at);
        Ok(items)
    }

    async fn append_snapshot(&self, snapshot: &MetricSnapshot) -> Result<()> {
        self.write()?.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn load_snapshots(&self) -> Result<Vec<MetricSnapshot>> {
        Ok(self.lock().snapshots.clone())
    }

    async fn save_rate_limit(&self, platform: &str, state: &RateLimitState) -> Result<()> {
        self.write()?
            .rate_limits
            .insert(platform.to_string(), *state);
        Ok(())
    }

    async fn load_rate_limits(&self) -> Result<Vec<(String, RateLimitState)>> {
        Ok(self
            .lock()
            .rate_limits
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }
}
