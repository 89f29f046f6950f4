//! Content calendar: the coordinator-owned store of tasks, content and metrics
//!
//! The calendar is plain data with no locking of its own. The coordinator
//! holds it behind a single lock and is the only writer; every state change
//! goes through [`Calendar::transition`] so the task lifecycle can only move
//! along the edges `TaskState::can_transition_to` allows.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::{Result, TeamcastError};
use crate::types::{ContentItem, MetricSnapshot, Task, TaskFailure, TaskId, TaskState};

#[derive(Debug, Default)]
pub struct Calendar {
    tasks: HashMap<TaskId, Task>,
    content: HashMap<String, ContentItem>,
    /// Per content item, ordered by `collected_at`
    snapshots: HashMap<String, Vec<MetricSnapshot>>,
    next_sequence: u64,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a calendar from persisted rows
    pub fn from_parts(
        tasks: Vec<Task>,
        content: Vec<ContentItem>,
        snapshots: Vec<MetricSnapshot>,
    ) -> Self {
        let mut calendar = Self::new();
        for task in tasks {
            calendar.next_sequence = calendar.next_sequence.max(task.sequence + 1);
            calendar.tasks.insert(task.id.clone(), task);
        }
        for item in content {
            calendar.content.insert(item.id.clone(), item);
        }
        for snapshot in snapshots {
            calendar.append_snapshot(snapshot);
        }
        calendar
    }

    /// Reserve the next insertion-order number
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(TeamcastError::Validation(format!(
                "task {} already exists",
                task.id
            )));
        }
        self.next_sequence = self.next_sequence.max(task.sequence + 1);
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Move a task along one edge of the lifecycle
    ///
    /// Returns the state the task left.
    pub fn transition(&mut self, id: &str, to: TaskState, now: DateTime<Utc>) -> Result<TaskState> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TeamcastError::TaskNotFound(id.to_string()))?;
        let from = task.state;
        if !from.can_transition_to(to) {
            return Err(TeamcastError::InvalidTransition {
                task_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        task.state = to;
        task.updated_at = now;
        Ok(from)
    }

    /// Claim a ready task for execution, counting the attempt
    pub fn claim(&mut self, id: &str, now: DateTime<Utc>) -> Result<Task> {
        self.transition(id, TaskState::InFlight, now)?;
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TeamcastError::TaskNotFound(id.to_string()))?;
        task.attempt_count += 1;
        Ok(task.clone())
    }

    /// Take on a cancellation another process already stored
    ///
    /// Unlike [`Calendar::transition`] this also accepts a task whose claim
    /// was never saved: that claim is undone, attempt included, since the
    /// worker never saw it. Returns the state the task left.
    pub fn adopt_cancellation(&mut self, id: &str, now: DateTime<Utc>) -> Result<TaskState> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TeamcastError::TaskNotFound(id.to_string()))?;
        let from = task.state;
        match from {
            TaskState::Pending | TaskState::Ready => {}
            TaskState::InFlight => task.attempt_count = task.attempt_count.saturating_sub(1),
            _ => {
                return Err(TeamcastError::InvalidTransition {
                    task_id: id.to_string(),
                    from: from.to_string(),
                    to: TaskState::Cancelled.to_string(),
                })
            }
        }
        task.state = TaskState::Cancelled;
        task.updated_at = now;
        Ok(from)
    }

    pub fn record_failure(&mut self, id: &str, failure: TaskFailure) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TeamcastError::TaskNotFound(id.to_string()))?;
        task.last_error = Some(failure);
        Ok(())
    }

    /// Return a `failed_retryable` task to `pending`, due at `at`
    pub fn reschedule(&mut self, id: &str, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        self.transition(id, TaskState::Pending, now)?;
        if let Some(task) = self.tasks.get_mut(id) {
            task.scheduled_at = at;
        }
        Ok(())
    }

    /// Promote every pending task whose time has come; returns their ids
    pub fn promote_due(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut due: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending && t.scheduled_at <= now)
            .collect();
        due.sort_by(|a, b| dispatch_order(a, b));
        let ids: Vec<TaskId> = due.into_iter().map(|t| t.id.clone()).collect();

        for id in &ids {
            if let Some(task) = self.tasks.get_mut(id) {
                task.state = TaskState::Ready;
                task.updated_at = now;
            }
        }
        ids
    }

    /// Ready tasks in dispatch order: `(scheduled_at, platform, sequence)`
    pub fn ready_queue(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Ready)
            .collect();
        ready.sort_by(|a, b| dispatch_order(a, b));
        ready
    }

    /// Earliest `scheduled_at` among pending tasks
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| t.scheduled_at)
            .min()
    }

    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state == state).count()
    }

    pub fn insert_content(&mut self, item: ContentItem) {
        self.content.insert(item.id.clone(), item);
    }

    pub fn content(&self, id: &str) -> Option<&ContentItem> {
        self.content.get(id)
    }

    pub fn content_mut(&mut self, id: &str) -> Option<&mut ContentItem> {
        self.content.get_mut(id)
    }

    pub fn content_items(&self) -> impl Iterator<Item = &ContentItem> {
        self.content.values()
    }

    /// Add a snapshot, keeping each item's series ordered by `collected_at`
    pub fn append_snapshot(&mut self, snapshot: MetricSnapshot) {
        let series = self.snapshots.entry(snapshot.content_id.clone()).or_default();
        let pos = series.partition_point(|s| s.collected_at <= snapshot.collected_at);
        series.insert(pos, snapshot);
    }

    pub fn snapshots_for(&self, content_id: &str) -> &[MetricSnapshot] {
        self.snapshots
            .get(content_id)
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &MetricSnapshot> {
        self.snapshots.values().flatten()
    }
}

fn dispatch_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    a.scheduled_at
        .cmp(&b.scheduled_at)
        .then_with(|| a.platform.cmp(&b.platform))
        .then_with(|| a.sequence.cmp(&b.sequence))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::types::{ContentRequest, ContentType, EngagementCounters};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn add(calendar: &mut Calendar, platform: &str, at: DateTime<Utc>) -> TaskId {
        let sequence = calendar.next_sequence();
        let task = Task::new(
            platform.to_string(),
            ContentRequest::generate("spring sale", ContentType::Text),
            at,
            t0(),
            sequence,
        );
        let id = task.id.clone();
        calendar.insert(task).unwrap();
        id
    }

    #[test]
    fn test_promote_only_due_tasks() {
        let mut calendar = Calendar::new();
        let due = add(&mut calendar, "facebook", t0());
        let later = add(&mut calendar, "facebook", t0() + Duration::minutes(5));

        let promoted = calendar.promote_due(t0());
        assert_eq!(promoted, vec![due.clone()]);
        assert_eq!(calendar.task(&due).unwrap().state, TaskState::Ready);
        assert_eq!(calendar.task(&later).unwrap().state, TaskState::Pending);
        assert_eq!(calendar.next_due(), Some(t0() + Duration::minutes(5)));
    }

    #[test]
    fn test_ready_queue_order() {
        let mut calendar = Calendar::new();
        let tw_first = add(&mut calendar, "twitter", t0());
        let fb_second = add(&mut calendar, "facebook", t0());
        let fb_third = add(&mut calendar, "facebook", t0());
        let earliest = add(&mut calendar, "tiktok", t0() - Duration::seconds(1));
        calendar.promote_due(t0());

        let order: Vec<&str> = calendar.ready_queue().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            order,
            vec![
                earliest.as_str(),
                fb_second.as_str(),
                fb_third.as_str(),
                tw_first.as_str()
            ]
        );
    }

    #[test]
    fn test_claim_counts_attempt() {
        let mut calendar = Calendar::new();
        let id = add(&mut calendar, "instagram", t0());
        calendar.promote_due(t0());

        let claimed = calendar.claim(&id, t0()).unwrap();
        assert_eq!(claimed.state, TaskState::InFlight);
        assert_eq!(claimed.attempt_count, 1);

        // already in flight: a second claim is rejected
        let err = calendar.claim(&id, t0()).unwrap_err();
        assert!(matches!(err, TeamcastError::InvalidTransition { .. }));
        assert_eq!(calendar.task(&id).unwrap().attempt_count, 1);
    }

    #[test]
    fn test_adopting_cancellation_undoes_unsaved_claim() {
        let mut calendar = Calendar::new();
        let id = add(&mut calendar, "facebook", t0());
        calendar.promote_due(t0());
        calendar.claim(&id, t0()).unwrap();

        let from = calendar.adopt_cancellation(&id, t0()).unwrap();
        assert_eq!(from, TaskState::InFlight);
        let task = calendar.task(&id).unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(task.attempt_count, 0);

        let err = calendar.adopt_cancellation(&id, t0()).unwrap_err();
        assert!(matches!(err, TeamcastError::InvalidTransition { .. }));
    }

    #[test]
    fn test_retry_cycle_returns_to_pending() {
        let mut calendar = Calendar::new();
        let id = add(&mut calendar, "twitter", t0());
        calendar.promote_due(t0());
        calendar.claim(&id, t0()).unwrap();
        calendar
            .transition(&id, TaskState::FailedRetryable, t0())
            .unwrap();
        calendar
            .record_failure(
                &id,
                TaskFailure {
                    class: ErrorClass::Transient,
                    message: "timeout".to_string(),
                },
            )
            .unwrap();
        calendar
            .reschedule(&id, t0() + Duration::seconds(1), t0())
            .unwrap();

        let task = calendar.task(&id).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.scheduled_at, t0() + Duration::seconds(1));
        assert_eq!(task.attempt_count, 1);
        assert!(task.last_error.is_some());
    }

    #[test]
    fn test_unknown_task() {
        let mut calendar = Calendar::new();
        let err = calendar
            .transition("missing", TaskState::Ready, t0())
            .unwrap_err();
        assert!(matches!(err, TeamcastError::TaskNotFound(_)));
    }

    #[test]
    fn test_from_parts_continues_sequence() {
        let mut calendar = Calendar::new();
        add(&mut calendar, "facebook", t0());
        add(&mut calendar, "facebook", t0());
        let tasks: Vec<Task> = calendar.tasks().cloned().collect();

        let mut restored = Calendar::from_parts(tasks, vec![], vec![]);
        assert_eq!(restored.next_sequence(), 2);
    }

    #[test]
    fn test_snapshots_kept_in_collection_order() {
        let mut calendar = Calendar::new();
        for offset in [30, 10, 20] {
            calendar.append_snapshot(MetricSnapshot {
                content_id: "c1".to_string(),
                platform: "facebook".to_string(),
                counters: EngagementCounters {
                    likes: offset as u64,
                    ..Default::default()
                },
                collected_at: t0() + Duration::minutes(offset),
            });
        }
        let likes: Vec<u64> = calendar
            .snapshots_for("c1")
            .iter()
            .map(|s| s.counters.likes)
            .collect();
        assert_eq!(likes, vec![10, 20, 30]);
        assert!(calendar.snapshots_for("c2").is_empty());
    }
}
