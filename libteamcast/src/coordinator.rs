//! The coordinator: single owner of the calendar
//!
//! All task state lives in one [`Calendar`] behind the coordinator's lock.
//! Workers never touch it: they run on their own tokio tasks and report back
//! over a completion channel, which the coordinator drains at the start of
//! every [`Coordinator::tick`].
//!
//! Changes are applied in memory first and then flushed to [`Storage`]. A
//! claimed task is only handed to its worker after its `in_flight` state has
//! been saved; if the flush fails the tick stops, the claim stays held, and
//! the next successful flush releases it.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::calendar::Calendar;
use crate::clock::Clock;
use crate::config::Config;
use crate::dispatcher::{Completion, Dispatcher, Execution, Outcome};
use crate::error::{ConfigError, ErrorClass, Result, TeamcastError};
use crate::events::{Event, EventBus, EventReceiver};
use crate::metrics::{build_report, MetricsAggregator, Report, ReportWindow, RunningTotals};
use crate::platforms::PlatformWorker;
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduling::plan_slots;
use crate::store::Storage;
use crate::types::{
    ContentItem, ContentRequest, ContentStatus, ContentType, MetricSnapshot, Task, TaskFailure,
    TaskId, TaskKind, TaskState,
};

const INTERRUPTED: &str = "interrupted by restart";

/// What one dispatch pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Worker completions applied
    pub completed: usize,
    /// Tasks moved from pending to ready
    pub promoted: usize,
    /// Tasks handed to workers
    pub dispatched: usize,
    /// Platforms turned away by the rate limiter
    pub rate_limited: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub tasks: usize,
    /// Tasks found in flight and sent through the retry rule
    pub interrupted: usize,
}

/// Changes not yet written to storage
#[derive(Default)]
struct Dirty {
    tasks: BTreeSet<TaskId>,
    content: BTreeSet<String>,
    snapshots: Vec<MetricSnapshot>,
    limits: BTreeSet<String>,
}

impl Dirty {
    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
            && self.content.is_empty()
            && self.snapshots.is_empty()
            && self.limits.is_empty()
    }
}

struct Inner {
    calendar: Calendar,
    dispatcher: Dispatcher,
    metrics: MetricsAggregator,
    completions: mpsc::UnboundedReceiver<Completion>,
    dirty: Dirty,
    /// Claimed executions waiting for their claim to be saved
    held: Vec<Execution>,
}

pub struct Coordinator {
    config: Config,
    workers: HashMap<String, Arc<dyn PlatformWorker>>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    events: EventBus,
    completions: mpsc::UnboundedSender<Completion>,
    wake: Arc<Notify>,
    inner: Mutex<Inner>,
}

impl Coordinator {
    /// Create a coordinator with an empty calendar
    ///
    /// Every enabled platform needs a worker; workers for platforms that are
    /// not enabled are ignored. Call [`Coordinator::restore`] to load stored
    /// state before the first tick.
    pub fn new(
        config: Config,
        workers: Vec<Arc<dyn PlatformWorker>>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut by_name = HashMap::new();
        for worker in workers {
            let name = worker.name().to_string();
            if config.platform(&name).is_none() {
                debug!(platform = %name, "ignoring worker for a platform that is not enabled");
                continue;
            }
            by_name.insert(name, worker);
        }
        for name in config.enabled_platforms() {
            if !by_name.contains_key(&name) {
                return Err(ConfigError::invalid(
                    format!("platforms.{}", name),
                    "platform is enabled but no worker is registered for it",
                )
                .into());
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            calendar: Calendar::new(),
            dispatcher: Dispatcher::new(&config),
            metrics: MetricsAggregator::new(),
            completions: rx,
            dirty: Dirty::default(),
            held: Vec::new(),
        };

        Ok(Self {
            limiter: RateLimiter::from_config(&config),
            retry: RetryPolicy::new(&config.retry),
            events: EventBus::new(config.scheduler.event_capacity),
            config,
            workers: by_name,
            storage,
            clock,
            completions: tx,
            wake: Arc::new(Notify::new()),
            inner: Mutex::new(inner),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribe to task and content events
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Load every stored task, content item, snapshot and rate-limit window
    ///
    /// Tasks found `in_flight` were interrupted by a restart: they get a
    /// transient failure and go through the normal retry rule. Only the
    /// process that dispatches should call this; see [`Coordinator::load`].
    pub async fn restore(&self) -> Result<RestoreSummary> {
        let now = self.clock.now();
        self.load().await?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let mut interrupted: Vec<&Task> = inner
            .calendar
            .tasks()
            .filter(|t| t.state == TaskState::InFlight)
            .collect();
        interrupted.sort_by_key(|t| t.sequence);
        let interrupted: Vec<TaskId> = interrupted.into_iter().map(|t| t.id.clone()).collect();

        for id in &interrupted {
            warn!(task_id = %id, "task was in flight at shutdown");
            self.fail(inner, id, ErrorClass::Transient, INTERRUPTED.to_string(), now)?;
        }
        self.flush(inner).await?;

        let summary = RestoreSummary {
            tasks: inner.calendar.len(),
            interrupted: interrupted.len(),
        };
        info!(
            tasks = summary.tasks,
            interrupted = summary.interrupted,
            "calendar restored"
        );
        Ok(summary)
    }

    /// Replace the in-memory calendar with stored state, as is
    ///
    /// For management commands running next to a daemon: in-flight tasks
    /// belong to the daemon and are left alone. Returns the number of tasks.
    pub async fn load(&self) -> Result<usize> {
        let tasks = self.storage.load_tasks().await?;
        let content = self.storage.load_content().await?;
        let snapshots = self.storage.load_snapshots().await?;
        let limits = self.storage.load_rate_limits().await?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        inner.calendar = Calendar::from_parts(tasks, content, snapshots);
        inner.metrics = MetricsAggregator::rebuild(&inner.calendar);
        inner.dirty = Dirty::default();

        for (platform, state) in limits {
            if !self.limiter.restore(&platform, state) {
                debug!(platform = %platform, "dropping stored window of unconfigured platform");
            }
        }
        Ok(inner.calendar.len())
    }

    /// Pick up changes other processes wrote to storage
    ///
    /// Stored tasks this coordinator has never seen are adopted, and tasks
    /// cancelled in storage are cancelled here too if they have not reached a
    /// worker. Drafts approved elsewhere are marked approved. Everything else
    /// in storage is this coordinator's own writing.
    pub async fn sync_from_storage(&self) -> Result<usize> {
        let stored = self.storage.load_tasks().await?;
        let stored_content = self.storage.load_content().await?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut changed = 0;

        for item in stored_content {
            if item.status != ContentStatus::Approved {
                continue;
            }
            if let Some(known) = inner.calendar.content_mut(&item.id) {
                if known.status == ContentStatus::Draft {
                    known.status = ContentStatus::Approved;
                    info!(content_id = %item.id, "content was approved elsewhere");
                    changed += 1;
                }
            }
        }

        for task in stored {
            match inner.calendar.task(&task.id).map(|t| t.state) {
                None => {
                    if task.state.is_terminal() {
                        continue;
                    }
                    if let Some(content_id) = task.payload.content_id.as_deref() {
                        if inner.calendar.content(content_id).is_none() {
                            warn!(task_id = %task.id, content_id, "skipping stored task with unknown content");
                            continue;
                        }
                    }
                    info!(task_id = %task.id, platform = %task.platform, "adopting task scheduled elsewhere");
                    self.insert_task(inner, task)?;
                    changed += 1;
                }
                Some(TaskState::Pending | TaskState::Ready) if task.state == TaskState::Cancelled => {
                    self.adopt_cancellation(inner, &task.id)?;
                    changed += 1;
                }
                Some(TaskState::InFlight)
                    if task.state == TaskState::Cancelled
                        && inner.held.iter().any(|e| e.task.id == task.id) =>
                {
                    self.adopt_cancellation(inner, &task.id)?;
                    changed += 1;
                }
                Some(_) => {}
            }
        }

        if changed > 0 {
            self.flush(inner).await?;
        }
        Ok(changed)
    }

    /// Schedule a task; returns its id
    ///
    /// # Errors
    ///
    /// `Validation` if the platform is unknown or disabled, `when` lies
    /// further in the past than the configured grace, or the request does not
    /// fit the platform. Storage errors are returned as-is and nothing is
    /// scheduled.
    pub async fn schedule(
        &self,
        platform: &str,
        request: ContentRequest,
        when: DateTime<Utc>,
    ) -> Result<TaskId> {
        let now = self.clock.now();
        let worker = self
            .config
            .platform(platform)
            .and_then(|_| self.workers.get(platform))
            .ok_or_else(|| {
                TeamcastError::Validation(format!(
                    "unknown or disabled platform '{}'",
                    platform
                ))
            })?;

        if when < now - self.config.scheduler.schedule_grace() {
            return Err(TeamcastError::Validation(format!(
                "scheduled time {} is in the past",
                when.to_rfc3339()
            )));
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match request.kind {
            TaskKind::Generate => {
                if request.payload.topic.trim().is_empty() {
                    return Err(TeamcastError::Validation(
                        "generate requests need a topic".to_string(),
                    ));
                }
                if !worker
                    .supported_content_types()
                    .contains(&request.payload.content_type)
                {
                    return Err(TeamcastError::Validation(format!(
                        "{} does not support {} content",
                        platform, request.payload.content_type
                    )));
                }
            }
            TaskKind::Publish | TaskKind::CollectMetrics => {
                let content_id = request.payload.content_id.as_deref().ok_or_else(|| {
                    TeamcastError::Validation(format!("{} requests need a content id", request.kind))
                })?;
                let item = inner.calendar.content(content_id).ok_or_else(|| {
                    TeamcastError::Validation(format!("content {} does not exist", content_id))
                })?;
                if item.platform != platform {
                    return Err(TeamcastError::Validation(format!(
                        "content {} belongs to {}, not {}",
                        content_id, item.platform, platform
                    )));
                }
                if request.kind == TaskKind::Publish
                    && self.config.pipeline.require_approval
                    && item.status == ContentStatus::Draft
                {
                    return Err(TeamcastError::Validation(format!(
                        "content {} has not been approved",
                        content_id
                    )));
                }
            }
        }

        let sequence = inner.calendar.next_sequence();
        let task = Task::new(platform.to_string(), request, when, now, sequence);
        self.storage.save_task(&task).await?;

        let id = task.id.clone();
        self.insert_task(inner, task)?;
        info!(task_id = %id, platform, scheduled_at = %when, "task scheduled");
        self.wake.notify_one();
        Ok(id)
    }

    /// Cancel a task that has not started
    ///
    /// Returns `false` for tasks that are in flight or already finished; an
    /// in-flight task runs to completion. The stored row is only cancelled
    /// while it is still `pending` or `ready`, so a task another process
    /// claimed in the meantime is reported as not cancelled.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        self.flush(inner).await?;

        let task = inner
            .calendar
            .task(task_id)
            .ok_or_else(|| TeamcastError::TaskNotFound(task_id.to_string()))?;
        if !matches!(task.state, TaskState::Pending | TaskState::Ready) {
            debug!(task_id, state = %task.state, "task cannot be cancelled");
            return Ok(false);
        }
        let platform = task.platform.clone();

        if !self.storage.cancel_task(task_id, now).await? {
            info!(task_id, "task was claimed before it could be cancelled");
            return Ok(false);
        }

        self.apply(inner, task_id, TaskState::Cancelled, now)?;
        inner.dirty.tasks.remove(task_id);
        self.events.emit(Event::TaskCancelled {
            task_id: task_id.to_string(),
            platform,
        });
        info!(task_id, "task cancelled");
        Ok(true)
    }

    /// Approve a draft and schedule its publish task at `when`
    ///
    /// With `pipeline.require_approval` this is the only way a generated
    /// draft gets published.
    pub async fn approve(&self, content_id: &str, when: DateTime<Utc>) -> Result<TaskId> {
        let now = self.clock.now();
        if when < now - self.config.scheduler.schedule_grace() {
            return Err(TeamcastError::Validation(format!(
                "scheduled time {} is in the past",
                when.to_rfc3339()
            )));
        }

        let (platform, request) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let item = inner.calendar.content_mut(content_id).ok_or_else(|| {
                TeamcastError::Validation(format!("content {} does not exist", content_id))
            })?;
            if item.status != ContentStatus::Draft {
                return Err(TeamcastError::Validation(format!(
                    "content {} is {}, only drafts can be approved",
                    content_id,
                    item.status.as_str()
                )));
            }
            item.status = ContentStatus::Approved;
            let platform = item.platform.clone();
            let request = ContentRequest::publish(item);
            inner.dirty.content.insert(content_id.to_string());
            self.flush(inner).await?;
            (platform, request)
        };

        info!(content_id, platform = %platform, "content approved");
        self.schedule(&platform, request, when).await
    }

    /// One dispatch pass
    ///
    /// Applies worker completions, promotes due tasks, and hands every task
    /// the rate limiter and worker pools allow to its worker. A storage
    /// failure stops the pass and is returned; nothing is dispatched whose
    /// claim was not saved.
    pub async fn tick(&self) -> Result<TickSummary> {
        let now = self.clock.now();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut summary = TickSummary {
            completed: self.drain(inner, now)?,
            ..TickSummary::default()
        };

        let promoted = inner.calendar.promote_due(now);
        for id in &promoted {
            self.transitioned(inner, id, TaskState::Pending);
        }
        summary.promoted = promoted.len();

        if let Err(e) = self.flush(inner).await {
            return Err(self.halt(e));
        }
        self.release_held(inner);

        let plan = inner.dispatcher.plan(&inner.calendar, &self.limiter, now);

        for (id, waited) in plan.expired {
            let Some(platform) = inner.calendar.task(&id).map(|t| t.platform.clone()) else {
                continue;
            };
            warn!(task_id = %id, platform = %platform, waited_secs = waited.num_seconds(), "stale task expired");
            inner.calendar.record_failure(
                &id,
                TaskFailure {
                    class: ErrorClass::Fatal,
                    message: "stale".to_string(),
                },
            )?;
            self.apply(inner, &id, TaskState::Cancelled, now)?;
            self.events.emit(Event::TaskStale {
                task_id: id,
                platform,
                waited_secs: waited.num_seconds(),
                expired: true,
            });
        }

        for (id, waited) in plan.escalated {
            let Some(platform) = inner.calendar.task(&id).map(|t| t.platform.clone()) else {
                continue;
            };
            warn!(task_id = %id, platform = %platform, waited_secs = waited.num_seconds(), "ready task is stale");
            self.events.emit(Event::TaskStale {
                task_id: id,
                platform,
                waited_secs: waited.num_seconds(),
                expired: false,
            });
        }

        for id in plan.orphaned {
            warn!(task_id = %id, "platform is not configured, cancelling task");
            inner.calendar.record_failure(
                &id,
                TaskFailure {
                    class: ErrorClass::Fatal,
                    message: "platform not configured".to_string(),
                },
            )?;
            self.apply(inner, &id, TaskState::Cancelled, now)?;
        }

        summary.rate_limited = plan.rate_limited.len();
        for (platform, retry_after) in plan.rate_limited {
            info!(
                platform = %platform,
                retry_after_ms = retry_after.num_milliseconds(),
                "rate limited, deferring dispatch"
            );
            self.events.emit(Event::RateLimited {
                platform,
                retry_after_ms: retry_after.num_milliseconds(),
            });
        }

        let mut claimed = Vec::with_capacity(plan.claims.len());
        for claim in plan.claims {
            let task = inner.calendar.claim(&claim.task_id, now)?;
            claimed.push(task.id.clone());
            self.transitioned(inner, &task.id, TaskState::Ready);

            let worker = self.workers.get(&task.platform).ok_or_else(|| {
                ConfigError::invalid(
                    format!("platforms.{}", task.platform),
                    "no worker registered",
                )
            })?;
            let content = task
                .payload
                .content_id
                .as_deref()
                .and_then(|id| inner.calendar.content(id))
                .cloned();

            inner.dirty.limits.insert(task.platform.clone());
            inner.held.push(Execution {
                task,
                content,
                worker: Arc::clone(worker),
                permit: claim.permit,
            });
        }

        if let Err(e) = self.flush(inner).await {
            return Err(self.halt(e));
        }
        // claims refused by storage were withdrawn from `held`
        summary.dispatched = claimed
            .iter()
            .filter(|id| inner.held.iter().any(|e| &e.task.id == *id))
            .count();
        self.release_held(inner);

        if summary != TickSummary::default() {
            debug!(
                completed = summary.completed,
                promoted = summary.promoted,
                dispatched = summary.dispatched,
                rate_limited = summary.rate_limited,
                "tick"
            );
        }
        Ok(summary)
    }

    /// Apply completions until nothing is in flight
    pub async fn wait_idle(&self) -> Result<()> {
        loop {
            {
                let now = self.clock.now();
                let mut guard = self.inner.lock().await;
                let inner = &mut *guard;
                self.drain(inner, now)?;
                self.flush(inner).await?;
                self.release_held(inner);
                if inner.calendar.count_in_state(TaskState::InFlight) == 0 {
                    return Ok(());
                }
            }
            self.wake.notified().await;
        }
    }

    /// Run dispatch passes until `shutdown` turns true, then drain
    ///
    /// Passes run every tick interval, or sooner when a task falls due, a
    /// throttled platform's window reopens, or a worker finishes. A failed
    /// pass is logged and retried on the next one.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            platforms = ?self.config.enabled_platforms(),
            tick_ms = self.config.scheduler.tick_interval_ms,
            "coordinator started"
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.sync_from_storage().await {
                warn!(error = %e, "could not read external changes");
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "dispatch pass failed");
            }

            let pause = self.next_wake().await;
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("shutdown requested, waiting for in-flight tasks");
        self.wait_idle().await?;
        info!("coordinator stopped");
        Ok(())
    }

    /// Time until the next pass is needed
    async fn next_wake(&self) -> std::time::Duration {
        let tick = self.config.scheduler.tick_interval();
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        [
            inner.calendar.next_due(),
            inner.dispatcher.next_retry_at(now),
        ]
        .into_iter()
        .flatten()
        .filter_map(|at| (at - now).to_std().ok())
        .chain(std::iter::once(tick))
        .min()
        .unwrap_or(tick)
    }

    /// Report over `window`, optionally for one platform
    pub async fn report(&self, window: ReportWindow, platform: Option<&str>) -> Report {
        let targets: BTreeMap<String, u32> = self
            .config
            .platforms
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, p)| (name.clone(), p.posts_per_day))
            .collect();
        let inner = self.inner.lock().await;
        build_report(&inner.calendar, &targets, window, platform)
    }

    /// Running totals per platform
    pub async fn totals(&self) -> BTreeMap<String, RunningTotals> {
        self.inner.lock().await.metrics.all_totals().clone()
    }

    /// Schedule `generate` tasks at every platform's best times for `days`
    /// days from `start`; slots already in the past are skipped
    pub async fn plan_calendar(
        &self,
        start: NaiveDate,
        days: u32,
        topic: &str,
    ) -> Result<Vec<TaskId>> {
        let now = self.clock.now();
        let mut ids = Vec::new();

        for (platform, at) in plan_slots(&self.config, start, days) {
            if at < now {
                continue;
            }
            let Some(content_type) = self.default_content_type(&platform) else {
                continue;
            };
            let id = self
                .schedule(&platform, ContentRequest::generate(topic, content_type), at)
                .await?;
            ids.push(id);
        }

        info!(tasks = ids.len(), days, "content calendar planned");
        Ok(ids)
    }

    /// The first content type the platform's worker supports
    pub fn default_content_type(&self, platform: &str) -> Option<ContentType> {
        self.workers
            .get(platform)
            .and_then(|w| w.supported_content_types().first().copied())
    }

    pub async fn task(&self, id: &str) -> Option<Task> {
        self.inner.lock().await.calendar.task(id).cloned()
    }

    /// Every task, in insertion order
    pub async fn tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner.calendar.tasks().cloned().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Content items still waiting for approval, oldest first
    pub async fn drafts(&self) -> Vec<ContentItem> {
        let inner = self.inner.lock().await;
        let mut drafts: Vec<ContentItem> = inner
            .calendar
            .content_items()
            .filter(|c| c.status == ContentStatus::Draft)
            .cloned()
            .collect();
        drafts.sort_by_key(|c| c.created_at);
        drafts
    }

    pub async fn content(&self, id: &str) -> Option<ContentItem> {
        self.inner.lock().await.calendar.content(id).cloned()
    }

    pub async fn snapshots(&self, content_id: &str) -> Vec<MetricSnapshot> {
        self.inner.lock().await.calendar.snapshots_for(content_id).to_vec()
    }

    fn halt(&self, e: TeamcastError) -> TeamcastError {
        error!(error = %e, "storage failed, halting dispatch pass");
        self.events.emit(Event::TickHalted {
            error: e.to_string(),
        });
        e
    }

    fn release_held(&self, inner: &mut Inner) {
        if !inner.dirty.is_empty() {
            return;
        }
        for execution in inner.held.drain(..) {
            execution.spawn(self.completions.clone(), Arc::clone(&self.wake));
        }
    }

    fn drain(&self, inner: &mut Inner, now: DateTime<Utc>) -> Result<usize> {
        let mut applied = 0;
        while let Ok(completion) = inner.completions.try_recv() {
            self.complete(inner, completion, now)?;
            applied += 1;
        }
        Ok(applied)
    }

    fn complete(&self, inner: &mut Inner, completion: Completion, now: DateTime<Utc>) -> Result<()> {
        let Some(task) = inner.calendar.task(&completion.task_id).cloned() else {
            warn!(task_id = %completion.task_id, "completion for unknown task");
            return Ok(());
        };
        if task.state != TaskState::InFlight {
            warn!(task_id = %task.id, state = %task.state, "completion for task that is not in flight");
            return Ok(());
        }

        match completion.outcome {
            Outcome::Generated(item) => {
                let content_id = item.id.clone();
                inner.dirty.content.insert(content_id.clone());
                inner.calendar.insert_content(item);
                self.apply(inner, &task.id, TaskState::Succeeded, now)?;
                info!(task_id = %task.id, content_id = %content_id, "content generated");

                if self.config.pipeline.require_approval {
                    info!(content_id = %content_id, "draft awaiting approval");
                } else if self.config.pipeline.auto_publish {
                    if let Some(item) = inner.calendar.content(&content_id) {
                        let request = ContentRequest::publish(item);
                        self.follow_up(inner, &task, request, now, now)?;
                    }
                }
            }
            Outcome::Published(result) => {
                self.apply(inner, &task.id, TaskState::Succeeded, now)?;
                let Some(content_id) = task.payload.content_id.clone() else {
                    return Ok(());
                };
                let Some(item) = inner.calendar.content_mut(&content_id) else {
                    return Ok(());
                };
                item.status = ContentStatus::Published;
                item.platform_post_id = Some(result.platform_post_id.clone());
                item.published_at = Some(now);
                inner.dirty.content.insert(content_id.clone());

                if let Some(item) = inner.calendar.content(&content_id) {
                    inner.metrics.record_published(item);
                }
                info!(
                    task_id = %task.id,
                    content_id = %content_id,
                    post_id = %result.platform_post_id,
                    "content published"
                );
                self.events.emit(Event::ContentPublished {
                    content_id: content_id.clone(),
                    task_id: task.id.clone(),
                    platform: task.platform.clone(),
                    platform_post_id: result.platform_post_id,
                });

                if let Some(after) = self.config.pipeline.collect_metrics_after_secs {
                    if let Some(item) = inner.calendar.content(&content_id) {
                        let request = ContentRequest::collect_metrics(item);
                        let at = now + chrono::Duration::seconds(after as i64);
                        self.follow_up(inner, &task, request, at, now)?;
                    }
                }
            }
            Outcome::Metrics(snapshot) => {
                inner.calendar.append_snapshot(snapshot.clone());
                inner.metrics.record_snapshot(&snapshot);
                self.events.emit(Event::MetricsRecorded {
                    content_id: snapshot.content_id.clone(),
                    platform: snapshot.platform.clone(),
                    counters: snapshot.counters,
                    collected_at: snapshot.collected_at,
                });
                inner.dirty.snapshots.push(snapshot);
                self.apply(inner, &task.id, TaskState::Succeeded, now)?;
            }
            Outcome::Failed(e) => {
                self.fail(inner, &task.id, e.class(), e.to_string(), now)?;
            }
        }
        Ok(())
    }

    /// Record a failed attempt and apply the retry rule
    fn fail(
        &self,
        inner: &mut Inner,
        id: &str,
        class: ErrorClass,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        inner.calendar.record_failure(
            id,
            TaskFailure {
                class,
                message: message.clone(),
            },
        )?;
        let task = inner
            .calendar
            .task(id)
            .ok_or_else(|| TeamcastError::TaskNotFound(id.to_string()))?;
        let attempts = task.attempt_count;
        let kind = task.kind;
        let content_id = task.payload.content_id.clone();

        match self.retry.decide(attempts, class) {
            RetryDecision::Retry { delay } => {
                self.apply(inner, id, TaskState::FailedRetryable, now)?;
                let at = now + delay;
                inner.calendar.reschedule(id, at, now)?;
                self.transitioned(inner, id, TaskState::FailedRetryable);
                info!(
                    task_id = id,
                    attempt = attempts,
                    retry_in_ms = delay.num_milliseconds(),
                    error = %message,
                    "attempt failed, retrying"
                );
            }
            RetryDecision::GiveUp(reason) => {
                self.apply(inner, id, TaskState::FailedFatal, now)?;
                warn!(
                    task_id = id,
                    attempt = attempts,
                    reason = ?reason,
                    error = %message,
                    "task failed"
                );
                if let (TaskKind::Publish, Some(cid)) = (kind, content_id) {
                    if let Some(item) = inner.calendar.content_mut(&cid) {
                        item.status = ContentStatus::Failed;
                        inner.dirty.content.insert(cid);
                    }
                }
            }
        }
        Ok(())
    }

    fn follow_up(
        &self,
        inner: &mut Inner,
        parent: &Task,
        request: ContentRequest,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sequence = inner.calendar.next_sequence();
        let mut task = Task::new(parent.platform.clone(), request, at, now, sequence);
        task.parent_id = Some(parent.id.clone());
        debug!(task_id = %task.id, parent_id = %parent.id, kind = %task.kind, "follow-up scheduled");
        inner.dirty.tasks.insert(task.id.clone());
        self.insert_task(inner, task)
    }

    fn insert_task(&self, inner: &mut Inner, task: Task) -> Result<()> {
        let event = Event::TaskScheduled {
            task_id: task.id.clone(),
            platform: task.platform.clone(),
            kind: task.kind,
            scheduled_at: task.scheduled_at,
            parent_id: task.parent_id.clone(),
        };
        inner.metrics.record_scheduled(&task);
        inner.calendar.insert(task)?;
        self.events.emit(event);
        Ok(())
    }

    fn apply(&self, inner: &mut Inner, id: &str, to: TaskState, now: DateTime<Utc>) -> Result<()> {
        let from = inner.calendar.transition(id, to, now)?;
        self.transitioned(inner, id, from);
        Ok(())
    }

    /// Bookkeeping after the calendar moved task `id` out of `from`
    fn transitioned(&self, inner: &mut Inner, id: &str, from: TaskState) {
        inner.dirty.tasks.insert(id.to_string());
        let Some(task) = inner.calendar.task(id) else {
            return;
        };
        if task.state != TaskState::Ready {
            inner.dispatcher.forget(id);
        }
        if task.state.is_terminal() {
            inner.metrics.record_finished(task);
        }
        self.events.emit(Event::TaskStateChanged {
            task_id: task.id.clone(),
            platform: task.platform.clone(),
            kind: task.kind,
            from,
            to: task.state,
            attempt: task.attempt_count,
            error_class: task.last_error.as_ref().map(|e| e.class),
            error: task.last_error.as_ref().map(|e| e.message.clone()),
        });
    }

    /// Take on a cancellation found in storage while writing task `id`
    fn adopt_cancellation(&self, inner: &mut Inner, id: &str) -> Result<()> {
        let Some(task) = inner.calendar.task(id) else {
            return Ok(());
        };
        let held = inner.held.iter().position(|e| e.task.id == id);
        match task.state {
            TaskState::Pending | TaskState::Ready => {}
            TaskState::InFlight if held.is_some() => {}
            TaskState::Cancelled => return Ok(()),
            state => {
                warn!(task_id = id, state = %state, "stored cancellation conflicts with local state");
                return Ok(());
            }
        }
        let platform = task.platform.clone();
        let now = self.clock.now();

        if let Some(pos) = held {
            // never handed to the worker; dropping it frees the pool slot
            let execution = inner.held.remove(pos);
            self.limiter.release(&platform, execution.task.updated_at);
            inner.dispatcher.clear_deferral(&platform);
            inner.dirty.limits.insert(platform.clone());
        }

        let from = inner.calendar.adopt_cancellation(id, now)?;
        self.transitioned(inner, id, from);
        inner.dirty.tasks.remove(id);
        info!(task_id = id, platform = %platform, from = %from, "task was cancelled elsewhere");
        self.events.emit(Event::TaskCancelled {
            task_id: id.to_string(),
            platform,
        });
        Ok(())
    }

    /// Write every dirty record; entries stay dirty until their write succeeds
    ///
    /// A task write that storage refuses means the task was cancelled there;
    /// the cancellation is taken on here.
    async fn flush(&self, inner: &mut Inner) -> Result<()> {
        let content: Vec<String> = inner.dirty.content.iter().cloned().collect();
        for id in content {
            if let Some(item) = inner.calendar.content(&id) {
                self.storage.save_content(item).await?;
            }
            inner.dirty.content.remove(&id);
        }

        let tasks: Vec<TaskId> = inner.dirty.tasks.iter().cloned().collect();
        let mut refused = Vec::new();
        for id in tasks {
            if let Some(task) = inner.calendar.task(&id) {
                if !self.storage.save_task(task).await? {
                    refused.push(id.clone());
                }
            }
            inner.dirty.tasks.remove(&id);
        }
        for id in refused {
            self.adopt_cancellation(inner, &id)?;
        }

        while let Some(snapshot) = inner.dirty.snapshots.first() {
            self.storage.append_snapshot(snapshot).await?;
            inner.dirty.snapshots.remove(0);
        }

        let limits: Vec<String> = inner.dirty.limits.iter().cloned().collect();
        for platform in limits {
            if let Some(state) = self.limiter.state(&platform) {
                self.storage.save_rate_limit(&platform, &state).await?;
            }
            inner.dirty.limits.remove(&platform);
        }
        Ok(())
    }
}
