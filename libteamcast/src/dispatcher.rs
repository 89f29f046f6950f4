//! Dispatch decisions and worker execution
//!
//! Each tick the coordinator asks the [`Dispatcher`] for a [`DispatchPlan`]:
//! which ready tasks to claim now, which platforms are throttled, and which
//! tasks have gone stale. The plan takes pool slots and rate-limit quota but
//! never touches the calendar; the coordinator applies it.
//!
//! Within a platform, dispatch is strictly in `(scheduled_at, sequence)` order:
//! once a platform's head task cannot start (pool full, quota spent) nothing
//! behind it on that platform starts either. Other platforms are unaffected.

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, Instrument};

use crate::calendar::Calendar;
use crate::config::{Config, StalenessConfig, StalenessPolicy};
use crate::error::PlatformError;
use crate::platforms::PlatformWorker;
use crate::rate_limiter::{Admission, RateLimiter};
use crate::types::{ContentItem, MetricSnapshot, PublishResult, Task, TaskId, TaskKind};

/// Result of one worker call
#[derive(Debug, Clone)]
pub enum Outcome {
    Generated(ContentItem),
    Published(PublishResult),
    Metrics(MetricSnapshot),
    Failed(PlatformError),
}

/// Message sent back to the coordinator when an execution ends
#[derive(Debug, Clone)]
pub struct Completion {
    pub task_id: TaskId,
    pub outcome: Outcome,
}

/// A ready task chosen for dispatch, holding its pool slot
pub struct Claim {
    pub task_id: TaskId,
    pub permit: OwnedSemaphorePermit,
}

#[derive(Default)]
pub struct DispatchPlan {
    pub claims: Vec<Claim>,
    /// Platforms denied by the rate limiter this pass
    pub rate_limited: Vec<(String, Duration)>,
    /// Stale tasks to report (escalate policy), with how long they waited
    pub escalated: Vec<(TaskId, Duration)>,
    /// Stale tasks to cancel (expire policy)
    pub expired: Vec<(TaskId, Duration)>,
    /// Ready tasks whose platform has no worker pool
    pub orphaned: Vec<TaskId>,
}

pub struct Dispatcher {
    pools: HashMap<String, Arc<Semaphore>>,
    deferred_until: HashMap<String, DateTime<Utc>>,
    escalated: HashSet<TaskId>,
    staleness: StalenessConfig,
}

impl Dispatcher {
    /// One pool of `max_concurrency` slots per enabled platform
    pub fn new(config: &Config) -> Self {
        let pools = config
            .platforms
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, p)| (name.clone(), Arc::new(Semaphore::new(p.max_concurrency))))
            .collect();

        Self {
            pools,
            deferred_until: HashMap::new(),
            escalated: HashSet::new(),
            staleness: config.scheduler.staleness.clone(),
        }
    }

    pub fn available_slots(&self, platform: &str) -> usize {
        self.pools
            .get(platform)
            .map(|p| p.available_permits())
            .unwrap_or(0)
    }

    /// Earliest time a throttled platform may be tried again
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.deferred_until.values().filter(|t| **t > now).min().copied()
    }

    /// A rate-limit slot was handed back; try the platform again next pass
    pub fn clear_deferral(&mut self, platform: &str) {
        self.deferred_until.remove(platform);
    }

    /// Drop bookkeeping for a task that left `ready`
    pub fn forget(&mut self, task_id: &str) {
        self.escalated.remove(task_id);
    }

    pub fn plan(
        &mut self,
        calendar: &Calendar,
        limiter: &RateLimiter,
        now: DateTime<Utc>,
    ) -> DispatchPlan {
        let mut plan = DispatchPlan::default();
        let max_lag = self.staleness.max_ready_lag();

        let mut fresh: Vec<&Task> = Vec::new();
        let mut stale: Vec<&Task> = Vec::new();

        for task in calendar.ready_queue() {
            if !self.pools.contains_key(&task.platform) {
                plan.orphaned.push(task.id.clone());
                continue;
            }

            let waited = now - task.scheduled_at;
            let is_stale = max_lag.map(|lag| waited > lag).unwrap_or(false);
            if is_stale {
                match self.staleness.policy {
                    StalenessPolicy::Wait => {}
                    StalenessPolicy::Deprioritize => {
                        stale.push(task);
                        continue;
                    }
                    StalenessPolicy::Escalate => {
                        if self.escalated.insert(task.id.clone()) {
                            plan.escalated.push((task.id.clone(), waited));
                        }
                    }
                    StalenessPolicy::Expire => {
                        plan.expired.push((task.id.clone(), waited));
                        continue;
                    }
                }
            }
            fresh.push(task);
        }
        fresh.extend(stale);

        let mut blocked: HashSet<&str> = HashSet::new();
        for task in fresh {
            let platform = task.platform.as_str();
            if blocked.contains(platform) {
                continue;
            }
            if let Some(until) = self.deferred_until.get(platform) {
                if *until > now {
                    blocked.insert(platform);
                    continue;
                }
            }

            let Some(pool) = self.pools.get(platform) else {
                continue;
            };
            // pool before quota: don't spend quota on work that cannot start
            let Ok(permit) = Arc::clone(pool).try_acquire_owned() else {
                debug!(platform, "worker pool saturated");
                blocked.insert(platform);
                continue;
            };

            match limiter.try_acquire(platform, now) {
                Admission::Granted => {
                    self.deferred_until.remove(platform);
                    plan.claims.push(Claim {
                        task_id: task.id.clone(),
                        permit,
                    });
                }
                Admission::Denied { retry_after } => {
                    drop(permit);
                    self.deferred_until
                        .insert(platform.to_string(), now + retry_after);
                    blocked.insert(platform);
                    plan.rate_limited.push((platform.to_string(), retry_after));
                }
            }
        }

        plan
    }
}

/// A claimed task ready to run on its worker
pub struct Execution {
    pub task: Task,
    /// Content the task operates on (publish, collect_metrics)
    pub content: Option<ContentItem>,
    pub worker: Arc<dyn PlatformWorker>,
    pub permit: OwnedSemaphorePermit,
}

impl Execution {
    /// Run on the tokio runtime; the completion is sent on `completions` and
    /// `wake` is notified
    pub fn spawn(
        self,
        completions: mpsc::UnboundedSender<Completion>,
        wake: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        let span = tracing::info_span!(
            "execute",
            task_id = %self.task.id,
            platform = %self.task.platform,
            kind = %self.task.kind,
            attempt = self.task.attempt_count
        );

        tokio::spawn(
            async move {
                let Execution {
                    task,
                    content,
                    worker,
                    permit,
                } = self;

                let outcome = AssertUnwindSafe(run(worker.as_ref(), &task, content.as_ref()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Outcome::Failed(PlatformError::Rejected(format!(
                            "{} worker panicked",
                            task.platform
                        )))
                    });
                drop(permit);

                if let Outcome::Failed(ref error) = outcome {
                    debug!(error = %error, class = %error.class(), "attempt failed");
                }
                // receiver gone means the coordinator was dropped
                let _ = completions.send(Completion {
                    task_id: task.id,
                    outcome,
                });
                wake.notify_one();
            }
            .instrument(span),
        )
    }
}

async fn run(
    worker: &dyn PlatformWorker,
    task: &Task,
    content: Option<&ContentItem>,
) -> Outcome {
    let missing = || {
        PlatformError::Validation(format!(
            "task {} refers to content {} which does not exist",
            task.id,
            task.payload.content_id.as_deref().unwrap_or("<none>")
        ))
    };

    let result = match task.kind {
        TaskKind::Generate => worker.generate(task).await.map(Outcome::Generated),
        TaskKind::Publish => match content {
            Some(item) => worker.publish(item).await.map(Outcome::Published),
            None => Err(missing()),
        },
        TaskKind::CollectMetrics => match content {
            Some(item) => worker.collect_metrics(item).await.map(Outcome::Metrics),
            None => Err(missing()),
        },
    };

    result.unwrap_or_else(Outcome::Failed)
}
