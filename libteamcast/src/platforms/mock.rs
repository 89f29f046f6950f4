//! Mock platform worker for testing
//!
//! A configurable [`PlatformWorker`] that can script failures, add latency and
//! record what it was asked to do. Clones share their counters, so a test can
//! keep one handle while the coordinator owns another.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use super::{PlatformResult, PlatformWorker};
use crate::clock::{Clock, SystemClock};
use crate::error::PlatformError;
use crate::types::{
    ContentBody, ContentItem, ContentType, EngagementCounters, MediaRef, MetricSnapshot,
    PublishResult, Task, TaskKind,
};

const ALL_CONTENT_TYPES: &[ContentType] = &[
    ContentType::Text,
    ContentType::Image,
    ContentType::Link,
    ContentType::Poll,
    ContentType::Carousel,
    ContentType::Reel,
    ContentType::Video,
];

#[derive(Default)]
struct MockState {
    /// Errors returned by the next calls, oldest first
    script: VecDeque<PlatformError>,
    /// Error returned once the script is empty
    always_fail: Option<PlatformError>,
    counters: EngagementCounters,
    /// Task ids in the order they reached the worker
    calls: Vec<(TaskKind, String)>,
}

/// Mock worker for testing
#[derive(Clone)]
pub struct MockWorker {
    name: String,
    delay: Duration,
    character_limit: Option<usize>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<MockState>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockWorker {
    /// Create a mock worker that always succeeds
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            character_limit: None,
            clock: Arc::new(SystemClock),
            state: Arc::new(Mutex::new(MockState::default())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulate latency on every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.character_limit = Some(limit);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fail the next calls with these errors, in order
    pub fn fail_next(&self, errors: impl IntoIterator<Item = PlatformError>) {
        self.lock().script.extend(errors);
    }

    /// Fail every call (after any scripted errors) with `error`
    pub fn fail_always(&self, error: PlatformError) {
        self.lock().always_fail = Some(error);
    }

    /// Counters returned by `collect_metrics`
    pub fn set_counters(&self, counters: EngagementCounters) {
        self.lock().counters = counters;
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls_for(&self, kind: TaskKind) -> usize {
        self.lock().calls.iter().filter(|(k, _)| *k == kind).count()
    }

    /// Ids (task or content) seen by the worker, in call order
    pub fn seen_ids(&self) -> Vec<String> {
        self.lock().calls.iter().map(|(_, id)| id.clone()).collect()
    }

    /// Highest number of calls that were running at the same time
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call, wait out the delay, and return the scripted failure
    async fn enter(&self, kind: TaskKind, id: &str) -> PlatformResult<()> {
        let failure = {
            let mut state = self.lock();
            state.calls.push((kind, id.to_string()));
            state
                .script
                .pop_front()
                .or_else(|| state.always_fail.clone())
        };

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformWorker for MockWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn character_limit(&self) -> Option<usize> {
        self.character_limit
    }

    fn supported_content_types(&self) -> &[ContentType] {
        ALL_CONTENT_TYPES
    }

    fn validate_content(&self, item: &ContentItem) -> PlatformResult<()> {
        if item.body.text.is_empty() {
            return Err(PlatformError::Validation(
                "Content cannot be empty".to_string(),
            ));
        }
        if let Some(limit) = self.character_limit {
            let count = item.body.char_count();
            if count > limit {
                return Err(PlatformError::Validation(format!(
                    "Content exceeds {} character limit (got {} characters)",
                    limit, count
                )));
            }
        }
        Ok(())
    }

    async fn generate(&self, task: &Task) -> PlatformResult<ContentItem> {
        self.enter(TaskKind::Generate, &task.id).await?;
        let body = ContentBody {
            text: format!("[{}] {}", self.name, task.payload.topic),
            media: if task.payload.content_type.requires_media() {
                vec![MediaRef {
                    location: format!("mock://{}/{}", self.name, task.id),
                    alt_text: None,
                }]
            } else {
                vec![]
            },
            hashtags: vec![],
        };
        let item = ContentItem::draft(task, body, self.clock.now());
        self.validate_content(&item)?;
        Ok(item)
    }

    async fn publish(&self, item: &ContentItem) -> PlatformResult<PublishResult> {
        self.enter(TaskKind::Publish, &item.id).await?;
        self.validate_content(item)?;
        let post_id = format!("{}:mock-{}", self.name, uuid::Uuid::new_v4());
        Ok(PublishResult {
            url: Some(format!("https://{}.example/{}", self.name, post_id)),
            platform_post_id: post_id,
        })
    }

    async fn collect_metrics(&self, item: &ContentItem) -> PlatformResult<MetricSnapshot> {
        self.enter(TaskKind::CollectMetrics, &item.id).await?;
        let counters = self.lock().counters;
        Ok(MetricSnapshot {
            content_id: item.id.clone(),
            platform: self.name.clone(),
            counters,
            collected_at: self.clock.now(),
        })
    }
}
