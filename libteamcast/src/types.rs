//! Core types for Teamcast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ErrorClass;

pub type TaskId = String;

/// What a task asks its platform worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Generate,
    Publish,
    CollectMetrics,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Generate => "generate",
            TaskKind::Publish => "publish",
            TaskKind::CollectMetrics => "collect_metrics",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "generate" => Ok(TaskKind::Generate),
            "publish" => Ok(TaskKind::Publish),
            "collect_metrics" | "metrics" => Ok(TaskKind::CollectMetrics),
            _ => Err(format!(
                "Invalid task kind: '{}'. Valid options: generate, publish, collect_metrics",
                s
            )),
        }
    }
}

/// Lifecycle of a task
///
/// ```text
/// pending -> ready -> in_flight -> succeeded
///                              \-> failed_retryable -> pending
///                              \-> failed_fatal
/// pending | ready -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedFatal,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::InFlight => "in_flight",
            TaskState::Succeeded => "succeeded",
            TaskState::FailedRetryable => "failed_retryable",
            TaskState::FailedFatal => "failed_fatal",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::FailedFatal | TaskState::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Cancelled)
                | (Ready, InFlight)
                | (Ready, Cancelled)
                | (InFlight, Succeeded)
                | (InFlight, FailedRetryable)
                | (InFlight, FailedFatal)
                | (FailedRetryable, Pending)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "ready" => Ok(TaskState::Ready),
            "in_flight" => Ok(TaskState::InFlight),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed_retryable" => Ok(TaskState::FailedRetryable),
            "failed_fatal" => Ok(TaskState::FailedFatal),
            "cancelled" => Ok(TaskState::Cancelled),
            _ => Err(format!("Invalid task state: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Image,
    Link,
    Poll,
    Carousel,
    Reel,
    Video,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Link => "link",
            ContentType::Poll => "poll",
            ContentType::Carousel => "carousel",
            ContentType::Reel => "reel",
            ContentType::Video => "video",
        }
    }

    /// Whether content of this type must carry at least one media reference
    pub fn requires_media(&self) -> bool {
        matches!(
            self,
            ContentType::Image | ContentType::Carousel | ContentType::Reel | ContentType::Video
        )
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(ContentType::Text),
            "image" => Ok(ContentType::Image),
            "link" => Ok(ContentType::Link),
            "poll" => Ok(ContentType::Poll),
            "carousel" => Ok(ContentType::Carousel),
            "reel" => Ok(ContentType::Reel),
            "video" => Ok(ContentType::Video),
            _ => Err(format!("Invalid content type: '{}'", s)),
        }
    }
}

/// Opaque content descriptor carried by a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub topic: String,
    pub content_type: ContentType,
    /// Content item this task operates on (publish and collect_metrics)
    pub content_id: Option<String>,
    pub notes: Option<String>,
}

/// What the caller asks the coordinator to schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRequest {
    pub kind: TaskKind,
    pub payload: TaskPayload,
}

impl ContentRequest {
    pub fn generate(topic: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            kind: TaskKind::Generate,
            payload: TaskPayload {
                topic: topic.into(),
                content_type,
                content_id: None,
                notes: None,
            },
        }
    }

    pub fn publish(content: &ContentItem) -> Self {
        Self::for_content(TaskKind::Publish, content)
    }

    pub fn collect_metrics(content: &ContentItem) -> Self {
        Self::for_content(TaskKind::CollectMetrics, content)
    }

    fn for_content(kind: TaskKind, content: &ContentItem) -> Self {
        Self {
            kind,
            payload: TaskPayload {
                topic: content.topic.clone(),
                content_type: content.content_type,
                content_id: Some(content.id.clone()),
                notes: None,
            },
        }
    }
}

/// Last failure recorded on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub platform: String,
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub scheduled_at: DateTime<Utc>,
    pub state: TaskState,
    pub attempt_count: u32,
    pub last_error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Insertion order, the stable tie-break for equal `scheduled_at`
    pub sequence: u64,
    pub parent_id: Option<TaskId>,
}

impl Task {
    pub fn new(
        platform: String,
        request: ContentRequest,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            platform,
            kind: request.kind,
            payload: request.payload,
            scheduled_at,
            state: TaskState::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            sequence,
            parent_id: None,
        }
    }

    /// Terminal failure caused by running out of attempts on transient errors
    pub fn exhausted_retries(&self) -> bool {
        self.state == TaskState::FailedFatal
            && self
                .last_error
                .as_ref()
                .map(|e| e.class == ErrorClass::Transient)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Draft,
    /// Released for publishing, see `pipeline.require_approval`
    Approved,
    Published,
    Failed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Draft => "draft",
            ContentStatus::Approved => "approved",
            ContentStatus::Published => "published",
            ContentStatus::Failed => "failed",
        }
    }
}

impl FromStr for ContentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ContentStatus::Draft),
            "approved" => Ok(ContentStatus::Approved),
            "published" => Ok(ContentStatus::Published),
            "failed" => Ok(ContentStatus::Failed),
            _ => Err(format!("Invalid content status: '{}'", s)),
        }
    }
}

/// Reference to media stored outside the core (path or URL)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub location: String,
    pub alt_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBody {
    pub text: String,
    pub media: Vec<MediaRef>,
    pub hashtags: Vec<String>,
}

impl ContentBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Character count as platforms count it (text plus appended hashtags)
    pub fn char_count(&self) -> usize {
        let tags: usize = self.hashtags.iter().map(|t| t.chars().count() + 1).sum();
        self.text.chars().count() + tags
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    /// Task that generated this item
    pub task_id: TaskId,
    pub platform: String,
    pub topic: String,
    pub content_type: ContentType,
    pub body: ContentBody,
    pub status: ContentStatus,
    pub platform_post_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    pub fn draft(task: &Task, body: ContentBody, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            platform: task.platform.clone(),
            topic: task.payload.topic.clone(),
            content_type: task.payload.content_type,
            body,
            status: ContentStatus::Draft,
            platform_post_id: None,
            created_at: now,
            published_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub platform_post_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementCounters {
    pub likes: u64,
    pub shares: u64,
    pub comments: u64,
    pub impressions: u64,
}

impl EngagementCounters {
    /// Interactions, excluding passive impressions
    pub fn engagement(&self) -> u64 {
        self.likes + self.shares + self.comments
    }

    pub fn add(&mut self, other: &EngagementCounters) {
        self.likes += other.likes;
        self.shares += other.shares;
        self.comments += other.comments;
        self.impressions += other.impressions;
    }

    /// Remove counters previously added; never goes below zero
    pub fn subtract(&mut self, other: &EngagementCounters) {
        self.likes = self.likes.saturating_sub(other.likes);
        self.shares = self.shares.saturating_sub(other.shares);
        self.comments = self.comments.saturating_sub(other.comments);
        self.impressions = self.impressions.saturating_sub(other.impressions);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub content_id: String,
    pub platform: String,
    pub counters: EngagementCounters,
    pub collected_at: DateTime<Utc>,
}
