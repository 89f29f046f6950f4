//! Platform workers and the collaborators they drive
//!
//! A [`PlatformWorker`] executes one task against one platform. The core only
//! ever talks to this trait; the built-in Facebook, X, Instagram and TikTok
//! workers are [`ApiWorker`]s configured with that platform's
//! [`PlatformRules`], delegating the actual network calls to a
//! [`PlatformApi`] and content creation to a [`ContentGenerator`].
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libteamcast::platforms::{self, PlatformWorker};
//! use libteamcast::platforms::dry_run::{DryRunApi, TemplateGenerator};
//!
//! let worker = platforms::builtin_worker(
//!     "twitter",
//!     Arc::new(DryRunApi::new("twitter")),
//!     Arc::new(TemplateGenerator::default()),
//! )
//! .expect("twitter is a built-in platform");
//!
//! assert_eq!(worker.character_limit(), Some(280));
//! ```

use async_trait::async_trait;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::error::PlatformError;
use crate::types::{
    ContentBody, ContentItem, ContentType, EngagementCounters, MetricSnapshot, PublishResult, Task,
    TaskPayload,
};

pub mod dry_run;
pub mod facebook;
pub mod instagram;
pub mod tiktok;
pub mod twitter;

// Mock worker is available for all builds (not just tests) to support integration tests
pub mod mock;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Executes tasks against a single platform
///
/// Workers receive a read-only view of the task or content item and return a
/// result; they never mutate coordinator state. Every failure must be a
/// [`PlatformError`] whose [`class`](PlatformError::class) decides whether the
/// coordinator retries.
#[async_trait]
pub trait PlatformWorker: Send + Sync {
    /// Lowercase platform identifier (e.g. "facebook", "twitter")
    fn name(&self) -> &str;

    /// Maximum characters in a post body, hashtags included
    fn character_limit(&self) -> Option<usize>;

    /// Content types this platform accepts; the first is the default for
    /// planned content
    fn supported_content_types(&self) -> &[ContentType];

    /// Check a content item against the platform's rules
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Validation` when the content cannot be posted
    /// as-is; validation failures are never retried.
    fn validate_content(&self, item: &ContentItem) -> PlatformResult<()>;

    /// Produce a draft content item for a `generate` task
    async fn generate(&self, task: &Task) -> PlatformResult<ContentItem>;

    /// Publish a content item and return the platform's identifiers
    async fn publish(&self, item: &ContentItem) -> PlatformResult<PublishResult>;

    /// Read current engagement counters for a published item
    async fn collect_metrics(&self, item: &ContentItem) -> PlatformResult<MetricSnapshot>;
}

/// Failure reported by an external service, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFailure {
    /// HTTP status, if a response was received at all
    pub status: Option<u16>,
    /// Platform-specific error code
    pub code: Option<String>,
    pub message: String,
}

impl ApiFailure {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
        }
    }

    /// Failure with no response (connection refused, DNS, reset)
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.status, &self.code) {
            (Some(status), Some(code)) => write!(f, "{} [{}]: {}", status, code, self.message),
            (Some(status), None) => write!(f, "{}: {}", status, self.message),
            (None, Some(code)) => write!(f, "[{}]: {}", code, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// Platform error codes that mean "slow down" regardless of HTTP status
const THROTTLE_CODES: &[&str] = &["rate_limited", "throttled", "4", "17", "88", "613"];

/// Map an external failure onto the retry classification
///
/// Platform codes win over the HTTP status because several APIs report
/// throttling with a 400 or 403.
pub fn classify_api_failure(failure: &ApiFailure) -> PlatformError {
    let message = failure.to_string();

    if let Some(code) = failure.code.as_deref() {
        if THROTTLE_CODES.contains(&code) {
            return PlatformError::RateLimit(message);
        }
        if code == "timeout" {
            return PlatformError::Timeout(message);
        }
    }

    match failure.status {
        None => PlatformError::Network(message),
        Some(401) | Some(403) => PlatformError::Authentication(message),
        Some(400) | Some(413) | Some(422) => PlatformError::Validation(message),
        Some(408) | Some(504) => PlatformError::Timeout(message),
        Some(429) => PlatformError::RateLimit(message),
        Some(status) if status >= 500 => PlatformError::Server {
            status,
            message: failure.message.clone(),
        },
        Some(_) => PlatformError::Rejected(message),
    }
}

/// Client for one platform's publish and metrics endpoints
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn publish(&self, item: &ContentItem) -> Result<PublishResult, ApiFailure>;

    async fn fetch_metrics(&self, platform_post_id: &str) -> Result<EngagementCounters, ApiFailure>;
}

/// Text and media generation service
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, platform: &str, payload: &TaskPayload)
        -> Result<ContentBody, ApiFailure>;
}

/// Static posting rules of a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformRules {
    pub name: &'static str,
    pub character_limit: usize,
    pub content_types: &'static [ContentType],
    pub max_hashtags: usize,
    /// Every post must carry at least one media reference
    pub media_required: bool,
}

impl PlatformRules {
    pub fn supports(&self, content_type: ContentType) -> bool {
        self.content_types.contains(&content_type)
    }

    pub fn validate(&self, item: &ContentItem) -> PlatformResult<()> {
        if !self.supports(item.content_type) {
            return Err(PlatformError::Validation(format!(
                "{} does not support {} posts",
                self.name, item.content_type
            )));
        }

        let body = &item.body;
        if body.text.trim().is_empty() && body.media.is_empty() {
            return Err(PlatformError::Validation(
                "Content cannot be empty".to_string(),
            ));
        }

        let count = body.char_count();
        if count > self.character_limit {
            return Err(PlatformError::Validation(format!(
                "Content exceeds {} character limit for {} (got {} characters)",
                self.character_limit, self.name, count
            )));
        }

        if body.hashtags.len() > self.max_hashtags {
            return Err(PlatformError::Validation(format!(
                "{} allows at most {} hashtags (got {})",
                self.name,
                self.max_hashtags,
                body.hashtags.len()
            )));
        }

        if (self.media_required || item.content_type.requires_media()) && body.media.is_empty() {
            return Err(PlatformError::Validation(format!(
                "{} {} posts need at least one media reference",
                self.name, item.content_type
            )));
        }

        Ok(())
    }
}

/// Names of the platforms with built-in rules
pub const BUILTIN_PLATFORMS: &[&str] = &[
    facebook::RULES.name,
    instagram::RULES.name,
    tiktok::RULES.name,
    twitter::RULES.name,
];

pub fn builtin_rules(name: &str) -> Option<&'static PlatformRules> {
    match name {
        "facebook" => Some(&facebook::RULES),
        "twitter" => Some(&twitter::RULES),
        "instagram" => Some(&instagram::RULES),
        "tiktok" => Some(&tiktok::RULES),
        _ => None,
    }
}

/// Build the worker for a built-in platform
pub fn builtin_worker(
    name: &str,
    api: Arc<dyn PlatformApi>,
    generator: Arc<dyn ContentGenerator>,
) -> Option<ApiWorker> {
    builtin_rules(name).map(|rules| ApiWorker::new(rules, api, generator))
}

/// Worker that enforces a platform's rules around external collaborators
pub struct ApiWorker {
    rules: &'static PlatformRules,
    api: Arc<dyn PlatformApi>,
    generator: Arc<dyn ContentGenerator>,
    clock: Arc<dyn Clock>,
}

impl ApiWorker {
    pub fn new(
        rules: &'static PlatformRules,
        api: Arc<dyn PlatformApi>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        Self {
            rules,
            api,
            generator,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for content and snapshot timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rules(&self) -> &'static PlatformRules {
        self.rules
    }
}

#[async_trait]
impl PlatformWorker for ApiWorker {
    fn name(&self) -> &str {
        self.rules.name
    }

    fn character_limit(&self) -> Option<usize> {
        Some(self.rules.character_limit)
    }

    fn supported_content_types(&self) -> &[ContentType] {
        self.rules.content_types
    }

    fn validate_content(&self, item: &ContentItem) -> PlatformResult<()> {
        self.rules.validate(item)
    }

    async fn generate(&self, task: &Task) -> PlatformResult<ContentItem> {
        if !self.rules.supports(task.payload.content_type) {
            return Err(PlatformError::Validation(format!(
                "{} does not support {} posts",
                self.rules.name, task.payload.content_type
            )));
        }

        let body = self
            .generator
            .generate(self.rules.name, &task.payload)
            .await
            .map_err(|e| classify_api_failure(&e))?;

        let item = ContentItem::draft(task, body, self.clock.now());
        self.rules.validate(&item)?;
        tracing::debug!(
            platform = self.rules.name,
            task_id = %task.id,
            content_id = %item.id,
            chars = item.body.char_count(),
            "content generated"
        );
        Ok(item)
    }

    async fn publish(&self, item: &ContentItem) -> PlatformResult<PublishResult> {
        self.rules.validate(item)?;
        let result = self
            .api
            .publish(item)
            .await
            .map_err(|e| classify_api_failure(&e))?;
        tracing::info!(
            platform = self.rules.name,
            content_id = %item.id,
            platform_post_id = %result.platform_post_id,
            "content published"
        );
        Ok(result)
    }

    async fn collect_metrics(&self, item: &ContentItem) -> PlatformResult<MetricSnapshot> {
        let post_id = item.platform_post_id.as_deref().ok_or_else(|| {
            PlatformError::Validation(format!("content {} has not been published", item.id))
        })?;

        let counters = self
            .api
            .fetch_metrics(post_id)
            .await
            .map_err(|e| classify_api_failure(&e))?;

        Ok(MetricSnapshot {
            content_id: item.id.clone(),
            platform: self.rules.name.to_string(),
            counters,
            collected_at: self.clock.now(),
        })
    }
}
