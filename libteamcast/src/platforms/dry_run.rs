//! Collaborators that never leave the process
//!
//! Used by `team-lead run --dry-run`: the full pipeline runs, but publishing
//! only logs and returns synthetic ids, and content comes from a template.

use async_trait::async_trait;
use tracing::info;

use super::{ApiFailure, ContentGenerator, PlatformApi};
use crate::types::{
    ContentBody, ContentItem, EngagementCounters, MediaRef, PublishResult, TaskPayload,
};

/// Publishing API that logs instead of posting
pub struct DryRunApi {
    platform: String,
}

impl DryRunApi {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
        }
    }
}

#[async_trait]
impl PlatformApi for DryRunApi {
    async fn publish(&self, item: &ContentItem) -> Result<PublishResult, ApiFailure> {
        let post_id = format!("dry-run-{}-{}", self.platform, uuid::Uuid::new_v4());
        info!(
            platform = %self.platform,
            content_id = %item.id,
            post_id = %post_id,
            chars = item.body.char_count(),
            "[dry run] would publish"
        );
        Ok(PublishResult {
            platform_post_id: post_id,
            url: None,
        })
    }

    async fn fetch_metrics(&self, platform_post_id: &str) -> Result<EngagementCounters, ApiFailure> {
        info!(
            platform = %self.platform,
            post_id = platform_post_id,
            "[dry run] would fetch metrics"
        );
        Ok(EngagementCounters::default())
    }
}

/// Generator that fills a fixed template from the topic
#[derive(Debug, Clone)]
pub struct TemplateGenerator {
    template: String,
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self::new("{topic}")
    }
}

impl TemplateGenerator {
    /// `template` may contain `{topic}` and `{platform}` placeholders
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }

    fn hashtags(topic: &str) -> Vec<String> {
        topic
            .split_whitespace()
            .map(|word| {
                word.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|word| word.len() > 3)
            .take(2)
            .map(|word| format!("#{}", word))
            .collect()
    }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(
        &self,
        platform: &str,
        payload: &TaskPayload,
    ) -> Result<ContentBody, ApiFailure> {
        if payload.topic.trim().is_empty() {
            return Err(ApiFailure::http(400, "topic is empty"));
        }

        let text = self
            .template
            .replace("{topic}", &payload.topic)
            .replace("{platform}", platform);

        let media = if payload.content_type.requires_media() {
            vec![MediaRef {
                location: format!("dry-run://media/{}", uuid::Uuid::new_v4()),
                alt_text: Some(payload.topic.clone()),
            }]
        } else {
            vec![]
        };

        Ok(ContentBody {
            text,
            media,
            hashtags: Self::hashtags(&payload.topic),
        })
    }
}
