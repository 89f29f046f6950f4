//! X (Twitter) posting rules

use super::PlatformRules;
use crate::types::ContentType;

pub const RULES: PlatformRules = PlatformRules {
    name: "twitter",
    character_limit: 280,
    content_types: &[
        ContentType::Text,
        ContentType::Image,
        ContentType::Poll,
        ContentType::Video,
    ],
    max_hashtags: 3,
    media_required: false,
};
