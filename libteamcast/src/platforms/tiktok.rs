//! TikTok posting rules

use super::PlatformRules;
use crate::types::ContentType;

pub const RULES: PlatformRules = PlatformRules {
    name: "tiktok",
    character_limit: 2_200,
    content_types: &[ContentType::Video],
    max_hashtags: 7,
    media_required: true,
};
