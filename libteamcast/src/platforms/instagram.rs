//! Instagram posting rules
//!
//! Instagram has no text-only posts: every item needs an image or video.

use super::PlatformRules;
use crate::types::ContentType;

pub const RULES: PlatformRules = PlatformRules {
    name: "instagram",
    character_limit: 2_200,
    content_types: &[
        ContentType::Image,
        ContentType::Carousel,
        ContentType::Reel,
        ContentType::Video,
    ],
    max_hashtags: 30,
    media_required: true,
};
