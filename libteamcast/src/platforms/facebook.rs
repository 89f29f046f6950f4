//! Facebook page posting rules

use super::PlatformRules;
use crate::types::ContentType;

pub const RULES: PlatformRules = PlatformRules {
    name: "facebook",
    character_limit: 63_206,
    content_types: &[
        ContentType::Text,
        ContentType::Image,
        ContentType::Link,
        ContentType::Video,
    ],
    max_hashtags: 5,
    media_required: false,
};
