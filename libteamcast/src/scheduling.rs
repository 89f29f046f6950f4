//! Scheduling and time parsing utilities
//!
//! Human-readable schedule strings for the CLI, and the posting slots used to
//! plan a content calendar from each platform's best times.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rand::Rng;

use crate::config::Config;
use crate::error::{Result, TeamcastError};

const MIN_RANDOM_SECONDS: i64 = 30;
const MAX_RANDOM_SECONDS: i64 = 30 * 24 * 3600; // 30 days

/// Parse a schedule string into a point in time
///
/// Supports multiple formats:
/// - `now`
/// - RFC 3339 timestamps: "2026-03-02T09:00:00Z"
/// - Relative durations: "1h", "30m", "2d"
/// - Natural language: "tomorrow 3pm", "next monday 10am"
/// - Random intervals after `last_scheduled` (or now): "random:10m-20m"
///
/// # Errors
///
/// Returns a `Validation` error if the string cannot be parsed.
pub fn parse_schedule(
    input: &str,
    now: DateTime<Utc>,
    last_scheduled: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    parse_schedule_with(input, now, last_scheduled, &mut rand::thread_rng())
}

pub fn parse_schedule_with<R: Rng + ?Sized>(
    input: &str,
    now: DateTime<Utc>,
    last_scheduled: Option<DateTime<Utc>>,
    rng: &mut R,
) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(invalid("Schedule string cannot be empty"));
    }
    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Some(range) = input.strip_prefix("random:") {
        let (min, max) = parse_random_range(range)?;
        let base = last_scheduled.unwrap_or(now);
        let secs = rng.gen_range(min.num_seconds()..=max.num_seconds());
        return Ok(base + Duration::seconds(secs));
    }

    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Ok(at.with_timezone(&Utc));
    }

    if let Ok(duration) = parse_duration(input) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us)
        .map_err(|_| invalid(format!("Could not parse schedule string: {}", input)))
}

fn invalid(message: impl Into<String>) -> TeamcastError {
    TeamcastError::Validation(message.into())
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| invalid(format!("Could not parse duration '{}': {}", input, e)))?;
    Duration::from_std(std_duration).map_err(|_| invalid("Duration out of range"))
}

/// Parse and check "MIN-MAX"
fn parse_random_range(range: &str) -> Result<(Duration, Duration)> {
    let (min, max) = range
        .split_once('-')
        .ok_or_else(|| invalid("Random format must be random:MIN-MAX"))?;
    let min = parse_duration(min.trim())?;
    let max = parse_duration(max.trim())?;

    if min.num_seconds() < MIN_RANDOM_SECONDS {
        return Err(invalid(format!(
            "Minimum random interval must be at least {} seconds",
            MIN_RANDOM_SECONDS
        )));
    }
    if max.num_seconds() > MAX_RANDOM_SECONDS {
        return Err(invalid(format!(
            "Maximum random interval must be less than {} days",
            MAX_RANDOM_SECONDS / (24 * 3600)
        )));
    }
    if min >= max {
        return Err(invalid("Minimum must be less than maximum"));
    }
    Ok((min, max))
}

/// Posting slots for every enabled platform over `days` days from `start`
///
/// Each day gets the platform's first `posts_per_day` best times; a platform
/// with fewer best times than posts per day also posts at noon. Slots are
/// returned in time order (platform name breaks ties) and may lie in the
/// past; callers skip those.
pub fn plan_slots(config: &Config, start: NaiveDate, days: u32) -> Vec<(String, DateTime<Utc>)> {
    let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default();
    let mut slots = Vec::new();

    for (name, platform) in config.platforms.iter().filter(|(_, p)| p.enabled) {
        let mut times = platform.posting_times();
        times.truncate(platform.posts_per_day as usize);
        if times.len() < platform.posts_per_day as usize && !times.contains(&noon) {
            times.push(noon);
        }
        times.sort();

        for offset in 0..days {
            let Some(date) = start.checked_add_signed(Duration::days(offset as i64)) else {
                break;
            };
            for time in &times {
                slots.push((name.clone(), date.and_time(*time).and_utc()));
            }
        }
    }

    slots.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
    slots
}
