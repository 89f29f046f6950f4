//! Configuration management for Teamcast
//!
//! Configuration is static: it is loaded once at startup, validated, and
//! handed to the coordinator. Anything wrong with it is a `ConfigError` and
//! stops the process before any task is dispatched.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Jitter at or above this ratio can make a longer backoff shorter than the
/// previous one
pub const MAX_JITTER_RATIO: f64 = 1.0 / 3.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on the time between two dispatch passes
    pub tick_interval_ms: u64,
    /// How far in the past a new task may be scheduled
    pub schedule_grace_secs: u64,
    /// Per-subscriber buffer of the notification stream
    pub event_capacity: usize,
    pub staleness: StalenessConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            schedule_grace_secs: 60,
            event_capacity: 256,
            staleness: StalenessConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn schedule_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.schedule_grace_secs as i64)
    }
}

/// What to do with a `ready` task that keeps waiting for a pool slot or quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StalenessPolicy {
    /// Keep waiting in normal order
    #[default]
    Wait,
    /// Order stale tasks after every fresh ready task
    Deprioritize,
    /// Emit a `TaskStale` event and a warning once per task
    Escalate,
    /// Cancel the task
    Expire,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    /// A ready task older than this (measured from `scheduled_at`) is stale.
    /// Unset means tasks never go stale.
    pub max_ready_lag_secs: Option<u64>,
    pub policy: StalenessPolicy,
}

impl StalenessConfig {
    pub fn max_ready_lag(&self) -> Option<chrono::Duration> {
        self.max_ready_lag_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added or removed at random
    pub jitter_ratio: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.1,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Enqueue a publish task when a generate task succeeds
    pub auto_publish: bool,
    /// Enqueue a collect_metrics task this long after a publish succeeds
    pub collect_metrics_after_secs: Option<u64>,
    /// Generated drafts wait for [`crate::Coordinator::approve`] before they
    /// can be published
    pub require_approval: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_publish: true,
            collect_metrics_after_secs: Some(24 * 3600),
            require_approval: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub rate_limit: RateLimitConfig,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    /// Preferred posting times, "HH:MM" in UTC
    #[serde(default)]
    pub best_times: Vec<String>,
    #[serde(default = "default_posts_per_day")]
    pub posts_per_day: u32,
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    2
}

fn default_posts_per_day() -> u32 {
    1
}

impl PlatformConfig {
    /// Parsed `best_times`; call after `Config::validate`
    pub fn posting_times(&self) -> Vec<NaiveTime> {
        self.best_times
            .iter()
            .filter_map(|t| NaiveTime::parse_from_str(t, "%H:%M").ok())
            .collect()
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load and validate configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordinator cannot run with
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "scheduler.tick_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.scheduler.event_capacity == 0 {
            return Err(ConfigError::invalid(
                "scheduler.event_capacity",
                "must be greater than zero",
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if retry.base_delay_ms == 0 {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must be greater than zero",
            ));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "must not be smaller than retry.base_delay_ms",
            ));
        }
        if !(0.0..MAX_JITTER_RATIO).contains(&retry.jitter_ratio) {
            return Err(ConfigError::invalid(
                "retry.jitter_ratio",
                format!("must be in [0, {:.2})", MAX_JITTER_RATIO),
            ));
        }

        if self.platforms.values().all(|p| !p.enabled) {
            return Err(ConfigError::MissingField(
                "platforms (at least one enabled platform)".to_string(),
            ));
        }

        for (name, platform) in &self.platforms {
            if name.trim().is_empty() || name.chars().any(|c| c.is_uppercase()) {
                return Err(ConfigError::invalid(
                    format!("platforms.{}", name),
                    "platform names must be non-empty lowercase identifiers",
                ));
            }
            if platform.rate_limit.limit == 0 {
                return Err(ConfigError::invalid(
                    format!("platforms.{}.rate_limit.limit", name),
                    "must be greater than zero",
                ));
            }
            if platform.rate_limit.window_secs == 0 {
                return Err(ConfigError::invalid(
                    format!("platforms.{}.rate_limit.window_secs", name),
                    "must be greater than zero",
                ));
            }
            if platform.max_concurrency == 0 {
                return Err(ConfigError::invalid(
                    format!("platforms.{}.max_concurrency", name),
                    "must be greater than zero",
                ));
            }
            for time in &platform.best_times {
                if NaiveTime::parse_from_str(time, "%H:%M").is_err() {
                    return Err(ConfigError::invalid(
                        format!("platforms.{}.best_times", name),
                        format!("'{}' is not a HH:MM time", time),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Names of enabled platforms, in stable order
    pub fn enabled_platforms(&self) -> Vec<String> {
        self.platforms
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformConfig> {
        self.platforms.get(name).filter(|p| p.enabled)
    }

    /// Create a default configuration covering the four built-in platforms
    pub fn default_config() -> Self {
        let platform = |limit: u32, per_day: u32, times: &[&str]| PlatformConfig {
            enabled: true,
            rate_limit: RateLimitConfig {
                limit,
                window_secs: 3600,
            },
            max_concurrency: 2,
            best_times: times.iter().map(|t| t.to_string()).collect(),
            posts_per_day: per_day,
        };

        let mut platforms = BTreeMap::new();
        platforms.insert(
            "facebook".to_string(),
            platform(25, 2, &["09:00", "15:00", "19:00"]),
        );
        platforms.insert(
            "twitter".to_string(),
            platform(50, 5, &["08:00", "12:00", "15:00", "17:00", "20:00"]),
        );
        platforms.insert(
            "instagram".to_string(),
            platform(25, 1, &["11:00", "17:00", "21:00"]),
        );
        platforms.insert(
            "tiktok".to_string(),
            platform(10, 1, &["12:00", "19:00", "21:00"]),
        );

        Self {
            database: DatabaseConfig {
                path: "~/.local/share/teamcast/teamcast.db".to_string(),
            },
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            pipeline: PipelineConfig::default(),
            platforms,
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TEAMCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("teamcast").join("config.toml"))
}

/// Resolve the database path, honouring `TEAMCAST_DB_PATH`
pub fn resolve_db_path(configured: &str) -> PathBuf {
    let raw = std::env::var("TEAMCAST_DB_PATH").unwrap_or_else(|_| configured.to_string());
    PathBuf::from(shellexpand::tilde(&raw).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SAMPLE: &str = r#"
[database]
path = "/tmp/teamcast-test.db"

[scheduler]
tick_interval_ms = 250

[scheduler.staleness]
max_ready_lag_secs = 600
policy = "escalate"

[retry]
base_delay_ms = 1000
max_delay_ms = 8000
jitter_ratio = 0.1
max_attempts = 4

[platforms.facebook]
max_concurrency = 1
best_times = ["09:00", "15:00"]
posts_per_day = 2

[platforms.facebook.rate_limit]
limit = 1
window_secs = 60

[platforms.tiktok]
enabled = false

[platforms.tiktok.rate_limit]
limit = 5
window_secs = 3600
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.scheduler.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.scheduler.schedule_grace_secs, 60);
        assert_eq!(config.scheduler.staleness.policy, StalenessPolicy::Escalate);
        assert_eq!(config.retry.max_attempts, 4);
        assert!(config.pipeline.auto_publish);
        assert!(!config.pipeline.require_approval);

        let facebook = config.platform("facebook").unwrap();
        assert_eq!(facebook.rate_limit.limit, 1);
        assert_eq!(facebook.max_concurrency, 1);
        assert_eq!(facebook.posting_times().len(), 2);

        assert!(config.platform("tiktok").is_none());
        assert_eq!(config.enabled_platforms(), vec!["facebook".to_string()]);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default_config();
        config.validate().unwrap();
        assert_eq!(config.enabled_platforms().len(), 4);
    }

    #[test]
    fn test_rejects_zero_rate_limit() {
        let mut config = Config::default_config();
        config.platforms.get_mut("twitter").unwrap().rate_limit.limit = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("platforms.twitter.rate_limit.limit"));
    }

    #[test]
    fn test_rejects_large_jitter() {
        let mut config = Config::default_config();
        config.retry.jitter_ratio = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_base_delay_above_cap() {
        let mut config = Config::default_config();
        config.retry.base_delay_ms = 10_000;
        config.retry.max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_best_time() {
        let mut config = Config::default_config();
        config
            .platforms
            .get_mut("instagram")
            .unwrap()
            .best_times
            .push("25:99".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("25:99"));
    }

    #[test]
    fn test_rejects_no_enabled_platform() {
        let mut config = Config::default_config();
        for platform in config.platforms.values_mut() {
            platform.enabled = false;
        }
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let result = Config::from_toml("[database\npath = 1");
        assert!(matches!(
            result,
            Err(crate::TeamcastError::Config(ConfigError::ParseError(_)))
        ));
    }

    #[test]
    #[serial]
    fn test_config_path_from_env() {
        std::env::set_var("TEAMCAST_CONFIG", "/tmp/custom-teamcast.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("TEAMCAST_CONFIG");
        assert_eq!(path, PathBuf::from("/tmp/custom-teamcast.toml"));
    }

    #[test]
    #[serial]
    fn test_db_path_env_override() {
        std::env::set_var("TEAMCAST_DB_PATH", "/tmp/override.db");
        let path = resolve_db_path("~/ignored.db");
        std::env::remove_var("TEAMCAST_DB_PATH");
        assert_eq!(path, PathBuf::from("/tmp/override.db"));
    }
}
