//! Teamcast - coordination core for scheduled social media content
//!
//! A single [`Coordinator`] owns the content calendar. It promotes due tasks,
//! dispatches them to per-platform workers under rate limits and concurrency
//! bounds, retries transient failures with backoff, and aggregates
//! engagement metrics into reports.

pub mod calendar;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod platforms;
pub mod rate_limiter;
pub mod retry;
pub mod scheduling;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::{Coordinator, RestoreSummary, TickSummary};
pub use db::Database;
pub use error::{ErrorClass, PlatformError, Result, TeamcastError};
pub use events::{Event, EventBus};
pub use metrics::{Report, ReportWindow};
pub use platforms::PlatformWorker;
pub use store::{MemoryStorage, Storage};
pub use types::{
    ContentItem, ContentRequest, ContentStatus, ContentType, EngagementCounters, MetricSnapshot,
    Task, TaskKind, TaskState,
};
