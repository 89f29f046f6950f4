//! Notification stream for task lifecycle changes
//!
//! The coordinator publishes every state transition here. Delivery is
//! fire-and-forget over `tokio::sync::broadcast`: with no subscribers events
//! are dropped, and a lagging subscriber loses the oldest events rather than
//! slowing the dispatcher down.
//!
//! # Example
//!
//! ```no_run
//! use libteamcast::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(64);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::TaskCancelled {
//!     task_id: "abc123".to_string(),
//!     platform: "facebook".to_string(),
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{}", serde_json::to_string(&event).unwrap());
//! }
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ErrorClass;
use crate::types::{EngagementCounters, TaskKind, TaskState};

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Publish an event; never blocks and never fails
    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskScheduled {
        task_id: String,
        platform: String,
        kind: TaskKind,
        scheduled_at: DateTime<Utc>,
        /// Set for follow-up tasks created by the pipeline
        parent_id: Option<String>,
    },

    TaskStateChanged {
        task_id: String,
        platform: String,
        kind: TaskKind,
        from: TaskState,
        to: TaskState,
        attempt: u32,
        error_class: Option<ErrorClass>,
        error: Option<String>,
    },

    TaskCancelled {
        task_id: String,
        platform: String,
    },

    /// Dispatch deferred because the platform's quota window is used up
    RateLimited {
        platform: String,
        retry_after_ms: i64,
    },

    /// A ready task has waited longer than the configured lag
    TaskStale {
        task_id: String,
        platform: String,
        waited_secs: i64,
        expired: bool,
    },

    ContentPublished {
        content_id: String,
        task_id: String,
        platform: String,
        platform_post_id: String,
    },

    MetricsRecorded {
        content_id: String,
        platform: String,
        counters: EngagementCounters,
        collected_at: DateTime<Utc>,
    },

    /// A dispatch pass stopped early because storage failed
    TickHalted { error: String },
}
