//! SQLite persistence for Teamcast

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, ErrorClass, Result};
use crate::rate_limiter::RateLimitState;
use crate::store::Storage;
use crate::types::{
    ContentBody, ContentItem, EngagementCounters, MetricSnapshot, Task, TaskFailure, TaskPayload,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file on first use
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database, for tests and dry runs
    pub async fn in_memory() -> Result<Self> {
        // every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Look up a single task
    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(
            r#"
            SELECT id, platform, kind, payload, scheduled_at, state, attempt_count,
                   last_error_class, last_error_message, created_at, updated_at,
                   sequence, parent_id
            FROM tasks WHERE id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| task_from_row(&r)).transpose()
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(table: &'static str, millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        DbError::Corrupt {
            table,
            reason: format!("timestamp {} out of range", millis),
        }
        .into()
    })
}

fn parse_column<T: std::str::FromStr<Err = String>>(table: &'static str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|reason| DbError::Corrupt { table, reason }.into())
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    const TABLE: &str = "tasks";

    let payload: TaskPayload =
        serde_json::from_str(row.get::<&str, _>("payload")).map_err(DbError::Serialization)?;

    let class: Option<String> = row.get("last_error_class");
    let message: Option<String> = row.get("last_error_message");
    let last_error = match class.as_deref() {
        Some("transient") => Some(ErrorClass::Transient),
        Some("fatal") => Some(ErrorClass::Fatal),
        Some(other) => {
            return Err(DbError::Corrupt {
                table: TABLE,
                reason: format!("unknown error class '{}'", other),
            }
            .into())
        }
        None => None,
    }
    .map(|class| TaskFailure {
        class,
        message: message.unwrap_or_default(),
    });

    Ok(Task {
        id: row.get("id"),
        platform: row.get("platform"),
        kind: parse_column(TABLE, row.get::<&str, _>("kind"))?,
        payload,
        scheduled_at: from_millis(TABLE, row.get("scheduled_at"))?,
        state: parse_column(TABLE, row.get::<&str, _>("state"))?,
        attempt_count: row.get::<i64, _>("attempt_count") as u32,
        last_error,
        created_at: from_millis(TABLE, row.get("created_at"))?,
        updated_at: from_millis(TABLE, row.get("updated_at"))?,
        sequence: row.get::<i64, _>("sequence") as u64,
        parent_id: row.get("parent_id"),
    })
}

fn content_from_row(row: &SqliteRow) -> Result<ContentItem> {
    const TABLE: &str = "content_items";

    let body: ContentBody =
        serde_json::from_str(row.get::<&str, _>("body")).map_err(DbError::Serialization)?;
    let published_at = row
        .get::<Option<i64>, _>("published_at")
        .map(|ms| from_millis(TABLE, ms))
        .transpose()?;

    Ok(ContentItem {
        id: row.get("id"),
        task_id: row.get("task_id"),
        platform: row.get("platform"),
        topic: row.get("topic"),
        content_type: parse_column(TABLE, row.get::<&str, _>("content_type"))?,
        body,
        status: parse_column(TABLE, row.get::<&str, _>("status"))?,
        platform_post_id: row.get("platform_post_id"),
        created_at: from_millis(TABLE, row.get("created_at"))?,
        published_at,
    })
}

#[async_trait]
impl Storage for Database {
    async fn save_task(&self, task: &Task) -> Result<bool> {
        let payload = serde_json::to_string(&task.payload).map_err(DbError::Serialization)?;
        let (error_class, error_message) = match &task.last_error {
            Some(failure) => (
                Some(failure.class.to_string()),
                Some(failure.message.clone()),
            ),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, platform, kind, payload, scheduled_at, state, attempt_count,
                               last_error_class, last_error_message, created_at, updated_at,
                               sequence, parent_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                scheduled_at = excluded.scheduled_at,
                state = excluded.state,
                attempt_count = excluded.attempt_count,
                last_error_class = excluded.last_error_class,
                last_error_message = excluded.last_error_message,
                updated_at = excluded.updated_at
            WHERE tasks.state != 'cancelled'
            "#,
        )
        .bind(&task.id)
        .bind(&task.platform)
        .bind(task.kind.as_str())
        .bind(payload)
        .bind(to_millis(task.scheduled_at))
        .bind(task.state.as_str())
        .bind(task.attempt_count as i64)
        .bind(error_class)
        .bind(error_message)
        .bind(to_millis(task.created_at))
        .bind(to_millis(task.updated_at))
        .bind(task.sequence as i64)
        .bind(&task.parent_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET state = 'cancelled', updated_at = ?
            WHERE id = ? AND state IN ('pending', 'ready')
            "#,
        )
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT id, platform, kind, payload, scheduled_at, state, attempt_count,
                   last_error_class, last_error_message, created_at, updated_at,
                   sequence, parent_id
            FROM tasks ORDER BY sequence ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(task_from_row).collect()
    }

    async fn load_open_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT id, platform, kind, payload, scheduled_at, state, attempt_count,
                   last_error_class, last_error_message, created_at, updated_at,
                   sequence, parent_id
            FROM tasks
            WHERE state NOT IN ('succeeded', 'failed_fatal', 'cancelled')
            ORDER BY sequence ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(task_from_row).collect()
    }

    async fn save_content(&self, item: &ContentItem) -> Result<()> {
        let body = serde_json::to_string(&item.body).map_err(DbError::Serialization)?;

        sqlx::query(
            r#"
            INSERT INTO content_items (id, task_id, platform, topic, content_type, body, status,
                                       platform_post_id, created_at, published_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                body = excluded.body,
                status = excluded.status,
                platform_post_id = excluded.platform_post_id,
                published_at = excluded.published_at
            "#,
        )
        .bind(&item.id)
        .bind(&item.task_id)
        .bind(&item.platform)
        .bind(&item.topic)
        .bind(item.content_type.as_str())
        .bind(body)
        .bind(item.status.as_str())
        .bind(&item.platform_post_id)
        .bind(to_millis(item.created_at))
        .bind(item.published_at.map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn load_content(&self) -> Result<Vec<ContentItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, platform, topic, content_type, body, status,
                   platform_post_id, created_at, published_at
            FROM content_items ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(content_from_row).collect()
    }

    async fn append_snapshot(&self, snapshot: &MetricSnapshot) -> Result<()> {
        let counters = &snapshot.counters;
        sqlx::query(
            r#"
            INSERT INTO metric_snapshots (content_id, platform, likes, shares, comments,
                                          impressions, collected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.content_id)
        .bind(&snapshot.platform)
        .bind(counters.likes as i64)
        .bind(counters.shares as i64)
        .bind(counters.comments as i64)
        .bind(counters.impressions as i64)
        .bind(to_millis(snapshot.collected_at))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn load_snapshots(&self) -> Result<Vec<MetricSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT content_id, platform, likes, shares, comments, impressions, collected_at
            FROM metric_snapshots ORDER BY collected_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| -> Result<MetricSnapshot> {
                Ok(MetricSnapshot {
                    content_id: r.get("content_id"),
                    platform: r.get("platform"),
                    counters: EngagementCounters {
                        likes: r.get::<i64, _>("likes") as u64,
                        shares: r.get::<i64, _>("shares") as u64,
                        comments: r.get::<i64, _>("comments") as u64,
                        impressions: r.get::<i64, _>("impressions") as u64,
                    },
                    collected_at: from_millis("metric_snapshots", r.get("collected_at"))?,
                })
            })
            .collect()
    }

    async fn save_rate_limit(&self, platform: &str, state: &RateLimitState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (platform, window_start, used_count, limit_count, window_secs)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(platform) DO UPDATE SET
                window_start = excluded.window_start,
                used_count = excluded.used_count,
                limit_count = excluded.limit_count,
                window_secs = excluded.window_secs
            "#,
        )
        .bind(platform)
        .bind(to_millis(state.window_start))
        .bind(state.used_count as i64)
        .bind(state.limit as i64)
        .bind(state.window_secs as i64)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn load_rate_limits(&self) -> Result<Vec<(String, RateLimitState)>> {
        let rows = sqlx::query(
            r#"
            SELECT platform, window_start, used_count, limit_count, window_secs
            FROM rate_limits
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| -> Result<(String, RateLimitState)> {
                let state = RateLimitState {
                    window_start: from_millis("rate_limits", r.get("window_start"))?,
                    used_count: r.get::<i64, _>("used_count") as u32,
                    limit: r.get::<i64, _>("limit_count") as u32,
                    window_secs: r.get::<i64, _>("window_secs") as u64,
                };
                Ok((r.get("platform"), state))
            })
            .collect()
    }
}
