//! team-lead - Scheduling daemon and content calendar management
//!
//! Runs the coordinator that dispatches scheduled tasks to platform workers,
//! and offers subcommands to schedule, cancel, list and report on tasks.

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use libteamcast::config::resolve_db_path;
use libteamcast::error::ConfigError;
use libteamcast::logging::{LogFormat, LoggingConfig};
use libteamcast::platforms::builtin_worker;
use libteamcast::platforms::dry_run::{DryRunApi, TemplateGenerator};
use libteamcast::{
    Config, ContentRequest, ContentType, Coordinator, Database, PlatformWorker, Report,
    ReportWindow, Result, SystemClock, Task, TaskKind, TaskState, TeamcastError,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "team-lead")]
#[command(version)]
#[command(about = "Coordinate scheduled social media content")]
#[command(long_about = "\
team-lead - Coordinate scheduled social media content

DESCRIPTION:
    team-lead owns the content calendar. The `run` command starts the
    coordinator: due tasks are dispatched to per-platform workers within
    each platform's rate limit and concurrency bound, transient failures
    are retried with exponential backoff, and engagement metrics are
    collected after publishing.

    The other commands manage the calendar stored in the database. A
    running daemon picks up tasks scheduled or cancelled by them.

USAGE:
    # Run the coordinator with logging-only publishing
    team-lead run --dry-run

    # Process due tasks once and exit
    team-lead run --dry-run --once

    # Schedule content generation
    team-lead schedule twitter \"tomorrow 9am\" --topic \"spring launch\"

    # Release a generated draft (with pipeline.require_approval)
    team-lead approve <CONTENT_ID> \"tomorrow 9am\"

    # Plan a week of content at each platform's best times
    team-lead plan --days 7 --topic \"spring launch\"

    # Weekly engagement report
    team-lead report --days 7

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (waits for in-flight tasks)

CONFIGURATION:
    Configuration file: ~/.config/teamcast/config.toml
    Database location: ~/.local/share/teamcast/teamcast.db

    Override with environment variables:
        TEAMCAST_CONFIG      - Path to config file
        TEAMCAST_DB_PATH     - Path to database file
        TEAMCAST_LOG_FORMAT  - text, json or pretty
        TEAMCAST_LOG_LEVEL   - Log level (default: info)

EXIT CODES:
    0 - Success
    1 - Runtime error
    2 - Configuration or authentication error
    3 - Invalid input (bad task id, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(long, global = true, env = "TEAMCAST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log output format: text, json or pretty
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the coordinator until SIGINT/SIGTERM
    Run {
        /// Dispatch due tasks once, wait for them, and exit
        #[arg(long)]
        once: bool,

        /// Log instead of publishing; content comes from a template
        #[arg(long)]
        dry_run: bool,

        /// Upper bound between dispatch passes (overrides config)
        #[arg(long, value_name = "MILLISECONDS")]
        tick_ms: Option<u64>,

        /// Print every event as a JSON line on stdout
        #[arg(long)]
        events: bool,
    },

    /// Schedule a task
    Schedule {
        /// Platform name (e.g. twitter)
        platform: String,

        /// When to run (e.g. "now", "30m", "tomorrow 3pm", "random:10m-1h")
        when: String,

        /// Task kind: generate, publish or collect_metrics
        #[arg(short, long, default_value = "generate")]
        kind: TaskKind,

        /// Topic for generated content
        #[arg(short, long)]
        topic: Option<String>,

        /// Content type (defaults to the platform's first supported type)
        #[arg(long)]
        content_type: Option<ContentType>,

        /// Content item for publish and collect_metrics tasks
        #[arg(long)]
        content_id: Option<String>,
    },

    /// Cancel a pending or ready task
    Cancel {
        /// Task ID to cancel
        task_id: String,
    },

    /// Approve a generated draft and schedule it for publishing
    Approve {
        /// Content ID of the draft
        content_id: String,

        /// When to publish (e.g. "now", "2h", "tomorrow 9am")
        #[arg(default_value = "now")]
        when: String,
    },

    /// List drafts waiting for approval
    Drafts {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List tasks
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Filter by platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Filter by state (e.g. pending, failed_fatal)
        #[arg(short, long)]
        state: Option<TaskState>,
    },

    /// Engagement and delivery report
    Report {
        /// Number of days ending now
        #[arg(short, long, default_value_t = 7)]
        days: u32,

        /// Limit to one platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Schedule generate tasks at each platform's best posting times
    Plan {
        /// Number of days to plan
        #[arg(short, long, default_value_t = 7)]
        days: u32,

        /// First day (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Topic for the generated content
        #[arg(short, long)]
        topic: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env(cli.verbose);
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    logging.init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<TeamcastError>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Run {
            once,
            dry_run,
            tick_ms,
            events,
        } => cmd_run(config, once, dry_run, tick_ms, events).await?,
        Commands::Schedule {
            platform,
            when,
            kind,
            topic,
            content_type,
            content_id,
        } => {
            let request = ScheduleArgs {
                kind,
                topic,
                content_type,
                content_id,
            };
            cmd_schedule(config, &platform, &when, request).await?
        }
        Commands::Cancel { task_id } => cmd_cancel(config, &task_id).await?,
        Commands::Approve { content_id, when } => cmd_approve(config, &content_id, &when).await?,
        Commands::Drafts { format } => cmd_drafts(config, &format).await?,
        Commands::List {
            format,
            platform,
            state,
        } => cmd_list(config, &format, platform.as_deref(), state).await?,
        Commands::Report {
            days,
            platform,
            format,
        } => cmd_report(config, days, platform.as_deref(), &format).await?,
        Commands::Plan { days, start, topic } => cmd_plan(config, days, start, &topic).await?,
    }

    Ok(())
}

/// Workers that log instead of publishing
fn dry_run_workers(config: &Config) -> Vec<Arc<dyn PlatformWorker>> {
    config
        .enabled_platforms()
        .iter()
        .filter_map(|name| {
            builtin_worker(
                name,
                Arc::new(DryRunApi::new(name)),
                Arc::new(TemplateGenerator::default()),
            )
        })
        .map(|worker| Arc::new(worker) as Arc<dyn PlatformWorker>)
        .collect()
}

/// Open the database and build a coordinator over it
async fn open(config: Config) -> Result<Coordinator> {
    let db_path = resolve_db_path(&config.database.path);
    let db = Database::new(&db_path.to_string_lossy()).await?;
    let workers = dry_run_workers(&config);
    Coordinator::new(config, workers, Arc::new(db), Arc::new(SystemClock))
}

/// Coordinator for a management command, loaded without touching the
/// daemon's in-flight tasks
async fn open_loaded(config: Config) -> Result<Coordinator> {
    let coordinator = open(config).await?;
    coordinator.load().await?;
    Ok(coordinator)
}

fn check_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(TeamcastError::Validation(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

async fn cmd_run(
    mut config: Config,
    once: bool,
    dry_run: bool,
    tick_ms: Option<u64>,
    events: bool,
) -> anyhow::Result<()> {
    if let Some(ms) = tick_ms {
        config.scheduler.tick_interval_ms = ms;
        config.validate().map_err(TeamcastError::from)?;
    }
    if !dry_run {
        return Err(TeamcastError::from(ConfigError::MissingField(
            "publishing API client (only --dry-run is available)".to_string(),
        ))
        .into());
    }

    let coordinator = open(config).await?;
    let restored = coordinator.restore().await?;
    info!(
        tasks = restored.tasks,
        interrupted = restored.interrupted,
        "team-lead starting"
    );

    if events {
        let mut receiver = coordinator.subscribe();
        tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                match receiver.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!(error = %e, "could not serialise event"),
                    },
                    Err(RecvError::Lagged(missed)) => warn!(missed, "event output lagging"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    if once {
        let summary = coordinator.tick().await?;
        coordinator.wait_idle().await?;
        info!(
            dispatched = summary.dispatched,
            rate_limited = summary.rate_limited,
            "processed due tasks once, exiting"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx).context("Signal setup failed")?;
    coordinator.run(shutdown_rx).await?;
    info!("team-lead stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_listener(shutdown: watch::Sender<bool>) -> std::io::Result<()> {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "received shutdown signal, stopping gracefully");
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listener(shutdown: watch::Sender<bool>) -> std::io::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C, stopping gracefully");
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}

struct ScheduleArgs {
    kind: TaskKind,
    topic: Option<String>,
    content_type: Option<ContentType>,
    content_id: Option<String>,
}

async fn cmd_schedule(
    config: Config,
    platform: &str,
    when: &str,
    args: ScheduleArgs,
) -> anyhow::Result<()> {
    let coordinator = open_loaded(config).await?;
    let now = Utc::now();

    let last_scheduled = coordinator
        .tasks()
        .await
        .iter()
        .filter(|t| t.platform == platform && t.state == TaskState::Pending)
        .map(|t| t.scheduled_at)
        .max();
    let at = libteamcast::scheduling::parse_schedule(when, now, last_scheduled)?;

    let request = match args.kind {
        TaskKind::Generate => {
            let topic = args.topic.ok_or_else(|| {
                TeamcastError::Validation("--topic is required for generate tasks".to_string())
            })?;
            let content_type = args
                .content_type
                .or_else(|| coordinator.default_content_type(platform))
                .unwrap_or(ContentType::Text);
            ContentRequest::generate(topic, content_type)
        }
        kind => {
            let content_id = args.content_id.ok_or_else(|| {
                TeamcastError::Validation(format!("--content-id is required for {} tasks", kind))
            })?;
            let item = coordinator.content(&content_id).await.ok_or_else(|| {
                TeamcastError::Validation(format!("content {} does not exist", content_id))
            })?;
            if kind == TaskKind::Publish {
                ContentRequest::publish(&item)
            } else {
                ContentRequest::collect_metrics(&item)
            }
        }
    };

    let id = coordinator.schedule(platform, request, at).await?;
    println!("{}", id);
    Ok(())
}

async fn cmd_cancel(config: Config, task_id: &str) -> anyhow::Result<()> {
    let coordinator = open_loaded(config).await?;
    if coordinator.cancel(task_id).await? {
        println!("Cancelled task {}", task_id);
        Ok(())
    } else {
        let state = coordinator
            .task(task_id)
            .await
            .map(|t| t.state.to_string())
            .unwrap_or_default();
        Err(TeamcastError::Validation(format!(
            "task {} is {} and can no longer be cancelled",
            task_id, state
        ))
        .into())
    }
}

async fn cmd_approve(config: Config, content_id: &str, when: &str) -> anyhow::Result<()> {
    let coordinator = open_loaded(config).await?;
    let at = libteamcast::scheduling::parse_schedule(when, Utc::now(), None)?;
    let id = coordinator.approve(content_id, at).await?;
    println!("{}", id);
    Ok(())
}

async fn cmd_drafts(config: Config, format: &str) -> anyhow::Result<()> {
    check_format(format)?;
    let coordinator = open_loaded(config).await?;
    let drafts = coordinator.drafts().await;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&drafts)?);
        return Ok(());
    }
    for item in &drafts {
        println!(
            "{} | {} | {} | {} | {}",
            item.id,
            item.platform,
            item.content_type,
            item.created_at.format("%Y-%m-%d %H:%M"),
            item.body.text.lines().next().unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_list(
    config: Config,
    format: &str,
    platform: Option<&str>,
    state: Option<TaskState>,
) -> anyhow::Result<()> {
    check_format(format)?;
    let coordinator = open_loaded(config).await?;

    let mut tasks = coordinator.tasks().await;
    tasks.retain(|t| platform.map(|p| t.platform == p).unwrap_or(true));
    tasks.retain(|t| state.map(|s| t.state == s).unwrap_or(true));

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        output_list_text(&tasks);
    }
    Ok(())
}

fn output_list_text(tasks: &[Task]) {
    let now = Utc::now();
    for task in tasks {
        let when = match task.state {
            TaskState::Pending => format_time_until((task.scheduled_at - now).num_seconds()),
            _ => task.scheduled_at.format("%Y-%m-%d %H:%M").to_string(),
        };
        let error = task
            .last_error
            .as_ref()
            .map(|e| format!(" | {}: {}", e.class, e.message))
            .unwrap_or_default();
        println!(
            "{} | {} | {} | {} | {} | attempts {}{}",
            task.id, task.platform, task.kind, task.state, when, task.attempt_count, error
        );
    }
}

/// Human-readable time until a pending task is due
fn format_time_until(diff: i64) -> String {
    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

async fn cmd_report(
    config: Config,
    days: u32,
    platform: Option<&str>,
    format: &str,
) -> anyhow::Result<()> {
    check_format(format)?;
    if days == 0 {
        return Err(TeamcastError::Validation("--days must be at least 1".to_string()).into());
    }
    let coordinator = open_loaded(config).await?;
    let window = ReportWindow::last_days(Utc::now(), days)?;
    let report = coordinator.report(window, platform).await;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output_report_text(&report);
    }
    Ok(())
}

fn output_report_text(report: &Report) {
    println!(
        "Report {} to {}",
        report.window.start.format("%Y-%m-%d %H:%M"),
        report.window.end.format("%Y-%m-%d %H:%M")
    );

    for (name, platform) in &report.platforms {
        let t = &platform.tasks;
        println!();
        println!("{}", name);
        println!(
            "  tasks: {} scheduled, {} succeeded, {} failed ({} retries exhausted), {} cancelled, {} in progress",
            t.scheduled,
            t.succeeded,
            t.failed(),
            t.failed_exhausted,
            t.cancelled,
            t.in_progress
        );
        println!(
            "  published: {} of {} planned",
            platform.content_count, platform.posting_target
        );
        println!(
            "  engagement: {} ({:.1} per post{})",
            platform.engagement.engagement(),
            platform.engagement_per_content,
            platform
                .engagement_rate
                .map(|r| format!(", {:.2}% rate", r * 100.0))
                .unwrap_or_default()
        );
        if let Some(top) = &platform.top_content {
            println!("  top post: {} ({}) {}", top.content_id, top.engagement, top.excerpt);
        }
        for failure in &platform.failures {
            println!(
                "  failed {} {}: attempts {}, {}",
                failure.kind,
                failure.task_id,
                failure.attempt_count,
                failure.error.as_deref().unwrap_or("no error recorded")
            );
        }
    }

    let s = &report.summary;
    println!();
    println!(
        "Total: {} tasks, {} published, {} engagement ({:.1} per post)",
        s.tasks.scheduled,
        s.content_count,
        s.engagement.engagement(),
        s.engagement_per_content
    );

    if !report.recommendations.is_empty() {
        println!();
        println!("Recommendations:");
        for rec in &report.recommendations {
            println!("  - {}", rec);
        }
    }
}

async fn cmd_plan(
    config: Config,
    days: u32,
    start: Option<NaiveDate>,
    topic: &str,
) -> anyhow::Result<()> {
    let coordinator = open_loaded(config).await?;
    let start = start.unwrap_or_else(|| Utc::now().date_naive());
    let ids = coordinator.plan_calendar(start, days, topic).await?;
    for id in &ids {
        println!("{}", id);
    }
    eprintln!("Planned {} task(s) over {} day(s)", ids.len(), days);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time_until() {
        assert_eq!(format_time_until(-5), "overdue");
        assert_eq!(format_time_until(30), "in <1 minute");
        assert_eq!(format_time_until(60), "in 1 minute");
        assert_eq!(format_time_until(3 * 3600), "in 3 hours");
        assert_eq!(format_time_until(86_400), "in 1 day");
    }

    #[test]
    fn test_cli_parses_schedule() {
        let cli = Cli::try_parse_from([
            "team-lead",
            "schedule",
            "instagram",
            "tomorrow 9am",
            "--topic",
            "studio tour",
            "--content-type",
            "reel",
        ])
        .unwrap();
        match cli.command {
            Commands::Schedule {
                platform,
                kind,
                content_type,
                ..
            } => {
                assert_eq!(platform, "instagram");
                assert_eq!(kind, TaskKind::Generate);
                assert_eq!(content_type, Some(ContentType::Reel));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_approve_with_default_time() {
        let cli = Cli::try_parse_from(["team-lead", "approve", "c-42"]).unwrap();
        match cli.command {
            Commands::Approve { content_id, when } => {
                assert_eq!(content_id, "c-42");
                assert_eq!(when, "now");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_state() {
        assert!(Cli::try_parse_from(["team-lead", "list", "--state", "sleeping"]).is_err());
    }

    #[test]
    fn test_dry_run_workers_cover_builtin_platforms() {
        let config = Config::default_config();
        let workers = dry_run_workers(&config);
        let mut names: Vec<&str> = workers.iter().map(|w| w.name()).collect();
        names.sort();
        assert_eq!(names, vec!["facebook", "instagram", "tiktok", "twitter"]);
    }

    #[test]
    fn test_check_format() {
        assert!(check_format("json").is_ok());
        assert!(matches!(
            check_format("xml"),
            Err(TeamcastError::Validation(_))
        ));
    }
}
