//! End-to-end dispatch scenarios
//!
//! Drives the coordinator tick by tick with a manual clock and mock workers.

use chrono::{DateTime, Duration, TimeZone, Utc};
use libteamcast::config::{PlatformConfig, RateLimitConfig, StalenessPolicy};
use libteamcast::platforms::mock::MockWorker;
use libteamcast::{
    Clock, Config, ContentRequest, ContentStatus, ContentType, Coordinator, EngagementCounters,
    ErrorClass, Event, ManualClock, MemoryStorage, PlatformError, PlatformWorker, ReportWindow,
    TaskKind, TaskState,
};
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    // on a minute boundary, so fixed windows start here
    Utc.with_ymd_and_hms(2026, 4, 6, 9, 0, 0).unwrap()
}

fn platform(limit: u32, window_secs: u64, max_concurrency: usize) -> PlatformConfig {
    PlatformConfig {
        enabled: true,
        rate_limit: RateLimitConfig { limit, window_secs },
        max_concurrency,
        best_times: vec!["09:00".to_string()],
        posts_per_day: 1,
    }
}

fn config_with(platforms: &[(&str, PlatformConfig)]) -> Config {
    let mut config = Config::default_config();
    config.platforms = platforms
        .iter()
        .map(|(name, p)| (name.to_string(), p.clone()))
        .collect();
    config.pipeline.auto_publish = false;
    config.pipeline.collect_metrics_after_secs = None;
    config
}

struct Setup {
    coordinator: Coordinator,
    clock: Arc<ManualClock>,
}

fn setup(config: Config, workers: &[MockWorker]) -> Setup {
    let clock = Arc::new(ManualClock::new(t0()));
    let workers = workers
        .iter()
        .map(|w| Arc::new(w.clone().with_clock(clock.clone())) as Arc<dyn PlatformWorker>)
        .collect();
    let coordinator = Coordinator::new(
        config,
        workers,
        Arc::new(MemoryStorage::new()),
        clock.clone(),
    )
    .unwrap();
    Setup { coordinator, clock }
}

fn post(topic: &str) -> ContentRequest {
    ContentRequest::generate(topic, ContentType::Text)
}

#[tokio::test]
async fn test_second_task_waits_for_rate_limit_window() {
    let facebook = MockWorker::new("facebook");
    let s = setup(
        config_with(&[("facebook", platform(1, 60, 2))]),
        &[facebook.clone()],
    );
    let first = s.coordinator.schedule("facebook", post("one"), t0()).await.unwrap();
    let second = s.coordinator.schedule("facebook", post("two"), t0()).await.unwrap();
    let mut events = s.coordinator.subscribe();

    let summary = s.coordinator.tick().await.unwrap();
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.rate_limited, 1);
    s.coordinator.wait_idle().await.unwrap();

    assert_eq!(facebook.seen_ids(), vec![first.clone()]);
    assert_eq!(
        s.coordinator.task(&second).await.unwrap().state,
        TaskState::Ready
    );
    let mut saw_rate_limited = false;
    while let Ok(event) = events.try_recv() {
        if let Event::RateLimited {
            platform,
            retry_after_ms,
        } = event
        {
            assert_eq!(platform, "facebook");
            assert_eq!(retry_after_ms, 60_000);
            saw_rate_limited = true;
        }
    }
    assert!(saw_rate_limited);

    // still inside the window
    s.clock.advance(Duration::seconds(30));
    assert_eq!(s.coordinator.tick().await.unwrap().dispatched, 0);

    s.clock.advance(Duration::seconds(30));
    assert_eq!(s.coordinator.tick().await.unwrap().dispatched, 1);
    s.coordinator.wait_idle().await.unwrap();

    assert_eq!(facebook.seen_ids(), vec![first, second.clone()]);
    assert_eq!(
        s.coordinator.task(&second).await.unwrap().state,
        TaskState::Succeeded
    );
}

#[tokio::test]
async fn test_throttled_platform_does_not_block_others() {
    let facebook = MockWorker::new("facebook");
    let twitter = MockWorker::new("twitter");
    let s = setup(
        config_with(&[
            ("facebook", platform(1, 3600, 2)),
            ("twitter", platform(10, 3600, 2)),
        ]),
        &[facebook.clone(), twitter.clone()],
    );
    for topic in ["a", "b", "c"] {
        s.coordinator.schedule("facebook", post(topic), t0()).await.unwrap();
        s.coordinator.schedule("twitter", post(topic), t0()).await.unwrap();
    }

    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();
    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();

    assert_eq!(facebook.call_count(), 1);
    assert_eq!(twitter.call_count(), 3);
}

#[tokio::test]
async fn test_fatal_error_on_first_attempt() {
    let twitter = MockWorker::new("twitter");
    twitter.fail_next([PlatformError::Authentication("token revoked".to_string())]);
    let s = setup(
        config_with(&[("twitter", platform(10, 60, 2))]),
        &[twitter.clone()],
    );
    let id = s.coordinator.schedule("twitter", post("launch"), t0()).await.unwrap();

    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();

    let task = s.coordinator.task(&id).await.unwrap();
    assert_eq!(task.state, TaskState::FailedFatal);
    assert_eq!(task.attempt_count, 1);
    assert_eq!(
        task.last_error.as_ref().map(|e| e.class),
        Some(ErrorClass::Fatal)
    );
    assert!(!task.exhausted_retries());

    s.clock.advance(Duration::hours(1));
    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();
    assert_eq!(twitter.call_count(), 1);
}

#[tokio::test]
async fn test_cancel_in_flight_returns_false_and_task_completes() {
    let tiktok = MockWorker::new("tiktok").with_delay(std::time::Duration::from_millis(50));
    let s = setup(
        config_with(&[("tiktok", platform(10, 60, 1))]),
        &[tiktok.clone()],
    );
    let id = s
        .coordinator
        .schedule(
            "tiktok",
            ContentRequest::generate("behind the scenes", ContentType::Video),
            t0(),
        )
        .await
        .unwrap();

    s.coordinator.tick().await.unwrap();
    assert_eq!(
        s.coordinator.task(&id).await.unwrap().state,
        TaskState::InFlight
    );
    assert!(!s.coordinator.cancel(&id).await.unwrap());

    s.coordinator.wait_idle().await.unwrap();
    let task = s.coordinator.task(&id).await.unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(tiktok.call_count(), 1);
}

#[tokio::test]
async fn test_backoff_grows_until_attempts_run_out() {
    let mut config = config_with(&[("instagram", platform(100, 60, 1))]);
    config.retry.base_delay_ms = 1_000;
    config.retry.max_delay_ms = 60_000;
    config.retry.jitter_ratio = 0.1;
    config.retry.max_attempts = 4;

    let instagram = MockWorker::new("instagram");
    instagram.fail_always(PlatformError::Server {
        status: 503,
        message: "unavailable".to_string(),
    });
    let s = setup(config, &[instagram.clone()]);
    let id = s
        .coordinator
        .schedule(
            "instagram",
            ContentRequest::generate("new menu", ContentType::Image),
            t0(),
        )
        .await
        .unwrap();

    let mut delays = Vec::new();
    loop {
        s.coordinator.tick().await.unwrap();
        s.coordinator.wait_idle().await.unwrap();
        let task = s.coordinator.task(&id).await.unwrap();
        if task.state != TaskState::Pending {
            assert_eq!(task.state, TaskState::FailedFatal);
            assert_eq!(task.attempt_count, 4);
            assert!(task.exhausted_retries());
            break;
        }
        delays.push((task.scheduled_at - s.clock.now()).num_milliseconds());
        s.clock.set(task.scheduled_at);
    }

    assert_eq!(delays.len(), 3);
    for (delay, nominal) in delays.iter().zip([1_000i64, 2_000, 4_000]) {
        assert!(
            (nominal * 9 / 10..=nominal * 11 / 10).contains(delay),
            "delay {} not within 10% of {}",
            delay,
            nominal
        );
    }
    assert!(delays.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(instagram.call_count(), 4);
}

#[tokio::test]
async fn test_pool_bounds_concurrency_and_no_task_runs_twice() {
    let facebook = MockWorker::new("facebook").with_delay(std::time::Duration::from_millis(20));
    let s = setup(
        config_with(&[("facebook", platform(100, 60, 2))]),
        &[facebook.clone()],
    );
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            s.coordinator
                .schedule("facebook", post(&format!("post {}", i)), t0())
                .await
                .unwrap(),
        );
    }

    assert_eq!(s.coordinator.tick().await.unwrap().dispatched, 2);
    // both slots are taken
    assert_eq!(s.coordinator.tick().await.unwrap().dispatched, 0);

    for _ in 0..3 {
        s.coordinator.wait_idle().await.unwrap();
        s.coordinator.tick().await.unwrap();
    }
    s.coordinator.wait_idle().await.unwrap();

    assert!(facebook.max_concurrent() <= 2);
    let mut seen = facebook.seen_ids();
    assert_eq!(seen.len(), 6);
    // tasks dispatched in the same pass may reach the worker in either order
    assert_eq!(seen[4..].iter().filter(|id| ids[4..].contains(id)).count(), 2);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 6);
    for id in &ids {
        let task = s.coordinator.task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempt_count, 1);
    }
}

#[tokio::test]
async fn test_stale_task_expires() {
    let mut config = config_with(&[("twitter", platform(1, 3600, 2))]);
    config.scheduler.staleness.max_ready_lag_secs = Some(60);
    config.scheduler.staleness.policy = StalenessPolicy::Expire;
    let twitter = MockWorker::new("twitter");
    let s = setup(config, &[twitter.clone()]);

    s.coordinator.schedule("twitter", post("first"), t0()).await.unwrap();
    let late = s.coordinator.schedule("twitter", post("second"), t0()).await.unwrap();
    let mut events = s.coordinator.subscribe();

    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();
    s.clock.advance(Duration::minutes(2));
    s.coordinator.tick().await.unwrap();

    let task = s.coordinator.task(&late).await.unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert_eq!(task.last_error.map(|e| e.message), Some("stale".to_string()));

    let mut expired = false;
    while let Ok(event) = events.try_recv() {
        if let Event::TaskStale {
            task_id,
            expired: true,
            waited_secs,
            ..
        } = event
        {
            assert_eq!(task_id, late);
            assert_eq!(waited_secs, 120);
            expired = true;
        }
    }
    assert!(expired);
    assert_eq!(twitter.call_count(), 1);
}

#[tokio::test]
async fn test_escalated_stale_task_keeps_waiting() {
    let mut config = config_with(&[("twitter", platform(1, 3600, 2))]);
    config.scheduler.staleness.max_ready_lag_secs = Some(60);
    config.scheduler.staleness.policy = StalenessPolicy::Escalate;
    let s = setup(config, &[MockWorker::new("twitter")]);

    s.coordinator.schedule("twitter", post("first"), t0()).await.unwrap();
    let late = s.coordinator.schedule("twitter", post("second"), t0()).await.unwrap();
    let mut events = s.coordinator.subscribe();

    s.coordinator.tick().await.unwrap();
    s.clock.advance(Duration::minutes(2));
    s.coordinator.tick().await.unwrap();
    s.clock.advance(Duration::minutes(2));
    s.coordinator.tick().await.unwrap();

    let stale_events = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, Event::TaskStale { expired: false, .. }))
        .count();
    assert_eq!(stale_events, 1, "escalated once per task");
    assert_eq!(
        s.coordinator.task(&late).await.unwrap().state,
        TaskState::Ready
    );
}

#[tokio::test]
async fn test_pipeline_generate_publish_collect() {
    let mut config = config_with(&[("instagram", platform(10, 60, 2))]);
    config.pipeline.auto_publish = true;
    config.pipeline.collect_metrics_after_secs = Some(3600);
    let instagram = MockWorker::new("instagram");
    instagram.set_counters(EngagementCounters {
        likes: 120,
        shares: 8,
        comments: 12,
        impressions: 2_000,
    });
    let s = setup(config, &[instagram.clone()]);
    let mut events = s.coordinator.subscribe();

    let generate = s
        .coordinator
        .schedule(
            "instagram",
            ContentRequest::generate("studio tour", ContentType::Image),
            t0(),
        )
        .await
        .unwrap();

    // generate, then the publish follow-up due immediately
    for _ in 0..2 {
        s.coordinator.tick().await.unwrap();
        s.coordinator.wait_idle().await.unwrap();
    }
    s.clock.advance(Duration::hours(1));
    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();

    let tasks = s.coordinator.tasks().await;
    assert_eq!(tasks.len(), 3);
    assert_eq!(
        tasks.iter().map(|t| t.kind).collect::<Vec<_>>(),
        vec![TaskKind::Generate, TaskKind::Publish, TaskKind::CollectMetrics]
    );
    assert_eq!(tasks[1].parent_id.as_deref(), Some(generate.as_str()));
    assert_eq!(tasks[2].parent_id.as_deref(), Some(tasks[1].id.as_str()));
    assert_eq!(tasks[2].scheduled_at, t0() + Duration::hours(1));
    assert!(tasks.iter().all(|t| t.state == TaskState::Succeeded));

    let content_id = tasks[1].payload.content_id.clone().unwrap();
    let item = s.coordinator.content(&content_id).await.unwrap();
    assert_eq!(item.status, ContentStatus::Published);
    assert!(item
        .platform_post_id
        .as_deref()
        .unwrap()
        .starts_with("instagram:mock-"));
    assert_eq!(s.coordinator.snapshots(&content_id).await.len(), 1);

    let kinds: Vec<&'static str> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e {
            Event::ContentPublished { .. } => Some("published"),
            Event::MetricsRecorded { .. } => Some("metrics"),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec!["published", "metrics"]);

    let window = ReportWindow::new(t0(), t0() + Duration::days(1)).unwrap();
    let report = s.coordinator.report(window, None).await;
    let instagram_report = &report.platforms["instagram"];
    assert_eq!(instagram_report.content_count, 1);
    assert_eq!(instagram_report.engagement.engagement(), 140);
    assert_eq!(instagram_report.engagement_rate, Some(0.07));
    assert_eq!(instagram_report.tasks.succeeded, 3);

    // same calendar, same report
    assert_eq!(s.coordinator.report(window, None).await, report);
}

#[tokio::test]
async fn test_drafts_wait_for_approval() {
    let mut config = config_with(&[("facebook", platform(10, 60, 2))]);
    config.pipeline.auto_publish = true;
    config.pipeline.require_approval = true;
    let facebook = MockWorker::new("facebook");
    let s = setup(config, &[facebook.clone()]);

    s.coordinator.schedule("facebook", post("offer"), t0()).await.unwrap();
    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();

    // no publish follow-up for an unapproved draft
    assert_eq!(s.coordinator.tasks().await.len(), 1);
    let drafts = s.coordinator.drafts().await;
    assert_eq!(drafts.len(), 1);
    let draft = &drafts[0];
    let err = s
        .coordinator
        .schedule("facebook", ContentRequest::publish(draft), t0())
        .await
        .unwrap_err();
    assert!(matches!(err, libteamcast::TeamcastError::Validation(_)));

    let publish = s.coordinator.approve(&draft.id, t0()).await.unwrap();
    assert_eq!(
        s.coordinator.content(&draft.id).await.unwrap().status,
        ContentStatus::Approved
    );
    assert!(s.coordinator.drafts().await.is_empty());

    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();
    assert_eq!(
        s.coordinator.task(&publish).await.unwrap().state,
        TaskState::Succeeded
    );
    assert_eq!(
        s.coordinator.content(&draft.id).await.unwrap().status,
        ContentStatus::Published
    );

    // only drafts can be approved
    assert!(s.coordinator.approve(&draft.id, t0()).await.is_err());
}

#[tokio::test]
async fn test_failed_publish_marks_content_failed() {
    let mut config = config_with(&[("facebook", platform(10, 60, 2))]);
    config.pipeline.auto_publish = true;
    let facebook = MockWorker::new("facebook");
    let s = setup(config, &[facebook.clone()]);

    s.coordinator.schedule("facebook", post("offer"), t0()).await.unwrap();
    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();

    facebook.fail_next([PlatformError::Validation("link blocked".to_string())]);
    s.coordinator.tick().await.unwrap();
    s.coordinator.wait_idle().await.unwrap();

    let tasks = s.coordinator.tasks().await;
    let publish = tasks.iter().find(|t| t.kind == TaskKind::Publish).unwrap();
    assert_eq!(publish.state, TaskState::FailedFatal);
    let content_id = publish.payload.content_id.as_deref().unwrap();
    assert_eq!(
        s.coordinator.content(content_id).await.unwrap().status,
        ContentStatus::Failed
    );
}
