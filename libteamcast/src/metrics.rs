//! Metrics aggregation and reports
//!
//! [`MetricsAggregator`] keeps running per-platform totals and a daily
//! engagement series as completions arrive. [`build_report`] is a pure
//! projection of the calendar: the same calendar and window always give the
//! same report, and building one never changes anything.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::calendar::Calendar;
use crate::error::{ErrorClass, Result, TeamcastError};
use crate::types::{
    ContentItem, ContentStatus, EngagementCounters, MetricSnapshot, Task, TaskKind, TaskState,
};

/// Engagement per published item below this is flagged in recommendations
const LOW_ENGAGEMENT_PER_POST: f64 = 10.0;
/// Publishing less than this share of the posting target is flagged
const POSTING_TARGET_RATIO: f64 = 0.8;
const EXCERPT_CHARS: usize = 80;

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReportWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(TeamcastError::Validation(format!(
                "report window start {} is not before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days` days ending at `end`
    pub fn last_days(end: DateTime<Utc>, days: u32) -> Result<Self> {
        Self::new(end - Duration::days(days as i64), end)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Length in whole days, rounded up, at least one
    pub fn days(&self) -> u32 {
        let secs = (self.end - self.start).num_seconds().max(1);
        ((secs + 86_399) / 86_400) as u32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub scheduled: u32,
    pub succeeded: u32,
    /// Gave up after `max_attempts` transient failures
    pub failed_exhausted: u32,
    /// Failed on a non-retryable error
    pub failed_fatal: u32,
    pub cancelled: u32,
    /// Pending, ready, in flight or waiting for a retry
    pub in_progress: u32,
}

impl TaskCounts {
    fn count(&mut self, task: &Task) {
        self.scheduled += 1;
        match task.state {
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::FailedFatal if task.exhausted_retries() => self.failed_exhausted += 1,
            TaskState::FailedFatal => self.failed_fatal += 1,
            TaskState::Cancelled => self.cancelled += 1,
            TaskState::Pending
            | TaskState::Ready
            | TaskState::InFlight
            | TaskState::FailedRetryable => self.in_progress += 1,
        }
    }

    fn add(&mut self, other: &TaskCounts) {
        self.scheduled += other.scheduled;
        self.succeeded += other.succeeded;
        self.failed_exhausted += other.failed_exhausted;
        self.failed_fatal += other.failed_fatal;
        self.cancelled += other.cancelled;
        self.in_progress += other.in_progress;
    }

    pub fn failed(&self) -> u32 {
        self.failed_exhausted + self.failed_fatal
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub attempt_count: u32,
    pub error_class: Option<ErrorClass>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopContent {
    pub content_id: String,
    pub engagement: u64,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyEngagement {
    pub date: NaiveDate,
    pub published: u32,
    pub engagement: EngagementCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformReport {
    pub platform: String,
    pub tasks: TaskCounts,
    /// Items published inside the window
    pub content_count: u32,
    /// Latest counters of those items as of the window end
    pub engagement: EngagementCounters,
    pub engagement_per_content: f64,
    /// Interactions per impression, when impressions were reported
    pub engagement_rate: Option<f64>,
    pub posting_target: u32,
    pub top_content: Option<TopContent>,
    pub daily: Vec<DailyEngagement>,
    pub failures: Vec<FailedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub tasks: TaskCounts,
    pub content_count: u32,
    pub engagement: EngagementCounters,
    pub engagement_per_content: f64,
    pub engagement_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub window: ReportWindow,
    pub platform_filter: Option<String>,
    pub platforms: BTreeMap<String, PlatformReport>,
    pub summary: ReportSummary,
    pub recommendations: Vec<String>,
}

fn per_content(engagement: &EngagementCounters, content_count: u32) -> f64 {
    if content_count == 0 {
        0.0
    } else {
        engagement.engagement() as f64 / content_count as f64
    }
}

fn rate(engagement: &EngagementCounters) -> Option<f64> {
    if engagement.impressions == 0 {
        None
    } else {
        Some(engagement.engagement() as f64 / engagement.impressions as f64)
    }
}

fn excerpt(item: &ContentItem) -> String {
    let text = item.body.text.trim();
    if text.chars().count() <= EXCERPT_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(EXCERPT_CHARS - 3).collect();
        format!("{}...", cut)
    }
}

fn entry<'a>(
    platforms: &'a mut BTreeMap<String, PlatformReport>,
    name: &str,
    posting_target: u32,
) -> &'a mut PlatformReport {
    platforms
        .entry(name.to_string())
        .or_insert_with(|| PlatformReport {
            platform: name.to_string(),
            tasks: TaskCounts::default(),
            content_count: 0,
            engagement: EngagementCounters::default(),
            engagement_per_content: 0.0,
            engagement_rate: None,
            posting_target,
            top_content: None,
            daily: Vec::new(),
            failures: Vec::new(),
        })
}

/// Build a report over `window`, optionally for a single platform
///
/// `posts_per_day` gives the posting target of each configured platform;
/// platforms only seen in the calendar get a target of zero.
pub fn build_report(
    calendar: &Calendar,
    posts_per_day: &BTreeMap<String, u32>,
    window: ReportWindow,
    platform: Option<&str>,
) -> Report {
    let wanted = |name: &str| platform.map(|p| p == name).unwrap_or(true);
    let days = window.days();

    let mut platforms: BTreeMap<String, PlatformReport> = BTreeMap::new();
    let target = |name: &str| posts_per_day.get(name).copied().unwrap_or(0) * days;

    for name in posts_per_day.keys().filter(|n| wanted(n)) {
        entry(&mut platforms, name, target(name));
    }

    let mut tasks: Vec<&Task> = calendar
        .tasks()
        .filter(|t| wanted(&t.platform) && window.contains(t.scheduled_at))
        .collect();
    tasks.sort_by_key(|t| t.sequence);
    for task in tasks {
        let report = entry(&mut platforms, &task.platform, target(&task.platform));
        report.tasks.count(task);
        if task.state == TaskState::FailedFatal {
            report.failures.push(FailedTask {
                task_id: task.id.clone(),
                kind: task.kind,
                attempt_count: task.attempt_count,
                error_class: task.last_error.as_ref().map(|e| e.class),
                error: task.last_error.as_ref().map(|e| e.message.clone()),
            });
        }
    }

    let mut published: Vec<&ContentItem> = calendar
        .content_items()
        .filter(|c| {
            c.status == ContentStatus::Published
                && wanted(&c.platform)
                && c.published_at.map(|at| window.contains(at)).unwrap_or(false)
        })
        .collect();
    published.sort_by(|a, b| (a.published_at, &a.id).cmp(&(b.published_at, &b.id)));

    let mut daily: BTreeMap<(String, NaiveDate), DailyEngagement> = BTreeMap::new();
    for item in published {
        let counters = calendar
            .snapshots_for(&item.id)
            .iter()
            .rev()
            .find(|s| s.collected_at < window.end)
            .map(|s| s.counters)
            .unwrap_or_default();

        let report = entry(&mut platforms, &item.platform, target(&item.platform));
        report.content_count += 1;
        report.engagement.add(&counters);

        let engagement = counters.engagement();
        let better = report
            .top_content
            .as_ref()
            .map(|top| engagement > top.engagement)
            .unwrap_or(engagement > 0);
        if better {
            report.top_content = Some(TopContent {
                content_id: item.id.clone(),
                engagement,
                excerpt: excerpt(item),
            });
        }

        if let Some(at) = item.published_at {
            let date = at.date_naive();
            let day = daily
                .entry((item.platform.clone(), date))
                .or_insert_with(|| DailyEngagement {
                    date,
                    published: 0,
                    engagement: EngagementCounters::default(),
                });
            day.published += 1;
            day.engagement.add(&counters);
        }
    }

    for ((name, _), day) in daily {
        if let Some(report) = platforms.get_mut(&name) {
            report.daily.push(day);
        }
    }

    let mut summary = ReportSummary {
        tasks: TaskCounts::default(),
        content_count: 0,
        engagement: EngagementCounters::default(),
        engagement_per_content: 0.0,
        engagement_rate: None,
    };
    for report in platforms.values_mut() {
        report.engagement_per_content = per_content(&report.engagement, report.content_count);
        report.engagement_rate = rate(&report.engagement);

        summary.tasks.add(&report.tasks);
        summary.content_count += report.content_count;
        summary.engagement.add(&report.engagement);
    }
    summary.engagement_per_content = per_content(&summary.engagement, summary.content_count);
    summary.engagement_rate = rate(&summary.engagement);

    let recommendations = recommend(&platforms);

    Report {
        window,
        platform_filter: platform.map(|p| p.to_string()),
        platforms,
        summary,
        recommendations,
    }
}

fn recommend(platforms: &BTreeMap<String, PlatformReport>) -> Vec<String> {
    let mut out = Vec::new();

    let best = platforms
        .values()
        .filter_map(|p| p.engagement_rate.map(|r| (p, r)))
        .fold(None::<(&PlatformReport, f64)>, |best, (p, r)| match best {
            Some((_, best_rate)) if best_rate >= r => best,
            _ => Some((p, r)),
        });
    if let Some((report, rate)) = best {
        out.push(format!(
            "{} has the highest engagement rate ({:.1}%); consider shifting more content there",
            report.platform,
            rate * 100.0
        ));
    }

    for report in platforms.values() {
        if report.content_count > 0 && report.engagement_per_content < LOW_ENGAGEMENT_PER_POST {
            out.push(format!(
                "{} averages {:.1} interactions per post; revisit topics and posting times",
                report.platform, report.engagement_per_content
            ));
        }
    }

    for report in platforms.values() {
        let target = report.posting_target as f64;
        if target > 0.0 && (report.content_count as f64) < target * POSTING_TARGET_RATIO {
            out.push(format!(
                "{} published {} of {} planned posts; increase posting frequency",
                report.platform, report.content_count, report.posting_target
            ));
        }
    }

    for report in platforms.values() {
        let failed = report.tasks.failed();
        if failed > 0 {
            out.push(format!(
                "{} had {} failed task(s) ({} after exhausting retries)",
                report.platform, failed, report.tasks.failed_exhausted
            ));
        }
    }

    out
}

/// Running totals of one platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTotals {
    pub scheduled: u64,
    pub succeeded: u64,
    pub failed_exhausted: u64,
    pub failed_fatal: u64,
    pub cancelled: u64,
    pub published: u64,
    /// Sum of the latest counters of every item
    pub engagement: EngagementCounters,
}

/// Live per-platform totals, fed by the coordinator as events happen
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    totals: BTreeMap<String, RunningTotals>,
    /// Engagement gained per platform and UTC day of collection; drops in
    /// an item's counters do not take gains away
    daily: BTreeMap<(String, NaiveDate), EngagementCounters>,
    latest: HashMap<String, EngagementCounters>,
}

fn gained(new: &EngagementCounters, old: &EngagementCounters) -> EngagementCounters {
    EngagementCounters {
        likes: new.likes.saturating_sub(old.likes),
        shares: new.shares.saturating_sub(old.shares),
        comments: new.comments.saturating_sub(old.comments),
        impressions: new.impressions.saturating_sub(old.impressions),
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute every total from stored state
    pub fn rebuild(calendar: &Calendar) -> Self {
        let mut aggregator = Self::new();

        let mut tasks: Vec<&Task> = calendar.tasks().collect();
        tasks.sort_by_key(|t| t.sequence);
        for task in tasks {
            aggregator.record_scheduled(task);
            if task.state.is_terminal() {
                aggregator.record_finished(task);
            }
        }

        for item in calendar.content_items() {
            if item.status == ContentStatus::Published {
                aggregator.record_published(item);
            }
        }

        let mut snapshots: Vec<&MetricSnapshot> = calendar.snapshots().collect();
        snapshots.sort_by(|a, b| {
            (a.collected_at, &a.content_id).cmp(&(b.collected_at, &b.content_id))
        });
        for snapshot in snapshots {
            aggregator.record_snapshot(snapshot);
        }

        aggregator
    }

    fn platform(&mut self, name: &str) -> &mut RunningTotals {
        self.totals.entry(name.to_string()).or_default()
    }

    pub fn record_scheduled(&mut self, task: &Task) {
        self.platform(&task.platform).scheduled += 1;
    }

    /// Count a task that reached a terminal state
    pub fn record_finished(&mut self, task: &Task) {
        let totals = self.platform(&task.platform);
        match task.state {
            TaskState::Succeeded => totals.succeeded += 1,
            TaskState::FailedFatal if task.exhausted_retries() => totals.failed_exhausted += 1,
            TaskState::FailedFatal => totals.failed_fatal += 1,
            TaskState::Cancelled => totals.cancelled += 1,
            _ => {}
        }
    }

    pub fn record_published(&mut self, item: &ContentItem) {
        self.platform(&item.platform).published += 1;
    }

    pub fn record_snapshot(&mut self, snapshot: &MetricSnapshot) {
        let previous = self
            .latest
            .insert(snapshot.content_id.clone(), snapshot.counters)
            .unwrap_or_default();
        let delta = gained(&snapshot.counters, &previous);

        // replace the item's previous contribution with its latest counters,
        // which may be lower when likes are withdrawn
        let totals = self.platform(&snapshot.platform);
        totals.engagement.subtract(&previous);
        totals.engagement.add(&snapshot.counters);
        self.daily
            .entry((snapshot.platform.clone(), snapshot.collected_at.date_naive()))
            .or_default()
            .add(&delta);
    }

    pub fn totals(&self, platform: &str) -> Option<&RunningTotals> {
        self.totals.get(platform)
    }

    pub fn all_totals(&self) -> &BTreeMap<String, RunningTotals> {
        &self.totals
    }

    /// Engagement gained per day on `platform`, oldest first
    pub fn daily_series(&self, platform: &str) -> Vec<(NaiveDate, EngagementCounters)> {
        self.daily
            .iter()
            .filter(|((p, _), _)| p == platform)
            .map(|((_, date), counters)| (*date, *counters))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentBody, ContentRequest, ContentType, TaskFailure};
    use chrono::TimeZone;

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, d, h, 0, 0).unwrap()
    }

    struct Fixture {
        calendar: Calendar,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                calendar: Calendar::new(),
            }
        }

        fn task(&mut self, platform: &str, at: DateTime<Utc>, state: TaskState) -> Task {
            let sequence = self.calendar.next_sequence();
            let mut task = Task::new(
                platform.to_string(),
                ContentRequest::generate("launch", ContentType::Text),
                at,
                at,
                sequence,
            );
            task.state = state;
            self.calendar.insert(task.clone()).unwrap();
            task
        }

        fn failed(&mut self, platform: &str, at: DateTime<Utc>, class: ErrorClass, attempts: u32) {
            let sequence = self.calendar.next_sequence();
            let mut task = Task::new(
                platform.to_string(),
                ContentRequest::generate("launch", ContentType::Text),
                at,
                at,
                sequence,
            );
            task.state = TaskState::FailedFatal;
            task.attempt_count = attempts;
            task.last_error = Some(TaskFailure {
                class,
                message: format!("{} failure", class),
            });
            self.calendar.insert(task).unwrap();
        }

        fn published(&mut self, platform: &str, at: DateTime<Utc>, likes: u64, impressions: u64) -> String {
            let task = self.task(platform, at, TaskState::Succeeded);
            let mut item = ContentItem::draft(&task, ContentBody::text(format!("post {}", likes)), at);
            item.status = ContentStatus::Published;
            item.published_at = Some(at);
            item.platform_post_id = Some(format!("p-{}", likes));
            let id = item.id.clone();
            self.calendar.insert_content(item);
            self.calendar.append_snapshot(MetricSnapshot {
                content_id: id.clone(),
                platform: platform.to_string(),
                counters: EngagementCounters {
                    likes,
                    shares: 0,
                    comments: 0,
                    impressions,
                },
                collected_at: at + Duration::hours(1),
            });
            id
        }
    }

    fn targets() -> BTreeMap<String, u32> {
        let mut targets = BTreeMap::new();
        targets.insert("facebook".to_string(), 1);
        targets.insert("twitter".to_string(), 1);
        targets
    }

    fn week() -> ReportWindow {
        ReportWindow::new(day(1, 0), day(8, 0)).unwrap()
    }

    #[test]
    fn test_window_validation() {
        assert!(ReportWindow::new(day(2, 0), day(1, 0)).is_err());
        assert_eq!(week().days(), 7);
        assert_eq!(ReportWindow::new(day(1, 0), day(1, 1)).unwrap().days(), 1);
    }

    #[test]
    fn test_counts_split_exhausted_and_fatal() {
        let mut f = Fixture::new();
        f.task("facebook", day(2, 9), TaskState::Succeeded);
        f.failed("facebook", day(2, 10), ErrorClass::Transient, 3);
        f.failed("facebook", day(2, 11), ErrorClass::Fatal, 1);
        f.task("facebook", day(3, 9), TaskState::Pending);
        f.task("facebook", day(20, 9), TaskState::Succeeded);

        let report = build_report(&f.calendar, &targets(), week(), Some("facebook"));
        let counts = report.platforms["facebook"].tasks;
        assert_eq!(counts.scheduled, 4);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed_exhausted, 1);
        assert_eq!(counts.failed_fatal, 1);
        assert_eq!(counts.in_progress, 1);

        let failures = &report.platforms["facebook"].failures;
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .any(|f| f.attempt_count == 3 && f.error_class == Some(ErrorClass::Transient)));
    }

    #[test]
    fn test_engagement_normalised_by_content() {
        let mut f = Fixture::new();
        f.published("twitter", day(2, 9), 30, 1000);
        let top = f.published("twitter", day(3, 9), 50, 1000);
        f.published("facebook", day(2, 9), 4, 100);

        let report = build_report(&f.calendar, &targets(), week(), None);
        let twitter = &report.platforms["twitter"];
        assert_eq!(twitter.content_count, 2);
        assert_eq!(twitter.engagement.likes, 80);
        assert_eq!(twitter.engagement_per_content, 40.0);
        assert_eq!(twitter.engagement_rate, Some(0.04));
        assert_eq!(twitter.top_content.as_ref().unwrap().content_id, top);
        assert_eq!(twitter.daily.len(), 2);

        assert_eq!(report.summary.content_count, 3);
        assert_eq!(report.summary.engagement.likes, 84);
        assert_eq!(report.summary.engagement_per_content, 28.0);
    }

    #[test]
    fn test_latest_snapshot_before_window_end_wins() {
        let mut f = Fixture::new();
        let id = f.published("twitter", day(2, 9), 5, 100);
        f.calendar.append_snapshot(MetricSnapshot {
            content_id: id.clone(),
            platform: "twitter".to_string(),
            counters: EngagementCounters {
                likes: 25,
                shares: 0,
                comments: 0,
                impressions: 200,
            },
            collected_at: day(4, 9),
        });
        f.calendar.append_snapshot(MetricSnapshot {
            content_id: id,
            platform: "twitter".to_string(),
            counters: EngagementCounters {
                likes: 99,
                shares: 0,
                comments: 0,
                impressions: 900,
            },
            collected_at: day(9, 9),
        });

        let report = build_report(&f.calendar, &targets(), week(), Some("twitter"));
        assert_eq!(report.platforms["twitter"].engagement.likes, 25);
    }

    #[test]
    fn test_report_is_idempotent() {
        let mut f = Fixture::new();
        f.published("twitter", day(2, 9), 30, 1000);
        f.published("facebook", day(5, 9), 3, 10);
        f.task("facebook", day(6, 9), TaskState::Cancelled);

        let first = build_report(&f.calendar, &targets(), week(), None);
        let second = build_report(&f.calendar, &targets(), week(), None);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_recommendations() {
        let mut f = Fixture::new();
        for d in 1..=7 {
            f.published("twitter", day(d, 9), 40, 400);
        }
        f.published("facebook", day(2, 9), 3, 20);

        let report = build_report(&f.calendar, &targets(), week(), None);
        let recs = &report.recommendations;
        assert!(recs[0].starts_with("facebook has the highest engagement rate (15.0%)"));
        assert!(recs
            .iter()
            .any(|r| r.starts_with("facebook averages 3.0 interactions per post")));
        assert!(recs
            .iter()
            .any(|r| r.starts_with("facebook published 1 of 7 planned posts")));
        assert!(!recs.iter().any(|r| r.starts_with("twitter published")));
    }

    #[test]
    fn test_platform_filter() {
        let mut f = Fixture::new();
        f.published("twitter", day(2, 9), 30, 1000);
        f.published("facebook", day(2, 9), 3, 10);

        let report = build_report(&f.calendar, &targets(), week(), Some("twitter"));
        assert_eq!(report.platforms.len(), 1);
        assert_eq!(report.platform_filter.as_deref(), Some("twitter"));
        assert_eq!(report.summary.content_count, 1);
    }

    #[test]
    fn test_aggregator_counts_latest_counters_once() {
        let mut aggregator = MetricsAggregator::new();
        let snapshot = |likes, hour| MetricSnapshot {
            content_id: "c1".to_string(),
            platform: "instagram".to_string(),
            counters: EngagementCounters {
                likes,
                ..Default::default()
            },
            collected_at: day(2, hour),
        };
        aggregator.record_snapshot(&snapshot(10, 9));
        aggregator.record_snapshot(&snapshot(25, 12));

        let totals = aggregator.totals("instagram").unwrap();
        assert_eq!(totals.engagement.likes, 25);
        let series = aggregator.daily_series("instagram");
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].1.likes, 25);
    }

    #[test]
    fn test_aggregator_follows_counters_that_go_down() {
        let mut aggregator = MetricsAggregator::new();
        let snapshot = |content_id: &str, likes, impressions, hour| MetricSnapshot {
            content_id: content_id.to_string(),
            platform: "facebook".to_string(),
            counters: EngagementCounters {
                likes,
                impressions,
                ..Default::default()
            },
            collected_at: day(2, hour),
        };
        aggregator.record_snapshot(&snapshot("c1", 30, 900, 9));
        aggregator.record_snapshot(&snapshot("c2", 5, 100, 10));
        // likes withdrawn on c1 since the last collection
        aggregator.record_snapshot(&snapshot("c1", 22, 1_000, 12));

        let totals = aggregator.totals("facebook").unwrap();
        assert_eq!(totals.engagement.likes, 27);
        assert_eq!(totals.engagement.impressions, 1_100);
        // the day keeps what was gained
        assert_eq!(aggregator.daily_series("facebook")[0].1.likes, 35);
    }

    #[test]
    fn test_rebuild_matches_stored_state() {
        let mut f = Fixture::new();
        f.published("twitter", day(2, 9), 30, 1000);
        f.published("twitter", day(3, 9), 12, 300);
        f.task("twitter", day(4, 9), TaskState::Cancelled);

        let rebuilt = MetricsAggregator::rebuild(&f.calendar);
        let totals = rebuilt.totals("twitter").unwrap();
        assert_eq!(totals.scheduled, 3);
        assert_eq!(totals.succeeded, 2);
        assert_eq!(totals.cancelled, 1);
        assert_eq!(totals.published, 2);
        assert_eq!(totals.engagement.likes, 42);

        let again = MetricsAggregator::rebuild(&f.calendar);
        assert_eq!(again.all_totals(), rebuilt.all_totals());
    }
}
