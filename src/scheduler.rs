//! Daily refresh daemon.
//!
//! Runs one refresh at startup, then sleeps until the configured UTC
//! wall-clock time each day. A refresh resolves the configured warehouse
//! kind, collects a full snapshot, and publishes it under the global cache
//! key. If the kind is unknown or the adapter cannot be built, the run is
//! logged and the cache is left untouched, so a previously published
//! snapshot keeps serving until its TTL lapses.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::cache::StatsCache;
use crate::collector::collect;
use crate::config::Config;
use crate::warehouse::{WarehouseKind, create_adapter};

pub struct RefreshScheduler {
    config: Config,
    cache: StatsCache,
}

impl RefreshScheduler {
    pub fn new(config: Config, cache: StatsCache) -> Self {
        Self { config, cache }
    }

    /// Run until the token is cancelled: once immediately, then daily at
    /// the configured UTC time.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.refresh_once().await;
        loop {
            let wait = sleep_until_next_run(Utc::now(), self.config.refresh.hour, self.config.refresh.minute);
            info!(wait_secs = wait.as_secs(), "next statistics refresh scheduled");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("statistics refresh scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            self.refresh_once().await;
        }
    }

    /// One refresh cycle. Failures never touch the cache.
    #[instrument(skip(self), fields(warehouse = %self.config.platform_dwh))]
    pub async fn refresh_once(&self) {
        let kind: WarehouseKind = match self.config.platform_dwh.parse() {
            Ok(kind) => kind,
            Err(err) => {
                error!(error = %err, "cannot refresh statistics; cache left unchanged");
                return;
            }
        };
        let adapter = match create_adapter(kind, &self.config) {
            Ok(adapter) => adapter,
            Err(err) => {
                error!(error = %err, "failed to build warehouse adapter; cache left unchanged");
                return;
            }
        };
        let snapshot = collect(adapter.as_ref()).await;
        self.cache.publish_global(snapshot).await;
        info!("published refreshed statistics snapshot");
    }
}

/// Time to sleep from `now` until the next daily run at `hour:minute` UTC.
/// Out-of-range values wrap into a valid wall-clock time.
fn sleep_until_next_run(now: DateTime<Utc>, hour: u32, minute: u32) -> Duration {
    let hour = hour % 24;
    let minute = minute % 60;
    let today = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(minute))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let next = if today > now { today } else { today + ChronoDuration::days(1) };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::test_support::MockExecutor;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn next_run_later_the_same_day() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 1, 30, 0).unwrap();
        let wait = sleep_until_next_run(now, 3, 0);
        assert_eq!(wait, Duration::from_secs(90 * 60));
    }

    #[test]
    fn next_run_rolls_to_tomorrow_when_time_has_passed() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 3, 0, 0).unwrap();
        let wait = sleep_until_next_run(now, 3, 0);
        assert_eq!(wait, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn out_of_range_schedule_wraps() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 0, 0, 0).unwrap();
        let wait = sleep_until_next_run(now, 25, 61);
        assert_eq!(wait, Duration::from_secs(61 * 60));
    }

    #[test_log::test(tokio::test)]
    async fn unknown_warehouse_leaves_cache_untouched() {
        let mut config = Config::default();
        config.platform_dwh = "teradata".to_string();
        let cache = StatsCache::new(Duration::from_secs(7200));
        let existing = crate::snapshot::MetricSnapshot {
            dataset_count: Some(7),
            ..Default::default()
        };
        cache.publish_global(existing).await;

        let scheduler = RefreshScheduler::new(config, cache.clone());
        scheduler.refresh_once().await;

        let cached = cache.get_global().await.unwrap();
        assert_eq!(cached.dataset_count, Some(7));
    }

    #[test_log::test(tokio::test)]
    async fn failing_operations_still_publish_a_complete_snapshot() {
        // History queries fail, catalog queries succeed; the published
        // snapshot must carry the working metrics next to the defaults.
        let executor = MockExecutor::new()
            .failing("SYS_QUERY_HISTORY")
            .on(
                "pg_database",
                vec![MockExecutor::row(&[("dataset_count", serde_json::json!(6))])],
            )
            .on(
                "svv_tables",
                vec![MockExecutor::row(&[("table_count", serde_json::json!(92))])],
            );
        let adapter = crate::warehouse::redshift::RedshiftAdapter::from_executor(Arc::new(executor));
        let cache = StatsCache::new(Duration::from_secs(7200));

        let snapshot = collect(&adapter).await;
        cache.publish_global(snapshot).await;

        let cached = cache.get_global().await.unwrap();
        assert_eq!(cached.dataset_count, Some(6));
        assert_eq!(cached.table_count, Some(92));
        assert_eq!(cached.total_query_executed, None);
        assert_eq!(cached.avg_execution_time_seconds, None);
        assert_eq!(cached.query_cost_by_months_chart, "[]");
        assert_eq!(cached.total_cost_gb_by_users, "[]");
    }
}
