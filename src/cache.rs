//! In-memory snapshot cache.
//!
//! A single well-known key holds the latest published snapshot; entries
//! expire after the configured TTL so stale statistics vanish rather than
//! lingering when refreshes stop succeeding.

use moka::future::Cache;
use std::time::Duration;

use crate::snapshot::MetricSnapshot;

/// Key under which the scheduler publishes the aggregate snapshot.
pub const GLOBAL_STATS_KEY: &str = "global_stats";

#[derive(Clone)]
pub struct StatsCache {
    inner: Cache<String, MetricSnapshot>,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder().max_capacity(16).time_to_live(ttl).build(),
        }
    }

    pub async fn get_global(&self) -> Option<MetricSnapshot> {
        self.inner.get(GLOBAL_STATS_KEY).await
    }

    pub async fn publish_global(&self, snapshot: MetricSnapshot) {
        self.inner.insert(GLOBAL_STATS_KEY.to_string(), snapshot).await;
    }

    pub async fn invalidate_global(&self) {
        self.inner.invalidate(GLOBAL_STATS_KEY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_get_returns_the_snapshot() {
        let cache = StatsCache::new(Duration::from_secs(7200));
        assert!(cache.get_global().await.is_none());

        let snapshot = MetricSnapshot {
            dataset_count: Some(9),
            ..Default::default()
        };
        cache.publish_global(snapshot).await;
        let cached = cache.get_global().await.unwrap();
        assert_eq!(cached.dataset_count, Some(9));
    }

    #[tokio::test]
    async fn entries_expire_after_the_ttl() {
        let cache = StatsCache::new(Duration::from_millis(50));
        cache.publish_global(MetricSnapshot::default()).await;
        assert!(cache.get_global().await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get_global().await.is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_the_entry() {
        let cache = StatsCache::new(Duration::from_secs(7200));
        cache.publish_global(MetricSnapshot::default()).await;
        cache.invalidate_global().await;
        assert!(cache.get_global().await.is_none());
    }
}
