//! Fans out the nine metric operations against one adapter and assembles
//! the canonical snapshot.

use tracing::{info, instrument};

use crate::snapshot::MetricSnapshot;
use crate::warehouse::WarehouseStats;

/// Run every metric operation concurrently and gather the results.
///
/// Operations degrade individually inside the adapter, so the snapshot is
/// always complete: scalars fall back to `None` and chart fields to `"[]"`
/// without affecting their siblings.
#[instrument(skip(adapter), fields(warehouse = %adapter.kind()))]
pub async fn collect(adapter: &dyn WarehouseStats) -> MetricSnapshot {
    let (
        dataset_count,
        total_query_executed,
        table_count,
        avg_execution_time_seconds,
        failure_rate_percentage,
        query_cost_by_months_chart,
        query_cost_by_days_chart,
        total_cost_gb_by_users,
        total_cost_gb_by_table,
    ) = tokio::join!(
        adapter.dataset_count(),
        adapter.total_query_executed(),
        adapter.table_count(),
        adapter.avg_execution_time_seconds(),
        adapter.failure_rate_percentage(),
        adapter.query_cost_by_month(),
        adapter.query_cost_for_last_30_days(),
        adapter.total_cost_gb_by_users(),
        adapter.total_cost_gb_by_table(),
    );

    let snapshot = MetricSnapshot {
        dataset_count,
        total_query_executed,
        table_count,
        avg_execution_time_seconds,
        failure_rate_percentage,
        query_cost_by_months_chart,
        query_cost_by_days_chart,
        total_cost_gb_by_users,
        total_cost_gb_by_table,
    };
    info!(
        dataset_count = ?snapshot.dataset_count,
        table_count = ?snapshot.table_count,
        "collected warehouse statistics"
    );
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::WarehouseKind;
    use crate::warehouse::test_support::StaticAdapter;

    #[tokio::test]
    async fn snapshot_carries_every_field_from_the_adapter() {
        let mut adapter = StaticAdapter::new(WarehouseKind::BigQuery);
        adapter.scalars.insert("dataset_count", 12);
        adapter.scalars.insert("total_query_executed", 4_402);
        adapter.scalars.insert("table_count", 310);

        let snapshot = collect(&adapter).await;
        assert_eq!(snapshot.dataset_count, Some(12));
        assert_eq!(snapshot.total_query_executed, Some(4_402));
        assert_eq!(snapshot.table_count, Some(310));
        assert_eq!(snapshot.query_cost_by_months_chart, "[]");
        assert_eq!(snapshot.total_cost_gb_by_table, "[]");
    }

    #[tokio::test]
    async fn repeated_collection_is_deterministic() {
        let mut adapter = StaticAdapter::new(WarehouseKind::Snowflake);
        adapter.scalars.insert("dataset_count", 3);
        adapter.scalars.insert("failure_rate_percentage", 2);

        let first = serde_json::to_string(&collect(&adapter).await).unwrap();
        let second = serde_json::to_string(&collect(&adapter).await).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn absent_metrics_serialize_as_nulls_and_empty_arrays() {
        let adapter = StaticAdapter::new(WarehouseKind::Fabric);
        let snapshot = collect(&adapter).await;
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value["dataset_count"].is_null());
        assert!(value["avg_execution_time_seconds"].is_null());
        assert_eq!(value["query_cost_by_days_chart"], "[]");
    }
}
