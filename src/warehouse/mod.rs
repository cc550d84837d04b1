//! Warehouse adapter abstraction layer
//!
//! This module defines the `WarehouseStats` trait which abstracts the fixed
//! battery of metric operations across the supported analytical warehouses
//! (BigQuery, Snowflake, Redshift, Fabric/SQL Server), plus the
//! `QueryExecutor` seam the adapters issue their SQL through.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::errors::{Result, StatsError};
use crate::snapshot::EMPTY_JSON_ARRAY;

pub mod bigquery;
pub mod fabric;
pub mod redshift;
pub mod row;
pub mod snowflake;

pub use row::Row;

/// The warehouse kinds the platform can point its stats collection at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarehouseKind {
    BigQuery,
    Snowflake,
    Redshift,
    Fabric,
}

impl WarehouseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarehouseKind::BigQuery => "bigquery",
            WarehouseKind::Snowflake => "snowflake",
            WarehouseKind::Redshift => "redshift",
            WarehouseKind::Fabric => "fabric",
        }
    }
}

impl fmt::Display for WarehouseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WarehouseKind {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bigquery" => Ok(WarehouseKind::BigQuery),
            "snowflake" => Ok(WarehouseKind::Snowflake),
            "redshift" => Ok(WarehouseKind::Redshift),
            "fabric" => Ok(WarehouseKind::Fabric),
            other => Err(StatsError::UnknownWarehouse(other.to_string())),
        }
    }
}

/// Create a warehouse adapter from configuration
///
/// This is the single point where we convert config into adapter instances.
/// Adding a new warehouse requires adding a match arm here. Construction
/// resolves whatever secrets the adapter needs up front; a missing secret
/// fails the whole refresh run rather than a single operation.
pub fn create_adapter(kind: WarehouseKind, config: &Config) -> Result<Arc<dyn WarehouseStats>> {
    match kind {
        WarehouseKind::BigQuery => Ok(Arc::new(bigquery::BigQueryAdapter::new(config)?)),
        WarehouseKind::Snowflake => Ok(Arc::new(snowflake::SnowflakeAdapter::new(config)?)),
        WarehouseKind::Redshift => Ok(Arc::new(redshift::RedshiftAdapter::new(config))),
        WarehouseKind::Fabric => Ok(Arc::new(fabric::FabricAdapter::new(config))),
    }
}

/// How adapters talk to their warehouse.
///
/// Real executors speak REST (BigQuery, Snowflake), the Postgres wire
/// protocol (Redshift) or TDS (Fabric); tests substitute canned responses.
/// Implementations normalize rows to lower-case keys via [`Row`] and own
/// the connection for the duration of the call.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Row>>;
}

/// Abstract warehouse statistics interface
///
/// One implementor per warehouse kind. Every operation catches its own
/// errors and returns the operation's null/empty default; nothing here may
/// fail past its own boundary, so the collector can always assemble a
/// complete snapshot.
#[async_trait]
pub trait WarehouseStats: Send + Sync {
    fn kind(&self) -> WarehouseKind;

    /// Number of datasets/schemas/databases visible to the platform.
    async fn dataset_count(&self) -> Option<i64>;

    /// All-time executed query count from the warehouse's history.
    async fn total_query_executed(&self) -> Option<i64>;

    /// Number of base tables.
    async fn table_count(&self) -> Option<i64>;

    /// Mean query execution time in seconds, rounded to 2 decimals.
    async fn avg_execution_time_seconds(&self) -> Option<f64>;

    /// Failed queries as a percentage of all queries, rounded to 2 decimals.
    async fn failure_rate_percentage(&self) -> Option<f64>;

    /// JSON array of monthly cost points for the trailing 6 months.
    async fn query_cost_by_month(&self) -> String;

    /// JSON array of daily cost points for the trailing 30 days.
    async fn query_cost_for_last_30_days(&self) -> String;

    /// JSON array of per-user costs, top 15 by cost descending.
    async fn total_cost_gb_by_users(&self) -> String;

    /// JSON array of per-table costs, deduplicated by (dataset, table).
    async fn total_cost_gb_by_table(&self) -> String;
}

/// Degrade a failed scalar operation to `None`, logging the error.
pub(crate) fn degrade<T>(kind: WarehouseKind, operation: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(warehouse = %kind, operation, error = %err, "metric operation degraded to default");
            None
        }
    }
}

/// Degrade a failed chart operation to `"[]"`, logging the error.
pub(crate) fn degrade_json(kind: WarehouseKind, operation: &str, result: Result<String>) -> String {
    degrade(kind, operation, result).unwrap_or_else(|| EMPTY_JSON_ARRAY.to_string())
}

/// Substitute a `{placeholder}` in a query template with an identifier that
/// cannot be bound as a regular parameter in the target dialect.
///
/// Identifiers originate from trusted configuration, but they still pass an
/// allow-list check before interpolation.
pub(crate) fn substitute_identifier(template: &str, placeholder: &str, identifier: &str) -> Result<String> {
    let allowed = identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if identifier.is_empty() || !allowed {
        return Err(StatsError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(template.replace(placeholder, identifier))
}

/// Round to two decimal places, matching the SQL-side ROUND(x, 2) used by
/// warehouses that can do it server-side.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_known_values_case_insensitively() {
        assert_eq!("BigQuery".parse::<WarehouseKind>().unwrap(), WarehouseKind::BigQuery);
        assert_eq!(" snowflake ".parse::<WarehouseKind>().unwrap(), WarehouseKind::Snowflake);
        assert_eq!("redshift".parse::<WarehouseKind>().unwrap(), WarehouseKind::Redshift);
        assert_eq!("fabric".parse::<WarehouseKind>().unwrap(), WarehouseKind::Fabric);
    }

    #[test]
    fn kind_rejects_unknown_values() {
        let err = "databricks".parse::<WarehouseKind>().unwrap_err();
        assert!(matches!(err, StatsError::UnknownWarehouse(ref k) if k == "databricks"));
    }

    #[test]
    fn substitute_identifier_accepts_catalog_locations() {
        let sql = substitute_identifier(
            "SELECT 1 FROM `{location}.INFORMATION_SCHEMA.SCHEMATA`",
            "{location}",
            "my-project.region-europe-west1",
        )
        .unwrap();
        assert_eq!(sql, "SELECT 1 FROM `my-project.region-europe-west1.INFORMATION_SCHEMA.SCHEMATA`");
    }

    #[test]
    fn substitute_identifier_rejects_injection_attempts() {
        for bad in ["db`; DROP TABLE x; --", "a b", "", "db'name"] {
            assert!(substitute_identifier("FROM {location}", "{location}", bad).is_err());
        }
    }

    #[test]
    fn degrade_json_falls_back_to_empty_array() {
        let out = degrade_json(
            WarehouseKind::Redshift,
            "total_cost_gb_by_table",
            Err(StatsError::Query("boom".into())),
        );
        assert_eq!(out, EMPTY_JSON_ARRAY);
    }

    #[test]
    fn round2_matches_sql_rounding() {
        assert_eq!(round2(1.2345), 1.23);
        assert_eq!(round2(9.876), 9.88);
        assert_eq!(round2(0.0), 0.0);
    }
}
