//! The canonical statistics contract all warehouse adapters normalize into.
//!
//! A [`MetricSnapshot`] carries exactly nine fields. Scalar metrics are
//! nullable; the four chart/table fields are JSON-encoded strings that are
//! always syntactically valid JSON, degrading to `"[]"` when the producing
//! operation fails. Consumers render missing values as "no data" rather
//! than an error.

use serde::{Deserialize, Serialize};

/// JSON text of an empty sequence, the failure default for chart fields.
pub const EMPTY_JSON_ARRAY: &str = "[]";

/// One full collection result for a single warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub dataset_count: Option<i64>,
    pub total_query_executed: Option<i64>,
    pub table_count: Option<i64>,
    pub avg_execution_time_seconds: Option<f64>,
    pub failure_rate_percentage: Option<f64>,
    /// JSON array of [`MonthlyCost`], trailing 6 months, ascending.
    pub query_cost_by_months_chart: String,
    /// JSON array of [`DailyCost`], trailing 30 days, ascending.
    pub query_cost_by_days_chart: String,
    /// JSON array of [`UserCost`], at most 15 entries, by cost descending.
    pub total_cost_gb_by_users: String,
    /// JSON array of [`TableCost`], deduplicated by `(dataset, table)`.
    pub total_cost_gb_by_table: String,
}

impl Default for MetricSnapshot {
    /// The all-failed snapshot: nulls for scalars, `"[]"` for charts.
    fn default() -> Self {
        Self {
            dataset_count: None,
            total_query_executed: None,
            table_count: None,
            avg_execution_time_seconds: None,
            failure_rate_percentage: None,
            query_cost_by_months_chart: EMPTY_JSON_ARRAY.to_string(),
            query_cost_by_days_chart: EMPTY_JSON_ARRAY.to_string(),
            total_cost_gb_by_users: EMPTY_JSON_ARRAY.to_string(),
            total_cost_gb_by_table: EMPTY_JSON_ARRAY.to_string(),
        }
    }
}

/// One month of query volume and cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyCost {
    /// `YYYY-MM`
    pub month: String,
    pub query_count: i64,
    pub total_cost_gb: f64,
}

/// One day of query volume and cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCost {
    /// `YYYY-MM-DD`
    pub day: String,
    pub query_count: i64,
    pub total_cost_gb: f64,
}

/// Per-user cost attribution. The optional fields are populated only where
/// the warehouse's query history carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCost {
    pub user_email: String,
    pub total_cost_gb: f64,
    pub total_queries: i64,
    pub avg_query_cost_gb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_query_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_query_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_execution_time_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_execution_time_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<i64>,
}

/// Per-table cost (or storage-size) attribution. Cost-based warehouses fill
/// `total_cost_gb`; Fabric fills `size_mb` from reserved page counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCost {
    pub dataset: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_queries: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_query_cost_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_query_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_query_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_execution_time_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_execution_time_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<i64>,
}

impl TableCost {
    /// Storage-size-only entry, used by warehouses without query history.
    pub fn sized(dataset: impl Into<String>, table: impl Into<String>, size_mb: f64) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
            total_cost_gb: None,
            size_mb: Some(size_mb),
            total_queries: None,
            avg_query_cost_gb: None,
            first_query_date: None,
            last_query_date: None,
            total_execution_time_min: None,
            avg_execution_time_sec: None,
            success_count: None,
            failure_count: None,
        }
    }
}
