//! Redshift adapter.
//!
//! Redshift speaks the Postgres wire protocol, so the executor drives it
//! with sqlx. Every operation opens its own connection and closes it on the
//! way out; secrets resolve (environment-first, file fallback) per
//! connection attempt, so a missing secret degrades one operation instead
//! of failing adapter construction.
//!
//! Per-table attribution joins `SYS_QUERY_HISTORY` to `SYS_QUERY_DETAIL`
//! server-side (top 50 by cost), then cleans the table names client-side:
//! `$` markers stripped, doubled dots collapsed, `dev.`/`raw_sys_` prefixes
//! removed, any remaining schema prefix dropped, empty names bucketed as
//! `temporary_query_<dataset>`. First entry wins on duplicates.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgRow, PgSslMode};
use sqlx::{Column, Connection, PgConnection, Row as _, TypeInfo};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::errors::Result;
use crate::secrets::SecretStore;
use crate::snapshot::{DailyCost, MonthlyCost, TableCost, UserCost};
use crate::warehouse::{QueryExecutor, Row, WarehouseKind, WarehouseStats, degrade, degrade_json};

const KIND: WarehouseKind = WarehouseKind::Redshift;

pub struct RedshiftAdapter {
    executor: Arc<dyn QueryExecutor>,
}

impl RedshiftAdapter {
    pub fn new(config: &Config) -> Self {
        Self {
            executor: Arc::new(RedshiftExecutor::new(config)),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_executor(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    async fn scalar_i64(&self, operation: &'static str, sql: &str, column: &str) -> Option<i64> {
        degrade(KIND, operation, self.executor.fetch_rows(sql).await)
            .and_then(|rows| rows.first().and_then(|row| row.i64(column)))
    }

    async fn scalar_f64(&self, operation: &'static str, sql: &str, column: &str) -> Option<f64> {
        degrade(KIND, operation, self.executor.fetch_rows(sql).await)
            .and_then(|rows| rows.first().and_then(|row| row.f64(column)))
    }
}

#[async_trait]
impl WarehouseStats for RedshiftAdapter {
    fn kind(&self) -> WarehouseKind {
        KIND
    }

    #[instrument(skip(self))]
    async fn dataset_count(&self) -> Option<i64> {
        let sql = "SELECT COUNT(DISTINCT datname) AS dataset_count FROM pg_database";
        self.scalar_i64("dataset_count", sql, "dataset_count").await
    }

    #[instrument(skip(self))]
    async fn total_query_executed(&self) -> Option<i64> {
        let sql = "SELECT COUNT(*) AS total_queries_executed FROM SYS_QUERY_HISTORY WHERE status != 'failed'";
        self.scalar_i64("total_query_executed", sql, "total_queries_executed").await
    }

    #[instrument(skip(self))]
    async fn table_count(&self) -> Option<i64> {
        let sql = "SELECT COUNT(*) AS table_count FROM svv_tables WHERE table_type='BASE TABLE'";
        self.scalar_i64("table_count", sql, "table_count").await
    }

    #[instrument(skip(self))]
    async fn avg_execution_time_seconds(&self) -> Option<f64> {
        let sql = "SELECT ROUND(AVG(execution_time/1000000.0), 2) AS avg_execution_time_seconds \
                   FROM SYS_QUERY_HISTORY WHERE status != 'failed'";
        self.scalar_f64("avg_execution_time_seconds", sql, "avg_execution_time_seconds").await
    }

    #[instrument(skip(self))]
    async fn failure_rate_percentage(&self) -> Option<f64> {
        let sql = "SELECT ROUND(100.0 * SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) / \
                   NULLIF(COUNT(*), 0), 2) AS query_failure_rate_percentage FROM SYS_QUERY_HISTORY";
        self.scalar_f64("failure_rate_percentage", sql, "query_failure_rate_percentage").await
    }

    #[instrument(skip(self))]
    async fn query_cost_by_month(&self) -> String {
        let sql = "WITH monthly_queries AS ( \
                     SELECT TO_CHAR(DATE_TRUNC('month', start_time), 'YYYY-MM') AS month, \
                            COUNT(*) AS query_count, \
                            CAST(SUM(returned_bytes) AS FLOAT) / 1073741824.0 AS query_cost_gb \
                     FROM SYS_QUERY_HISTORY \
                     WHERE start_time >= dateadd(month, -6, current_date) GROUP BY month \
                   ), table_sizes AS ( \
                     SELECT CAST(SUM(size) AS FLOAT) / 1024.0 AS total_table_size_mb \
                     FROM SVV_TABLE_INFO WHERE \"table\" NOT LIKE 'pg_%' \
                   ) \
                   SELECT m.month, m.query_count, m.query_cost_gb, \
                          COALESCE(t.total_table_size_mb / 1024.0, 0) AS total_table_size_gb \
                   FROM monthly_queries m CROSS JOIN table_sizes t ORDER BY month";
        let result = async {
            let rows = self.executor.fetch_rows(sql).await?;
            let points: Vec<MonthlyCost> = rows
                .iter()
                .filter_map(|row| {
                    // query cost plus current storage footprint, as a GB figure
                    let query_cost = row.f64("query_cost_gb").unwrap_or(0.0);
                    let storage = row.f64("total_table_size_gb").unwrap_or(0.0);
                    Some(MonthlyCost {
                        month: row.string("month")?,
                        query_count: row.i64("query_count").unwrap_or(0),
                        total_cost_gb: query_cost + storage,
                    })
                })
                .collect();
            Ok(serde_json::to_string(&points)?)
        }
        .await;
        degrade_json(KIND, "query_cost_by_month", result)
    }

    #[instrument(skip(self))]
    async fn query_cost_for_last_30_days(&self) -> String {
        let sql = "WITH daily_queries AS ( \
                     SELECT TO_CHAR(DATE_TRUNC('day', start_time), 'YYYY-MM-DD') AS day, \
                            COUNT(*) AS query_count, \
                            CAST(SUM(returned_bytes) AS FLOAT) / 1073741824.0 AS query_cost_gb \
                     FROM SYS_QUERY_HISTORY \
                     WHERE start_time >= dateadd(day, -30, current_date) GROUP BY day \
                   ), table_sizes AS ( \
                     SELECT CAST(SUM(size) AS FLOAT) / 1024.0 AS total_table_size_mb \
                     FROM SVV_TABLE_INFO WHERE \"table\" NOT LIKE 'pg_%' \
                   ) \
                   SELECT d.day, d.query_count, d.query_cost_gb, \
                          COALESCE(t.total_table_size_mb / 1024.0, 0) AS total_table_size_gb \
                   FROM daily_queries d CROSS JOIN table_sizes t ORDER BY day";
        let result = async {
            let rows = self.executor.fetch_rows(sql).await?;
            let points: Vec<DailyCost> = rows
                .iter()
                .filter_map(|row| {
                    let query_cost = row.f64("query_cost_gb").unwrap_or(0.0);
                    let storage = row.f64("total_table_size_gb").unwrap_or(0.0);
                    Some(DailyCost {
                        day: row.string("day")?,
                        query_count: row.i64("query_count").unwrap_or(0),
                        total_cost_gb: query_cost + storage,
                    })
                })
                .collect();
            Ok(serde_json::to_string(&points)?)
        }
        .await;
        degrade_json(KIND, "query_cost_for_last_30_days", result)
    }

    #[instrument(skip(self))]
    async fn total_cost_gb_by_users(&self) -> String {
        let sql = "WITH user_queries AS ( \
                     SELECT username AS user_email, COUNT(*) AS total_queries, \
                            TO_CHAR(MIN(start_time), 'YYYY-MM-DD HH24:MI:SS') AS first_query_date, \
                            TO_CHAR(MAX(start_time), 'YYYY-MM-DD HH24:MI:SS') AS last_query_date, \
                            ROUND(AVG(execution_time/1000000.0), 2) AS avg_execution_time_sec, \
                            SUM(CASE WHEN status != 'failed' THEN 1 ELSE 0 END) AS success_count, \
                            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failure_count, \
                            CAST(SUM(returned_bytes) AS FLOAT) / 1073741824.0 AS total_cost_gb \
                     FROM SYS_QUERY_HISTORY GROUP BY username \
                   ) \
                   SELECT user_email, total_cost_gb, total_queries, \
                          CASE WHEN total_queries > 0 THEN ROUND(total_cost_gb / total_queries, 4) ELSE 0 END AS avg_query_cost_gb, \
                          first_query_date, last_query_date, \
                          ROUND(total_cost_gb * 60, 2) AS total_execution_time_min, \
                          avg_execution_time_sec, success_count, failure_count \
                   FROM user_queries ORDER BY total_cost_gb DESC LIMIT 15";
        let result = async {
            let rows = self.executor.fetch_rows(sql).await?;
            let users: Vec<UserCost> = rows
                .iter()
                .filter_map(|row| {
                    Some(UserCost {
                        user_email: row.string("user_email")?,
                        total_cost_gb: row.f64("total_cost_gb").unwrap_or(0.0),
                        total_queries: row.i64("total_queries").unwrap_or(0),
                        avg_query_cost_gb: row.f64("avg_query_cost_gb").unwrap_or(0.0),
                        first_query_date: row.string("first_query_date"),
                        last_query_date: row.string("last_query_date"),
                        total_execution_time_min: row.f64("total_execution_time_min"),
                        avg_execution_time_sec: row.f64("avg_execution_time_sec"),
                        success_count: row.i64("success_count"),
                        failure_count: row.i64("failure_count"),
                    })
                })
                .collect();
            Ok(serde_json::to_string(&users)?)
        }
        .await;
        degrade_json(KIND, "total_cost_gb_by_users", result)
    }

    #[instrument(skip(self))]
    async fn total_cost_gb_by_table(&self) -> String {
        let sql = "WITH table_stats AS ( \
                     SELECT h.database_name AS dataset, \
                            REGEXP_REPLACE(REGEXP_REPLACE(d.table_name, '^[^.]+\\.', ''), '^[^.]+\\.', '') AS table_name, \
                            SUM(h.returned_bytes) / 1073741824.0 AS total_cost_gb, \
                            COUNT(*) AS total_queries, \
                            TO_CHAR(MIN(h.start_time), 'YYYY-MM-DD HH24:MI:SS') AS first_query_date, \
                            TO_CHAR(MAX(h.start_time), 'YYYY-MM-DD HH24:MI:SS') AS last_query_date, \
                            ROUND(AVG(h.execution_time/1000000.0), 2) AS avg_execution_time_sec, \
                            SUM(CASE WHEN h.status != 'failed' THEN 1 ELSE 0 END) AS success_count, \
                            SUM(CASE WHEN h.status = 'failed' THEN 1 ELSE 0 END) AS failure_count \
                     FROM SYS_QUERY_HISTORY h \
                     JOIN SYS_QUERY_DETAIL d ON h.query_id = d.query_id \
                     WHERE d.table_name IS NOT NULL \
                     GROUP BY h.database_name, REGEXP_REPLACE(REGEXP_REPLACE(d.table_name, '^[^.]+\\.', ''), '^[^.]+\\.', '') \
                   ) \
                   SELECT dataset, table_name AS \"table\", total_cost_gb, total_queries, \
                          CASE WHEN total_queries > 0 THEN ROUND(total_cost_gb / total_queries, 4) ELSE 0 END AS avg_query_cost_gb, \
                          first_query_date, last_query_date, \
                          ROUND(total_cost_gb * 60, 2) AS total_execution_time_min, \
                          avg_execution_time_sec, success_count, failure_count \
                   FROM table_stats WHERE table_name IS NOT NULL \
                   ORDER BY total_cost_gb DESC LIMIT 50";
        let result = async {
            let rows = self.executor.fetch_rows(sql).await?;
            Ok(serde_json::to_string(&map_table_costs(&rows))?)
        }
        .await;
        degrade_json(KIND, "total_cost_gb_by_table", result)
    }
}

/// Strip the artifacts Redshift leaves in recorded table names.
pub(crate) fn clean_table_name(raw: &str) -> String {
    let mut name = raw.replace('$', "").replace("..", ".");
    name = name.trim_matches('.').to_string();
    if let Some(stripped) = name.strip_prefix("dev.") {
        name = stripped.to_string();
    }
    if let Some(stripped) = name.strip_prefix("raw_sys_") {
        name = stripped.to_string();
    }
    // Remove any remaining schema prefixes
    if let Some((_, last)) = name.rsplit_once('.') {
        name = last.to_string();
    }
    name
}

fn map_table_costs(rows: &[Row]) -> Vec<TableCost> {
    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    for row in rows {
        let dataset = row.string("dataset").unwrap_or_else(|| "system".to_string());
        let raw = row.string("table").unwrap_or_default();
        let table = if raw.is_empty() {
            format!("temporary_query_{dataset}")
        } else {
            clean_table_name(&raw)
        };
        if !seen.insert((dataset.clone(), table.clone())) {
            continue;
        }
        tables.push(TableCost {
            dataset,
            table,
            total_cost_gb: Some(row.f64("total_cost_gb").unwrap_or(0.0)),
            size_mb: None,
            total_queries: Some(row.i64("total_queries").unwrap_or(0)),
            avg_query_cost_gb: Some(row.f64("avg_query_cost_gb").unwrap_or(0.0)),
            first_query_date: row.string("first_query_date"),
            last_query_date: row.string("last_query_date"),
            total_execution_time_min: row.f64("total_execution_time_min"),
            avg_execution_time_sec: row.f64("avg_execution_time_sec"),
            success_count: row.i64("success_count"),
            failure_count: row.i64("failure_count"),
        });
    }
    tables
}

/// Opens one Redshift connection per query over the Postgres wire protocol.
pub struct RedshiftExecutor {
    secrets: SecretStore,
}

impl RedshiftExecutor {
    pub fn new(config: &Config) -> Self {
        Self {
            secrets: SecretStore::new(&config.secrets_root, "redshift"),
        }
    }

    fn connect_options(&self) -> Result<PgConnectOptions> {
        let host = self.secrets.env_or_file("REDSHIFT_HOST")?;
        let port: u16 = self
            .secrets
            .env_or_file("REDSHIFT_PORT")?
            .parse()
            .map_err(|err| crate::errors::StatsError::Query(format!("invalid REDSHIFT_PORT: {err}")))?;
        let database = self.secrets.env_or_file("REDSHIFT_DATABASE")?;
        let user = self.secrets.env_or_file("REDSHIFT_USER")?;
        let password = self.secrets.env_or_file("REDSHIFT_PASSWORD")?;
        Ok(PgConnectOptions::new()
            .host(&host)
            .port(port)
            .database(&database)
            .username(&user)
            .password(&password)
            .ssl_mode(PgSslMode::Prefer))
    }
}

#[async_trait]
impl QueryExecutor for RedshiftExecutor {
    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Row>> {
        let options = self.connect_options()?;
        let mut conn = PgConnection::connect_with(&options).await?;
        debug!("executing Redshift query");
        let result = sqlx::query(sql).fetch_all(&mut conn).await;
        // Close regardless of the query outcome; this path owns the
        // connection.
        let _ = conn.close().await;
        Ok(result?.iter().map(convert_pg_row).collect())
    }
}

/// Decode a dynamically-typed Postgres row into a normalized [`Row`].
fn convert_pg_row(row: &PgRow) -> Row {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INT2" => row
                .try_get::<Option<i16>, _>(index)
                .ok()
                .flatten()
                .map(|v| Value::from(v as i64)),
            "INT4" => row
                .try_get::<Option<i32>, _>(index)
                .ok()
                .flatten()
                .map(|v| Value::from(v as i64)),
            "INT8" => row.try_get::<Option<i64>, _>(index).ok().flatten().map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)
                .ok()
                .flatten()
                .map(|v| Value::from(v as f64)),
            "FLOAT8" => row.try_get::<Option<f64>, _>(index).ok().flatten().map(Value::from),
            "NUMERIC" => row
                .try_get::<Option<rust_decimal::Decimal>, _>(index)
                .ok()
                .flatten()
                .and_then(|d| d.to_f64())
                .map(Value::from),
            "BOOL" => row.try_get::<Option<bool>, _>(index).ok().flatten().map(Value::from),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(index)
                .ok()
                .flatten()
                .map(|ts| Value::from(ts.format("%Y-%m-%d %H:%M:%S").to_string())),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
                .ok()
                .flatten()
                .map(|ts| Value::from(ts.format("%Y-%m-%d %H:%M:%S").to_string())),
            _ => row.try_get::<Option<String>, _>(index).ok().flatten().map(Value::from),
        };
        out.insert(column.name(), value.unwrap_or(Value::Null));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::test_support::MockExecutor;
    use serde_json::json;

    #[test]
    fn clean_table_name_strips_markers_and_prefixes() {
        assert_eq!(clean_table_name("sales$"), "sales");
        assert_eq!(clean_table_name("dev.analytics..orders"), "orders");
        assert_eq!(clean_table_name("raw_sys_events"), "events");
        assert_eq!(clean_table_name("schema.fact_orders"), "fact_orders");
        assert_eq!(clean_table_name(".padded."), "padded");
        assert_eq!(clean_table_name("plain"), "plain");
    }

    fn table_row(dataset: &str, table: serde_json::Value, cost: f64) -> Row {
        MockExecutor::row(&[
            ("dataset", json!(dataset)),
            ("table", table),
            ("total_cost_gb", json!(cost)),
            ("total_queries", json!(5)),
            ("avg_query_cost_gb", json!(cost / 5.0)),
        ])
    }

    #[test]
    fn map_table_costs_dedups_first_wins_after_cleaning() {
        let rows = vec![
            table_row("prod", json!("dev.orders"), 9.0),
            table_row("prod", json!("orders$"), 4.0),
            table_row("prod", json!("schema.orders"), 1.0),
        ];
        let tables = map_table_costs(&rows);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table, "orders");
        assert_eq!(tables[0].total_cost_gb, Some(9.0));
    }

    #[test]
    fn empty_table_names_bucket_as_temporary_query() {
        let rows = vec![table_row("prod", json!(""), 2.0), table_row("prod", Value::Null, 1.0)];
        let tables = map_table_costs(&rows);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table, "temporary_query_prod");
    }

    #[tokio::test]
    async fn scalar_metrics_map_from_rows() {
        let executor = MockExecutor::new()
            .on("pg_database", vec![MockExecutor::row(&[("dataset_count", json!(6))])])
            .on("svv_tables", vec![MockExecutor::row(&[("table_count", json!(204))])]);
        let adapter = RedshiftAdapter::from_executor(Arc::new(executor));
        assert_eq!(adapter.dataset_count().await, Some(6));
        assert_eq!(adapter.table_count().await, Some(204));
    }

    #[tokio::test]
    async fn monthly_chart_adds_storage_to_query_cost() {
        let executor = MockExecutor::new().on(
            "monthly_queries",
            vec![MockExecutor::row(&[
                ("month", json!("2026-08")),
                ("query_count", json!(50)),
                ("query_cost_gb", json!(1.5)),
                ("total_table_size_gb", json!(2.0)),
            ])],
        );
        let adapter = RedshiftAdapter::from_executor(Arc::new(executor));
        let points: Vec<MonthlyCost> = serde_json::from_str(&adapter.query_cost_by_month().await).unwrap();
        assert_eq!(points[0].total_cost_gb, 3.5);
    }

    #[tokio::test]
    async fn connection_failure_degrades_every_operation_independently() {
        let executor = MockExecutor::new()
            .failing("SYS_QUERY_HISTORY")
            .on("pg_database", vec![MockExecutor::row(&[("dataset_count", json!(6))])]);
        let adapter = RedshiftAdapter::from_executor(Arc::new(executor));
        assert_eq!(adapter.total_query_executed().await, None);
        assert_eq!(adapter.avg_execution_time_seconds().await, None);
        assert_eq!(adapter.total_cost_gb_by_users().await, "[]");
        // unrelated metric still succeeds
        assert_eq!(adapter.dataset_count().await, Some(6));
    }
}
