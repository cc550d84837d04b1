//! Snowflake adapter.
//!
//! Talks to the Snowflake SQL API (`/api/v2/statements`) through one
//! session executor created lazily at adapter construction and reused for
//! the adapter's lifetime. Every statement runs under the ACCOUNTADMIN
//! role, which the storage-size metrics require. Secrets resolve
//! environment-first with file fallback, once, at construction - a missing
//! Snowflake secret fails the whole refresh run rather than one operation.
//!
//! Per-table attribution is a best-effort heuristic: the first
//! `FROM <database>.<ident>` reference is regex-extracted from raw query
//! history text; queries with no match are bucketed as `temporary_table`.
//! This is an approximation, not a lineage graph.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::errors::{Result, StatsError};
use crate::secrets::SecretStore;
use crate::snapshot::{DailyCost, MonthlyCost, TableCost, UserCost};
use crate::warehouse::{
    QueryExecutor, Row, WarehouseKind, WarehouseStats, degrade, degrade_json, round2,
    substitute_identifier,
};

const KIND: WarehouseKind = WarehouseKind::Snowflake;
const ADMIN_ROLE: &str = "ACCOUNTADMIN";

/// Fallback bucket for history entries with no table reference.
const TEMPORARY_TABLE: &str = "temporary_table";
/// Dataset assigned to unqualified table references.
const DEFAULT_DATASET: &str = "system";

pub struct SnowflakeAdapter {
    executor: Arc<dyn QueryExecutor>,
    database: String,
}

impl SnowflakeAdapter {
    pub fn new(config: &Config) -> Result<Self> {
        let secrets = SecretStore::new(&config.secrets_root, "snowflake");
        let database = secrets.env_or_file("SNOWFLAKE_DATABASE")?;
        let executor = SnowflakeExecutor::new(config, &secrets, &database)?;
        Ok(Self {
            executor: Arc::new(executor),
            database,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_executor(executor: Arc<dyn QueryExecutor>, database: &str) -> Self {
        Self {
            executor,
            database: database.to_string(),
        }
    }

    /// Run several named queries against the shared session, returning a
    /// per-name result mapping. Used by combined-stats callers that want
    /// one round of session reuse instead of nine independent operations.
    pub async fn execute_batch(&self, queries: &[(&str, &str)]) -> Result<HashMap<String, Vec<Row>>> {
        let mut results = HashMap::with_capacity(queries.len());
        for (name, sql) in queries {
            let rows = self.executor.fetch_rows(sql).await?;
            results.insert((*name).to_string(), rows);
        }
        Ok(results)
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
impl WarehouseStats for SnowflakeAdapter {
    fn kind(&self) -> WarehouseKind {
        KIND
    }

    #[instrument(skip(self))]
    async fn dataset_count(&self) -> Option<i64> {
        let sql = "SELECT COUNT(*) AS dataset_count FROM INFORMATION_SCHEMA.SCHEMATA";
        self.scalar_i64("dataset_count", sql, "dataset_count").await
    }

    #[instrument(skip(self))]
    async fn total_query_executed(&self) -> Option<i64> {
        let sql = "SELECT COUNT(*) AS total_queries_executed FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY";
        self.scalar_i64("total_query_executed", sql, "total_queries_executed").await
    }

    #[instrument(skip(self))]
    async fn table_count(&self) -> Option<i64> {
        let sql = "SELECT COUNT(*) AS table_count FROM INFORMATION_SCHEMA.TABLES";
        self.scalar_i64("table_count", sql, "table_count").await
    }

    #[instrument(skip(self))]
    async fn avg_execution_time_seconds(&self) -> Option<f64> {
        let sql = "SELECT ROUND(AVG(DATEDIFF('second', start_time, end_time)), 2) AS avg_execution_time_seconds \
                   FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY WHERE end_time IS NOT NULL";
        self.scalar_f64("avg_execution_time_seconds", sql, "avg_execution_time_seconds").await
    }

    #[instrument(skip(self))]
    async fn failure_rate_percentage(&self) -> Option<f64> {
        let sql = "SELECT ROUND(100 * COUNT_IF(error_code IS NOT NULL) / COUNT(*), 2) AS query_failure_rate_percentage \
                   FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY";
        self.scalar_f64("failure_rate_percentage", sql, "query_failure_rate_percentage").await
    }

    #[instrument(skip(self))]
    async fn query_cost_by_month(&self) -> String {
        let sql = "WITH monthly_queries AS ( \
                     SELECT TO_VARCHAR(DATE_TRUNC('month', start_time), 'YYYY-MM') AS month, \
                            COUNT(*) AS query_count, \
                            SUM(bytes_scanned) / 1073741824.0 AS query_cost_gb \
                     FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY \
                     WHERE start_time >= DATEADD(month, -6, CURRENT_DATE()) GROUP BY month \
                   ), storage_metrics AS ( \
                     SELECT SUM(((ACTIVE_BYTES + TIME_TRAVEL_BYTES + FAILSAFE_BYTES + RETAINED_FOR_CLONE_BYTES) / 1024)/1024)/1024 AS total_storage_gb \
                     FROM \"INFORMATION_SCHEMA\".TABLE_STORAGE_METRICS WHERE TABLE_CATALOG = CURRENT_DATABASE() \
                   ) \
                   SELECT m.month, m.query_count, \
                          COALESCE(m.query_cost_gb, 0) + COALESCE(s.total_storage_gb, 0) AS total_cost_gb \
                   FROM monthly_queries m CROSS JOIN storage_metrics s ORDER BY month";
        let result = async {
            let rows = self.executor.fetch_rows(sql).await?;
            let points: Vec<MonthlyCost> = rows
                .iter()
                .filter_map(|row| {
                    Some(MonthlyCost {
                        month: row.string("month")?,
                        query_count: row.i64("query_count").unwrap_or(0),
                        total_cost_gb: row.f64("total_cost_gb").unwrap_or(0.0),
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
                     SELECT TO_VARCHAR(DATE_TRUNC('day', start_time), 'YYYY-MM-DD') AS day, \
                            COUNT(*) AS query_count, \
                            SUM(bytes_scanned) / 1073741824.0 AS query_cost_gb \
                     FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY \
                     WHERE start_time >= DATEADD(day, -30, CURRENT_DATE()) GROUP BY day \
                   ), storage_metrics AS ( \
                     SELECT SUM(((ACTIVE_BYTES + TIME_TRAVEL_BYTES + FAILSAFE_BYTES + RETAINED_FOR_CLONE_BYTES) / 1024)/1024)/1024 AS total_storage_gb \
                     FROM \"INFORMATION_SCHEMA\".TABLE_STORAGE_METRICS WHERE TABLE_CATALOG = CURRENT_DATABASE() \
                   ) \
                   SELECT d.day, d.query_count, \
                          COALESCE(d.query_cost_gb, 0) + COALESCE(s.total_storage_gb, 0) AS total_cost_gb \
                   FROM daily_queries d CROSS JOIN storage_metrics s ORDER BY day";
        let result = async {
            let rows = self.executor.fetch_rows(sql).await?;
            let points: Vec<DailyCost> = rows
                .iter()
                .filter_map(|row| {
                    Some(DailyCost {
                        day: row.string("day")?,
                        query_count: row.i64("query_count").unwrap_or(0),
                        total_cost_gb: row.f64("total_cost_gb").unwrap_or(0.0),
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
        let sql = "SELECT USER_NAME AS user_email, COUNT(*) AS total_queries, \
                   SUM(bytes_scanned) / 1073741824.0 AS total_cost_gb, \
                   TO_CHAR(MIN(start_time), 'YYYY-MM-DD HH24:MI:SS') AS first_query_date, \
                   TO_CHAR(MAX(start_time), 'YYYY-MM-DD HH24:MI:SS') AS last_query_date, \
                   ROUND(AVG(DATEDIFF('second', start_time, end_time)), 2) AS avg_execution_time_sec, \
                   SUM(CASE WHEN error_code IS NULL THEN 1 ELSE 0 END) AS success_count, \
                   SUM(CASE WHEN error_code IS NOT NULL THEN 1 ELSE 0 END) AS failure_count \
                   FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY \
                   GROUP BY user_email ORDER BY total_cost_gb DESC LIMIT 15";
        let result = async {
            let rows = self.executor.fetch_rows(sql).await?;
            let users = rank_user_costs(rows.iter().filter_map(map_user_cost).collect());
            Ok(serde_json::to_string(&users)?)
        }
        .await;
        degrade_json(KIND, "total_cost_gb_by_users", result)
    }

    #[instrument(skip(self))]
    async fn total_cost_gb_by_table(&self) -> String {
        let template = "SELECT QUERY_TEXT AS query_text, bytes_scanned, \
                        TO_CHAR(start_time, 'YYYY-MM-DD HH24:MI:SS') AS start_ts, \
                        DATEDIFF('second', start_time, end_time) AS execution_sec, \
                        CASE WHEN error_code IS NULL THEN 0 ELSE 1 END AS failed \
                        FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY \
                        WHERE QUERY_TEXT ILIKE '%FROM%{database}.%' AND bytes_scanned IS NOT NULL";
        let result = async {
            let sql = substitute_identifier(template, "{database}", &self.database)?;
            let rows = self.executor.fetch_rows(&sql).await?;
            let tables = aggregate_table_costs(&rows, &self.database);
            Ok(serde_json::to_string(&tables)?)
        }
        .await;
        degrade_json(KIND, "total_cost_gb_by_table", result)
    }
}

/// How many users the per-user breakdown keeps.
const MAX_USER_ROWS: usize = 15;

/// Order users by cost descending and keep the top entries. The query
/// already asks for this shape; enforce it here too so a misbehaving
/// history view cannot inflate the published breakdown.
fn rank_user_costs(mut users: Vec<UserCost>) -> Vec<UserCost> {
    users.sort_by(|a, b| {
        b.total_cost_gb
            .partial_cmp(&a.total_cost_gb)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    users.truncate(MAX_USER_ROWS);
    users
}

fn map_user_cost(row: &Row) -> Option<UserCost> {
    let user_email = row.string("user_email")?;
    let total_cost_gb = row.f64("total_cost_gb").unwrap_or(0.0);
    let total_queries = row.i64("total_queries").unwrap_or(0);
    let avg_execution_time_sec = row.f64("avg_execution_time_sec").unwrap_or(0.0);
    // avg cost and total minutes are not in the query history view; derive
    // them from what is.
    let avg_query_cost_gb = if total_queries > 0 {
        total_cost_gb / total_queries as f64
    } else {
        0.0
    };
    let total_execution_time_min = if total_queries > 0 {
        (avg_execution_time_sec * total_queries as f64) / 60.0
    } else {
        0.0
    };
    Some(UserCost {
        user_email,
        total_cost_gb,
        total_queries,
        avg_query_cost_gb,
        first_query_date: row.string("first_query_date"),
        last_query_date: row.string("last_query_date"),
        total_execution_time_min: Some(total_execution_time_min),
        avg_execution_time_sec: Some(avg_execution_time_sec),
        success_count: row.i64("success_count"),
        failure_count: row.i64("failure_count"),
    })
}

/// Extract the table a history entry read from, or the temporary bucket.
///
/// Matches the first `FROM <database>.<ident>` (case-insensitive) in the
/// raw query text.
pub(crate) fn attribute_table(query_text: &str, database: &str) -> String {
    static PATTERNS: Lazy<std::sync::Mutex<HashMap<String, Regex>>> =
        Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

    let mut patterns = PATTERNS.lock().unwrap();
    let regex = patterns.entry(database.to_uppercase()).or_insert_with(|| {
        let pattern = format!(r"(?i)\bFROM\s+{}\.([\w.]+)", regex::escape(database));
        Regex::new(&pattern).unwrap()
    });
    regex
        .captures(query_text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| TEMPORARY_TABLE.to_string())
}

/// Split an attributed name into `(dataset, table)`; unqualified names get
/// the `system` dataset, deeper qualification keeps the last two segments.
fn split_table_name(name: &str) -> (String, String) {
    match name.rsplit_once('.') {
        Some((dataset, table)) => {
            let dataset = dataset.rsplit('.').next().unwrap_or(dataset);
            (dataset.to_string(), table.to_string())
        }
        None => (DEFAULT_DATASET.to_string(), name.to_string()),
    }
}

struct TableAccumulator {
    total_queries: i64,
    total_bytes: f64,
    first_seen: Option<String>,
    last_seen: Option<String>,
    execution_sec: f64,
    success_count: i64,
    failure_count: i64,
}

/// Group raw history rows by attributed table and fold the cost metrics.
fn aggregate_table_costs(rows: &[Row], database: &str) -> Vec<TableCost> {
    const GIB: f64 = 1_073_741_824.0;

    let mut grouped: HashMap<String, TableAccumulator> = HashMap::new();
    for row in rows {
        let Some(query_text) = row.string("query_text") else { continue };
        let name = attribute_table(&query_text, database);
        let entry = grouped.entry(name).or_insert_with(|| TableAccumulator {
            total_queries: 0,
            total_bytes: 0.0,
            first_seen: None,
            last_seen: None,
            execution_sec: 0.0,
            success_count: 0,
            failure_count: 0,
        });
        entry.total_queries += 1;
        entry.total_bytes += row.f64("bytes_scanned").unwrap_or(0.0);
        entry.execution_sec += row.f64("execution_sec").unwrap_or(0.0);
        if row.i64("failed").unwrap_or(0) == 0 {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        if let Some(ts) = row.string("start_ts") {
            // YYYY-MM-DD HH:MM:SS compares correctly as text
            if entry.first_seen.as_deref().is_none_or(|seen| ts.as_str() < seen) {
                entry.first_seen = Some(ts.clone());
            }
            if entry.last_seen.as_deref().is_none_or(|seen| ts.as_str() > seen) {
                entry.last_seen = Some(ts);
            }
        }
    }

    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    for (name, acc) in grouped {
        let (dataset, table) = split_table_name(&name);
        if !seen.insert((dataset.clone(), table.clone())) {
            continue;
        }
        let total_cost_gb = acc.total_bytes / GIB;
        tables.push(TableCost {
            dataset,
            table,
            total_cost_gb: Some(total_cost_gb),
            size_mb: None,
            total_queries: Some(acc.total_queries),
            avg_query_cost_gb: Some(if acc.total_queries > 0 {
                total_cost_gb / acc.total_queries as f64
            } else {
                0.0
            }),
            first_query_date: acc.first_seen,
            last_query_date: acc.last_seen,
            total_execution_time_min: Some(acc.execution_sec / 60.0),
            avg_execution_time_sec: Some(if acc.total_queries > 0 {
                round2(acc.execution_sec / acc.total_queries as f64)
            } else {
                0.0
            }),
            success_count: Some(acc.success_count),
            failure_count: Some(acc.failure_count),
        });
    }
    tables.sort_by(|a, b| {
        b.total_cost_gb
            .partial_cmp(&a.total_cost_gb)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    tables
}

/// One reusable SQL API session.
///
/// Stateless at the HTTP level; "session" here means the resolved account,
/// token and context are bound once and every statement explicitly carries
/// the warehouse, database and administrative role.
pub struct SnowflakeExecutor {
    http: reqwest::Client,
    statements_url: String,
    token: String,
    database: String,
    warehouse: String,
    timeout_secs: u64,
}

impl SnowflakeExecutor {
    pub fn new(config: &Config, secrets: &SecretStore, database: &str) -> Result<Self> {
        let account = secrets.env_or_file("SNOWFLAKE_ACCOUNT")?;
        // SNOWFLAKE_USER is required platform-wide even though the SQL API
        // authenticates by token alone; resolve it so a broken secret set
        // fails here and not in some other component.
        let _user = secrets.env_or_file("SNOWFLAKE_USER")?;
        let token = secrets.env_or_file("SNOWFLAKE_TOKEN")?;
        let warehouse = secrets.env_or_file("SNOWFLAKE_WAREHOUSE")?;
        let base = config.snowflake.api_base.replace("{account}", &account);
        Self::from_parts(
            base,
            token,
            database.to_string(),
            warehouse,
            config.snowflake.statement_timeout_secs,
        )
    }

    pub(crate) fn from_parts(
        base: String,
        token: String,
        database: String,
        warehouse: String,
        timeout_secs: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs + 30))
            .build()?;
        Ok(Self {
            http,
            statements_url: format!("{}/api/v2/statements", base.trim_end_matches('/')),
            token,
            database,
            warehouse,
            timeout_secs,
        })
    }
}

#[async_trait]
impl QueryExecutor for SnowflakeExecutor {
    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Row>> {
        debug!(database = %self.database, "executing Snowflake statement");
        let body: Value = self
            .http
            .post(&self.statements_url)
            .bearer_auth(&self.token)
            .header("X-Snowflake-Authorization-Token-Type", "PROGRAMMATIC_ACCESS_TOKEN")
            .query(&[("async", "false")])
            .json(&json!({
                "statement": sql,
                "timeout": self.timeout_secs,
                "database": self.database,
                "warehouse": self.warehouse,
                "role": ADMIN_ROLE,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut rows = parse_statement_response(&body)?;

        // Large results are split into partitions; the statement response
        // inlines only partition 0 and lists the rest in partitionInfo.
        let partitions = body
            .pointer("/resultSetMetaData/partitionInfo")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        if partitions > 1 {
            let handle = body
                .get("statementHandle")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    StatsError::Query("partitioned result carries no statementHandle".into())
                })?;
            let columns = column_types(&body);
            for partition in 1..partitions {
                rows.extend(self.fetch_partition(handle, partition, &columns).await?);
            }
        }
        Ok(rows)
    }
}

impl SnowflakeExecutor {
    /// Fetch one result partition of an executed statement. Partition
    /// bodies carry `data` only; column types come from partition 0.
    async fn fetch_partition(
        &self,
        handle: &str,
        partition: usize,
        columns: &[ColumnType],
    ) -> Result<Vec<Row>> {
        debug!(handle, partition, "fetching Snowflake result partition");
        let body: Value = self
            .http
            .get(format!("{}/{}", self.statements_url, handle))
            .bearer_auth(&self.token)
            .header("X-Snowflake-Authorization-Token-Type", "PROGRAMMATIC_ACCESS_TOKEN")
            .query(&[("partition", partition.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let data = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| StatsError::Query(format!("result partition {partition} carries no data")))?;
        Ok(rows_from_data(data, columns))
    }
}

/// Flatten a SQL API statement response into normalized rows.
///
/// Cells arrive as strings (or null) in `data`; numeric columns are
/// re-typed from `resultSetMetaData.rowType` so Decimal-ish values become
/// plain numbers before any JSON encoding downstream.
fn parse_statement_response(body: &Value) -> Result<Vec<Row>> {
    if let Some(message) = body.get("message").and_then(Value::as_str)
        && body.get("data").is_none()
    {
        return Err(StatsError::Query(format!("Snowflake statement failed: {message}")));
    }

    let Some(data) = body.get("data").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    Ok(rows_from_data(data, &column_types(body)))
}

/// Column name, SQL API type and numeric scale.
type ColumnType = (String, String, i64);

fn column_types(body: &Value) -> Vec<ColumnType> {
    body.pointer("/resultSetMetaData/rowType")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .filter_map(|col| {
                    Some((
                        col.get("name")?.as_str()?.to_string(),
                        col.get("type")?.as_str()?.to_string(),
                        col.get("scale").and_then(Value::as_i64).unwrap_or(0),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn rows_from_data(data: &[Value], columns: &[ColumnType]) -> Vec<Row> {
    let mut rows = Vec::with_capacity(data.len());
    for raw in data {
        let cells = raw.as_array().cloned().unwrap_or_default();
        let mut row = Row::new();
        for ((name, col_type, scale), cell) in columns.iter().zip(cells.into_iter()) {
            row.insert(name, retype_cell(col_type, *scale, cell));
        }
        rows.push(row);
    }
    rows
}

fn retype_cell(col_type: &str, scale: i64, value: Value) -> Value {
    let Value::String(text) = &value else {
        return value;
    };
    match col_type {
        "fixed" if scale == 0 => text.parse::<i64>().map(Value::from).unwrap_or(value),
        "fixed" | "real" => text.parse::<f64>().map(Value::from).unwrap_or(value),
        "boolean" => text.parse::<bool>().map(Value::from).unwrap_or(value),
        _ => value,
    }
}
