//! Microsoft Fabric / SQL Server adapter.
//!
//! Talks TDS through tiberius, one connection per query. Secrets are read
//! from mounted files only; there is no environment fallback for this
//! warehouse.
//!
//! Stock Fabric warehouses do not retain query history, so the
//! history-derived metrics (query totals, execution times, failure rate,
//! cost charts, per-user costs) are fixed at their defaults. Table storage
//! comes from `sys.dm_db_partition_stats` and is reported as `size_mb`
//! entries rather than scanned-byte costs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tiberius::{AuthMethod, Client, ColumnData, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::errors::Result;
use crate::secrets::SecretStore;
use crate::snapshot::{EMPTY_JSON_ARRAY, TableCost};
use crate::warehouse::{QueryExecutor, Row, WarehouseKind, WarehouseStats, degrade, degrade_json};

const KIND: WarehouseKind = WarehouseKind::Fabric;

pub struct FabricAdapter {
    executor: Arc<dyn QueryExecutor>,
}

impl FabricAdapter {
    pub fn new(config: &Config) -> Self {
        Self {
            executor: Arc::new(FabricExecutor::new(config)),
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
}

#[async_trait]
impl WarehouseStats for FabricAdapter {
    fn kind(&self) -> WarehouseKind {
        KIND
    }

    #[instrument(skip(self))]
    async fn dataset_count(&self) -> Option<i64> {
        let sql = "SELECT COUNT(*) AS dataset_count FROM sys.databases";
        self.scalar_i64("dataset_count", sql, "dataset_count").await
    }

    #[instrument(skip(self))]
    async fn total_query_executed(&self) -> Option<i64> {
        // Query history is not tracked on stock Fabric warehouses.
        None
    }

    #[instrument(skip(self))]
    async fn table_count(&self) -> Option<i64> {
        let sql = "SELECT COUNT(*) AS table_count FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_TYPE='BASE TABLE'";
        self.scalar_i64("table_count", sql, "table_count").await
    }

    #[instrument(skip(self))]
    async fn avg_execution_time_seconds(&self) -> Option<f64> {
        None
    }

    #[instrument(skip(self))]
    async fn failure_rate_percentage(&self) -> Option<f64> {
        None
    }

    #[instrument(skip(self))]
    async fn query_cost_by_month(&self) -> String {
        EMPTY_JSON_ARRAY.to_string()
    }

    #[instrument(skip(self))]
    async fn query_cost_for_last_30_days(&self) -> String {
        EMPTY_JSON_ARRAY.to_string()
    }

    #[instrument(skip(self))]
    async fn total_cost_gb_by_users(&self) -> String {
        EMPTY_JSON_ARRAY.to_string()
    }

    #[instrument(skip(self))]
    async fn total_cost_gb_by_table(&self) -> String {
        let sql = "SELECT TABLE_SCHEMA, TABLE_NAME, \
                   SUM(CAST(reserved_page_count AS BIGINT)) * 8.0 / 1024 AS size_mb \
                   FROM sys.dm_db_partition_stats AS ps \
                   JOIN INFORMATION_SCHEMA.TABLES AS t ON OBJECT_NAME(ps.object_id) = t.TABLE_NAME \
                   WHERE t.TABLE_TYPE = 'BASE TABLE' \
                   GROUP BY TABLE_SCHEMA, TABLE_NAME \
                   ORDER BY size_mb DESC";
        let result = async {
            let rows = self.executor.fetch_rows(sql).await?;
            Ok(serde_json::to_string(&map_table_sizes(&rows))?)
        }
        .await;
        degrade_json(KIND, "total_cost_gb_by_table", result)
    }
}

fn map_table_sizes(rows: &[Row]) -> Vec<TableCost> {
    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    for row in rows {
        let dataset = row.string("table_schema").unwrap_or_else(|| "system".to_string());
        let table = row.string("table_name").unwrap_or_else(|| "unknown".to_string());
        if !seen.insert((dataset.clone(), table.clone())) {
            continue;
        }
        tables.push(TableCost::sized(dataset, table, row.f64("size_mb").unwrap_or(0.0)));
    }
    tables
}

/// Opens one tiberius client per query against the TDS endpoint.
pub struct FabricExecutor {
    secrets: SecretStore,
}

impl FabricExecutor {
    pub fn new(config: &Config) -> Self {
        Self {
            secrets: SecretStore::new(&config.secrets_root, "fabric"),
        }
    }

    fn client_config(&self) -> Result<tiberius::Config> {
        let server = self.secrets.file_only("FABRIC_SERVER")?;
        let port: u16 = self
            .secrets
            .file_only("FABRIC_PORT")?
            .parse()
            .map_err(|err| crate::errors::StatsError::Query(format!("invalid FABRIC_PORT: {err}")))?;
        let database = self.secrets.file_only("FABRIC_DATABASE")?;
        let user = self.secrets.file_only("FABRIC_USER")?;
        let password = self.secrets.file_only("FABRIC_PASSWORD")?;

        let mut config = tiberius::Config::new();
        config.host(&server);
        config.port(port);
        config.database(&database);
        config.authentication(AuthMethod::sql_server(&user, &password));
        config.encryption(EncryptionLevel::Required);
        config.trust_cert();
        Ok(config)
    }
}

#[async_trait]
impl QueryExecutor for FabricExecutor {
    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Row>> {
        let config = self.client_config()?;
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let mut client = Client::connect(config, tcp.compat_write()).await?;
        debug!("executing Fabric query");
        let results = client.simple_query(sql).await?.into_results().await?;
        Ok(results
            .into_iter()
            .flatten()
            .map(convert_tds_row)
            .collect())
    }
}

fn convert_tds_row(row: tiberius::Row) -> Row {
    let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut out = Row::new();
    for (name, data) in names.into_iter().zip(row.into_iter()) {
        out.insert(&name, convert_tds_cell(data));
    }
    out
}

fn convert_tds_cell(data: ColumnData<'_>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(|v| Value::from(v as i64)).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(|v| Value::from(v as i64)).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(|v| Value::from(v as i64)).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|v| Value::from(v as f64)).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::String(v) => v.map(|s| Value::from(s.into_owned())).unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v
            .map(|n| Value::from(n.value() as f64 / 10f64.powi(n.scale() as i32)))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::test_support::MockExecutor;
    use serde_json::json;

    #[tokio::test]
    async fn counts_come_from_catalog_views() {
        let executor = MockExecutor::new()
            .on("sys.databases", vec![MockExecutor::row(&[("dataset_count", json!(4))])])
            .on(
                "INFORMATION_SCHEMA.TABLES WHERE TABLE_TYPE",
                vec![MockExecutor::row(&[("table_count", json!(118))])],
            );
        let adapter = FabricAdapter::from_executor(Arc::new(executor));
        assert_eq!(adapter.dataset_count().await, Some(4));
        assert_eq!(adapter.table_count().await, Some(118));
    }

    #[tokio::test]
    async fn history_metrics_stay_at_defaults() {
        let adapter = FabricAdapter::from_executor(Arc::new(MockExecutor::new()));
        assert_eq!(adapter.total_query_executed().await, None);
        assert_eq!(adapter.avg_execution_time_seconds().await, None);
        assert_eq!(adapter.failure_rate_percentage().await, None);
        assert_eq!(adapter.query_cost_by_month().await, "[]");
        assert_eq!(adapter.query_cost_for_last_30_days().await, "[]");
        assert_eq!(adapter.total_cost_gb_by_users().await, "[]");
    }

    #[tokio::test]
    async fn table_sizes_serialize_as_size_mb_entries() {
        let executor = MockExecutor::new().on(
            "dm_db_partition_stats",
            vec![
                MockExecutor::row(&[
                    ("TABLE_SCHEMA", json!("dbo")),
                    ("TABLE_NAME", json!("fact_orders")),
                    ("size_mb", json!(812.5)),
                ]),
                MockExecutor::row(&[
                    ("TABLE_SCHEMA", json!("dbo")),
                    ("TABLE_NAME", json!("fact_orders")),
                    ("size_mb", json!(10.0)),
                ]),
                MockExecutor::row(&[
                    ("TABLE_SCHEMA", Value::Null),
                    ("TABLE_NAME", Value::Null),
                    ("size_mb", Value::Null),
                ]),
            ],
        );
        let adapter = FabricAdapter::from_executor(Arc::new(executor));
        let tables: Vec<serde_json::Value> =
            serde_json::from_str(&adapter.total_cost_gb_by_table().await).unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0]["dataset"], "dbo");
        assert_eq!(tables[0]["table"], "fact_orders");
        assert_eq!(tables[0]["size_mb"], 812.5);
        assert_eq!(tables[0].as_object().unwrap().len(), 3);
        assert_eq!(tables[1]["dataset"], "system");
        assert_eq!(tables[1]["table"], "unknown");
    }

    #[tokio::test]
    async fn catalog_failure_degrades_to_defaults() {
        let executor = MockExecutor::new()
            .failing("sys.databases")
            .failing("dm_db_partition_stats");
        let adapter = FabricAdapter::from_executor(Arc::new(executor));
        assert_eq!(adapter.dataset_count().await, None);
        assert_eq!(adapter.total_cost_gb_by_table().await, "[]");
    }
}
