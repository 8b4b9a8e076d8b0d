// MySQL adapter using connection pooling for optimal resource management
use std::time::Duration;

use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Pool, PoolConstraints, PoolOpts, Row, Value as MySqlValue};
use url::Url;

use crate::error::ExecutionError;
use crate::models::{group_columns, ColumnSchema, RowSet, TableSchema};
use crate::services::connection_pool::mask_credentials;
use crate::services::database::adapter::{coerce_text_value, SourceAdapter};
use crate::services::database::Engine;

/// MySQL-protocol adapter. Doris reuses it with its own engine tag.
pub struct MySqlAdapter {
    source_id: String,
    engine: Engine,
    pool: Pool,
}

impl MySqlAdapter {
    pub fn new(source_id: &str, connection_url: &str, pool_size: usize) -> Result<Self, ExecutionError> {
        Self::for_engine(source_id, connection_url, pool_size, Engine::Mysql)
    }

    pub(crate) fn for_engine(
        source_id: &str,
        connection_url: &str,
        pool_size: usize,
        engine: Engine,
    ) -> Result<Self, ExecutionError> {
        // Validate MySQL URL format
        let url = Url::parse(connection_url)
            .map_err(|e| ExecutionError::connection(format!("Invalid {} URL: {}", engine, e)))?;

        if url.scheme() != "mysql" && url.scheme() != "mariadb" {
            return Err(ExecutionError::connection(
                "URL must use mysql:// or mariadb:// scheme",
            ));
        }

        // mysql_async only understands the mysql:// scheme
        let normalized = connection_url.replacen("mariadb://", "mysql://", 1);
        let opts = Opts::from_url(&normalized)
            .map_err(|e| ExecutionError::connection(format!("Invalid {} URL: {}", engine, e)))?;
        let constraints = PoolConstraints::new(0, pool_size.max(1)).unwrap_or_default();
        let opts = mysql_async::OptsBuilder::from_opts(opts)
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        tracing::debug!(source = source_id, url = %mask_credentials(connection_url), "{} source registered", engine);
        Ok(Self {
            source_id: source_id.to_string(),
            engine,
            pool: Pool::new(opts),
        })
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<Conn, ExecutionError> {
        self.pool.get_conn().await.map_err(map_mysql_error)
    }

    /// Column rows for the current database, skipping the given schemas.
    pub(crate) async fn describe_schema_excluding(
        &self,
        excluded: &[&str],
    ) -> Result<Vec<TableSchema>, ExecutionError> {
        let mut conn = self.get_conn().await?;
        let rows: Vec<(String, String, String, String, String)> = conn
            .query(
                r#"
                SELECT
                    TABLE_SCHEMA,
                    TABLE_NAME,
                    COLUMN_NAME,
                    DATA_TYPE,
                    IS_NULLABLE
                FROM information_schema.COLUMNS
                WHERE TABLE_SCHEMA = DATABASE()
                ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION
                "#,
            )
            .await
            .map_err(map_mysql_error)?;

        Ok(group_columns(
            rows.into_iter()
                .filter(|(schema, ..)| !excluded.contains(&schema.as_str()))
                .map(|(schema, table, column, data_type, nullable)| {
                    (Some(schema), table, column, data_type, nullable == "YES")
                }),
        ))
    }
}

#[async_trait::async_trait]
impl SourceAdapter for MySqlAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn engine(&self) -> Engine {
        self.engine
    }

    async fn connect(&self) -> Result<(), ExecutionError> {
        let mut conn = self.get_conn().await?;
        conn.ping().await.map_err(map_mysql_error)
    }

    async fn execute(&self, sql: &str, _timeout: Duration) -> Result<RowSet, ExecutionError> {
        let mut conn = self.get_conn().await?;
        let kill = KillOnDrop::new(self.pool.clone(), conn.id());

        let mut result = conn.query_iter(sql).await.map_err(map_mysql_error)?;
        let columns: Vec<ColumnSchema> = result
            .columns_ref()
            .iter()
            .map(|c| ColumnSchema::new(c.name_str(), column_type_name(c.column_type())))
            .collect();
        let raw_rows: Vec<Row> = result.collect().await.map_err(map_mysql_error)?;
        drop(result);
        kill.disarm();

        let rows = raw_rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| match row.as_ref(idx) {
                        Some(value) => mysql_value_to_json(value, &column.data_type),
                        None => serde_json::Value::Null,
                    })
                    .collect()
            })
            .collect();

        Ok(RowSet { columns, rows })
    }

    async fn describe_schema(&self) -> Result<Vec<TableSchema>, ExecutionError> {
        self.describe_schema_excluding(&[]).await
    }
}

/// Issues `KILL QUERY` on a separate connection if the execute future is
/// dropped while the statement is still running.
struct KillOnDrop {
    pool: Pool,
    connection_id: Option<u32>,
}

impl KillOnDrop {
    fn new(pool: Pool, connection_id: u32) -> Self {
        Self {
            pool,
            connection_id: Some(connection_id),
        }
    }

    fn disarm(mut self) {
        self.connection_id = None;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let Some(id) = self.connection_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.pool.clone();
        handle.spawn(async move {
            let killed = match pool.get_conn().await {
                Ok(mut conn) => conn.query_drop(format!("KILL QUERY {}", id)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = killed {
                tracing::warn!("Failed to kill MySQL query on connection {}: {}", id, e);
            }
        });
    }
}

fn column_type_name(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => "bigint",
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => "double",
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => "decimal",
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => "date",
        ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATETIME2
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIMESTAMP2 => "timestamp",
        ColumnType::MYSQL_TYPE_JSON => "json",
        _ => "varchar",
    }
}

/// Helper function to convert MySQL Value to JSON Value
fn mysql_value_to_json(value: &MySqlValue, data_type: &str) -> serde_json::Value {
    use serde_json::json;

    match value {
        MySqlValue::NULL => serde_json::Value::Null,
        // The text protocol returns everything as bytes
        MySqlValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => coerce_text_value(Some(s), data_type),
            Err(_) => serde_json::Value::Null,
        },
        MySqlValue::Int(i) => json!(i),
        MySqlValue::UInt(u) => json!(u),
        MySqlValue::Float(f) => json!(f),
        MySqlValue::Double(d) => json!(d),
        MySqlValue::Date(y, m, d, h, min, s, _) => {
            json!(format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, m, d, h, min, s))
        }
        MySqlValue::Time(is_neg, d, h, m, s, _) => {
            let sign = if *is_neg { "-" } else { "" };
            let total_hours = d * 24 + *h as u32;
            json!(format!("{}{}:{:02}:{:02}", sign, total_hours, m, s))
        }
    }
}

pub(crate) fn map_mysql_error(err: mysql_async::Error) -> ExecutionError {
    match err {
        mysql_async::Error::Server(server) => map_server_code(server.code, &server.message),
        mysql_async::Error::Io(e) => ExecutionError::connection(format!("I/O error: {}", e)),
        mysql_async::Error::Url(e) => ExecutionError::connection(format!("Invalid URL: {}", e)),
        other => ExecutionError::connection(other.to_string()),
    }
}

/// Classify a MySQL server error code.
fn map_server_code(code: u16, message: &str) -> ExecutionError {
    let detail = format!("{} (error {})", message, code);
    match code {
        1044 | 1045 | 1142 | 1143 | 1227 => ExecutionError::auth(detail),
        1054 | 1064 | 1146 | 1149 | 1305 => ExecutionError::syntax(detail),
        1040 | 1203 => ExecutionError::resource(detail).transient(),
        1205 | 1317 | 3024 => ExecutionError::resource(detail),
        2002 | 2003 | 2006 | 2013 => ExecutionError::connection(detail),
        _ => ExecutionError::resource(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_server_code_mapping() {
        assert_eq!(map_server_code(1045, "access denied").category, ErrorCategory::Auth);
        assert_eq!(map_server_code(1064, "syntax").category, ErrorCategory::Syntax);
        assert!(map_server_code(1040, "too many connections").is_retryable());
        assert!(!map_server_code(3024, "max execution time").is_retryable());
    }

    #[test]
    fn test_text_values_follow_column_type() {
        let value = MySqlValue::Bytes(b"12.50".to_vec());
        assert_eq!(mysql_value_to_json(&value, "decimal"), serde_json::json!(12.5));
        let value = MySqlValue::Bytes(b"EU".to_vec());
        assert_eq!(mysql_value_to_json(&value, "varchar"), serde_json::json!("EU"));
    }

    #[tokio::test]
    async fn test_rejects_non_mysql_url() {
        assert!(MySqlAdapter::new("m", "postgresql://localhost/db", 4).is_err());
        assert!(MySqlAdapter::new("m", "mysql://root@localhost:3306/db", 4).is_ok());
    }
}
