// PostgreSQL adapter using connection pooling for optimal resource management
use std::time::Duration;

use deadpool_postgres::{Pool, PoolError};
use tokio_postgres::{CancelToken, NoTls, SimpleQueryMessage};
use url::Url;

use crate::error::ExecutionError;
use crate::models::{group_columns, ColumnSchema, RowSet, TableSchema};
use crate::services::connection_pool::mask_credentials;
use crate::services::database::adapter::{coerce_text_value, SourceAdapter};
use crate::services::database::Engine;

pub struct PostgreSqlAdapter {
    source_id: String,
    pool: Pool,
}

impl PostgreSqlAdapter {
    pub fn new(source_id: &str, pool: Pool, connection_url: &str) -> Result<Self, ExecutionError> {
        // Validate PostgreSQL URL format
        let url = Url::parse(connection_url)
            .map_err(|e| ExecutionError::connection(format!("Invalid PostgreSQL URL: {}", e)))?;

        if url.scheme() != "postgresql" && url.scheme() != "postgres" {
            return Err(ExecutionError::connection(
                "URL must use postgresql:// or postgres:// scheme",
            ));
        }

        tracing::debug!(source = source_id, url = %mask_credentials(connection_url), "PostgreSQL source registered");
        Ok(Self {
            source_id: source_id.to_string(),
            pool,
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, ExecutionError> {
        self.pool.get().await.map_err(map_pool_error)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for PostgreSqlAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn engine(&self) -> Engine {
        Engine::Postgresql
    }

    async fn connect(&self) -> Result<(), ExecutionError> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await.map_err(map_pg_error)?;
        Ok(())
    }

    async fn execute(&self, sql: &str, _timeout: Duration) -> Result<RowSet, ExecutionError> {
        let client = self.client().await?;
        let cancel = CancelOnDrop::new(client.cancel_token());

        // Column types come from the prepared statement; values come back as
        // text over the simple protocol so every type converts uniformly.
        let statement = client.prepare(sql).await.map_err(map_pg_error)?;
        let columns: Vec<ColumnSchema> = statement
            .columns()
            .iter()
            .map(|c| ColumnSchema::new(c.name(), c.type_().name()))
            .collect();

        let messages = client.simple_query(sql).await.map_err(map_pg_error)?;
        cancel.disarm();

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let values = columns
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| coerce_text_value(row.get(idx), &column.data_type))
                    .collect();
                rows.push(values);
            }
        }

        Ok(RowSet { columns, rows })
    }

    async fn describe_schema(&self) -> Result<Vec<TableSchema>, ExecutionError> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT
                    table_schema,
                    table_name,
                    column_name,
                    data_type,
                    is_nullable
                FROM information_schema.columns
                WHERE table_schema NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
                ORDER BY table_schema, table_name, ordinal_position
                "#,
                &[],
            )
            .await
            .map_err(map_pg_error)?;

        Ok(group_columns(rows.iter().map(|row| {
            (
                Some(row.get::<_, String>(0)),
                row.get::<_, String>(1),
                row.get::<_, String>(2),
                row.get::<_, String>(3),
                row.get::<_, String>(4) == "YES",
            )
        })))
    }
}

/// Cancels the running statement server-side if the execute future is
/// dropped before the result arrives.
struct CancelOnDrop {
    token: Option<CancelToken>,
}

impl CancelOnDrop {
    fn new(token: CancelToken) -> Self {
        Self { token: Some(token) }
    }

    fn disarm(mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = token.cancel_query(NoTls).await {
                    tracing::warn!("Failed to cancel PostgreSQL query: {}", e);
                }
            });
        }
    }
}

fn map_pool_error(err: PoolError) -> ExecutionError {
    match err {
        PoolError::Timeout(_) => {
            ExecutionError::resource(format!("Connection pool exhausted: {}", err)).transient()
        }
        PoolError::Backend(e) => map_pg_error(e),
        other => ExecutionError::connection(format!("Failed to get connection from pool: {}", other)),
    }
}

fn map_pg_error(err: tokio_postgres::Error) -> ExecutionError {
    match err.as_db_error() {
        Some(db_error) => map_sqlstate(db_error.code().code(), db_error.message()),
        None if err.is_closed() => ExecutionError::connection(format!("Connection closed: {}", err)),
        None => ExecutionError::connection(err.to_string()),
    }
}

/// Classify a SQLSTATE code.
fn map_sqlstate(code: &str, message: &str) -> ExecutionError {
    let detail = format!("{} (SQLSTATE {})", message, code);
    match code {
        "42501" => ExecutionError::auth(detail),
        c if c.starts_with("28") => ExecutionError::auth(detail),
        c if c.starts_with("08") => ExecutionError::connection(detail),
        c if c.starts_with("42") || c.starts_with("22") => ExecutionError::syntax(detail),
        "53300" => ExecutionError::resource(detail).transient(),
        _ => ExecutionError::resource(detail),
    }
}
