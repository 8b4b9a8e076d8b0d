// Apache Doris adapter using MySQL protocol compatibility
// Doris speaks the MySQL wire protocol, including KILL QUERY, so execution is
// delegated to the MySQL adapter under the Doris engine tag.
use std::time::Duration;

use url::Url;

use crate::error::ExecutionError;
use crate::models::{RowSet, TableSchema};
use crate::services::database::adapter::SourceAdapter;
use crate::services::database::mysql::MySqlAdapter;
use crate::services::database::Engine;

/// Schemas Doris exposes that never hold user data.
const SYSTEM_SCHEMAS: &[&str] = &["__internal_schema", "information_schema", "mysql"];

pub struct DorisAdapter {
    inner: MySqlAdapter,
}

impl DorisAdapter {
    pub fn new(source_id: &str, connection_url: &str, pool_size: usize) -> Result<Self, ExecutionError> {
        // Doris uses MySQL protocol, so we accept both doris:// and mysql:// schemes
        let url = Url::parse(connection_url)
            .map_err(|e| ExecutionError::connection(format!("Invalid Doris URL: {}", e)))?;

        let mysql_url = match url.scheme() {
            "doris" => connection_url.replacen("doris://", "mysql://", 1),
            "mysql" => connection_url.to_string(),
            _ => {
                return Err(ExecutionError::connection(
                    "URL must use doris:// or mysql:// scheme for Doris",
                ))
            }
        };

        Ok(Self {
            inner: MySqlAdapter::for_engine(source_id, &mysql_url, pool_size, Engine::Doris)?,
        })
    }
}

#[async_trait::async_trait]
impl SourceAdapter for DorisAdapter {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn engine(&self) -> Engine {
        Engine::Doris
    }

    async fn connect(&self) -> Result<(), ExecutionError> {
        self.inner.connect().await
    }

    async fn execute(&self, sql: &str, timeout: Duration) -> Result<RowSet, ExecutionError> {
        self.inner.execute(sql, timeout).await
    }

    async fn describe_schema(&self) -> Result<Vec<TableSchema>, ExecutionError> {
        self.inner.describe_schema_excluding(SYSTEM_SCHEMAS).await
    }
}
