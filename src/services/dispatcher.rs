// Query Dispatcher
//
// Routes rendered SQL to the adapter registered for a dataset's source and
// enforces the execution deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::GatewayError;
use crate::models::{Dataset, RowSet, SourceSchema};
use crate::services::database::SourceAdapter;
use crate::services::sql::SqlText;

#[derive(Default)]
pub struct Dispatcher {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its source id, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        tracing::info!(
            source = adapter.source_id(),
            engine = %adapter.engine(),
            "Registered source adapter"
        );
        self.adapters.insert(adapter.source_id().to_string(), adapter);
    }

    pub fn adapter(&self, source_id: &str) -> Result<&Arc<dyn SourceAdapter>, GatewayError> {
        self.adapters
            .get(source_id)
            .ok_or_else(|| GatewayError::SourceNotFound(source_id.to_string()))
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Execute `sql` against the dataset's source within `timeout`.
    ///
    /// A transient resource error (e.g. pool exhaustion) is retried once if
    /// time remains; every other failure is returned as is.
    pub async fn execute(
        &self,
        sql: &SqlText,
        dataset: &Dataset,
        timeout: Duration,
    ) -> Result<RowSet, GatewayError> {
        let adapter = self.adapter(&dataset.source_id)?;
        if adapter.dialect() != sql.dialect() {
            return Err(GatewayError::Internal(format!(
                "SQL rendered for {} cannot run on source '{}' ({})",
                sql.dialect(),
                dataset.source_id,
                adapter.dialect()
            )));
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let mut retried = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::Timeout(started.elapsed()));
            }

            match tokio::time::timeout(remaining, adapter.execute(sql.as_str(), remaining)).await {
                Ok(Ok(rows)) => {
                    tracing::debug!(
                        source = %dataset.source_id,
                        rows = rows.rows.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Query executed"
                    );
                    return Ok(rows);
                }
                Ok(Err(e)) if e.is_retryable() && !retried => {
                    tracing::warn!(source = %dataset.source_id, error = %e, "Transient failure, retrying once");
                    retried = true;
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        source = %dataset.source_id,
                        category = %e.category,
                        error = %e,
                        "Query execution failed"
                    );
                    return Err(e.into());
                }
                Err(_) => {
                    tracing::warn!(source = %dataset.source_id, ?timeout, "Query timed out");
                    return Err(GatewayError::Timeout(timeout));
                }
            }
        }
    }

    /// Live table listing of a source, bounded by `timeout`.
    pub async fn describe_source(
        &self,
        source_id: &str,
        timeout: Duration,
    ) -> Result<SourceSchema, GatewayError> {
        let adapter = self.adapter(source_id)?;
        let tables = match tokio::time::timeout(timeout, adapter.describe_schema()).await {
            Ok(tables) => tables?,
            Err(_) => {
                tracing::warn!(source = source_id, ?timeout, "Schema introspection timed out");
                return Err(GatewayError::Timeout(timeout));
            }
        };
        tracing::debug!(source = source_id, tables = tables.len(), "Described source");
        Ok(SourceSchema::new(source_id, adapter.engine(), tables))
    }
}
