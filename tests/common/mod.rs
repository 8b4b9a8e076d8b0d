#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use semantic_gateway::error::ExecutionError;
use semantic_gateway::models::{
    BaseRelation, ColumnSchema, Dataset, FieldExpr, FieldType, Filter, FilterPredicate, Role,
    RowSet, SemanticQuery, TableSchema, TenantContext,
};
use semantic_gateway::services::database::{Engine, SourceAdapter};
use semantic_gateway::services::sql::{AggregateFunction, Dialect};
use semantic_gateway::services::{CatalogRegistry, Dispatcher, QueryService, ServiceSettings};
use semantic_gateway::storage::SharedStore;

/// Adapter that records every statement and answers with a fixed row set.
pub struct ScriptedAdapter {
    pub delay: Duration,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_sql(&self) -> Option<String> {
        self.executed.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &str {
        "warehouse"
    }

    fn engine(&self) -> Engine {
        Engine::Postgresql
    }

    async fn connect(&self) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn execute(&self, sql: &str, _timeout: Duration) -> Result<RowSet, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(sql.to_string());
        tokio::time::sleep(self.delay).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExecutionError::syntax("column \"amount\" does not exist"));
        }
        Ok(RowSet {
            columns: vec![
                ColumnSchema::new("region", "text"),
                ColumnSchema::new("revenue", "numeric"),
            ],
            rows: vec![
                vec![json!("EU"), json!(1250.5)],
                vec![json!("US"), json!(980.0)],
            ],
        })
    }

    async fn describe_schema(&self) -> Result<Vec<TableSchema>, ExecutionError> {
        Ok(vec![])
    }
}

pub fn orders() -> Dataset {
    Dataset::new(
        "orders",
        "warehouse",
        Dialect::Postgresql,
        BaseRelation::Table("orders".to_string()),
    )
    .with_dimension("region", FieldExpr::Column("region".into()), FieldType::String)
    .with_dimension("created_at", FieldExpr::Column("created_at".into()), FieldType::Timestamp)
    .with_metric("revenue", AggregateFunction::Sum, Some(FieldExpr::Column("amount".into())))
    .with_metric("order_count", AggregateFunction::Count, None)
    .with_tenant_column("tenant_id")
}

/// A dataset with no tenant column that has not opted out of RLS.
pub fn unscoped_events() -> Dataset {
    Dataset::new(
        "events",
        "warehouse",
        Dialect::Postgresql,
        BaseRelation::Table("events".to_string()),
    )
    .with_dimension("kind", FieldExpr::Column("kind".into()), FieldType::String)
    .with_metric("event_count", AggregateFunction::Count, None)
}

pub fn revenue_by_region() -> SemanticQuery {
    SemanticQuery::new("orders").dimension("region").metric("revenue")
}

pub fn eq(field: &str, value: &str) -> Filter {
    Filter::Predicate(FilterPredicate {
        field: field.to_string(),
        operator: "=".to_string(),
        value: json!(value),
    })
}

pub fn analyst(tenant: &str) -> TenantContext {
    TenantContext::new(tenant, Role::Analyst, format!("{}-bi", tenant))
}

pub fn admin() -> TenantContext {
    TenantContext::new("ops", Role::Admin, "ops-admin")
}

pub async fn build_service(
    adapter: Arc<ScriptedAdapter>,
    store: Arc<dyn SharedStore>,
    settings: ServiceSettings,
) -> QueryService {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(adapter);

    let catalog = CatalogRegistry::new(HashMap::from([(
        "warehouse".to_string(),
        Dialect::Postgresql,
    )]));
    catalog
        .replace(vec![orders(), unscoped_events()])
        .await
        .unwrap();

    QueryService::new(Arc::new(catalog), Arc::new(dispatcher), store, settings)
}
