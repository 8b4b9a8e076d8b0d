// Query Service
//
// Entry points of the gateway. A query goes through admission, compilation,
// row-level security, rendering, the result cache and finally the
// dispatcher; `explain` stops before execution.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;
use crate::error::{CompileError, GatewayError};
use crate::models::{
    Dataset, DatasetSummary, ExplainOutput, QueryResult, SemanticQuery, SourceSchema, TenantContext,
};
use crate::services::catalog::{CatalogRegistry, CatalogVersion};
use crate::services::compiler::{CompilerLimits, QueryCompiler};
use crate::services::dispatcher::Dispatcher;
use crate::services::query_cache::{CacheKey, CacheStats, LeaseSettings, QueryCache};
use crate::services::rate_limiter::{Admission, BucketConfig, RateLimiter, RouteClass};
use crate::services::rls::RlsEnforcer;
use crate::services::sql::{CompiledQuery, DialectTranslationService, RlsState, SqlText};
use crate::storage::SharedStore;

/// Tunables for the query pipeline.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub limits: CompilerLimits,
    pub lease: LeaseSettings,
    pub query_bucket: BucketConfig,
    pub metadata_bucket: BucketConfig,
    pub query_timeout: Duration,
    pub default_cache_ttl: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            limits: CompilerLimits::default(),
            lease: LeaseSettings::default(),
            query_bucket: BucketConfig::new(20.0, 5.0),
            metadata_bucket: BucketConfig::new(60.0, 10.0),
            query_timeout: Duration::from_secs(30),
            default_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            limits: config.compiler_limits(),
            lease: config.lease_settings(),
            query_bucket: config.rate_limit.query,
            metadata_bucket: config.rate_limit.metadata,
            query_timeout: config.query_timeout(),
            default_cache_ttl: config.default_cache_ttl(),
        }
    }
}

/// A query that passed compilation, enforcement and rendering.
struct Prepared {
    compiled: CompiledQuery,
    sql: SqlText,
    key: CacheKey,
}

pub struct QueryService {
    catalog: Arc<CatalogRegistry>,
    dispatcher: Arc<Dispatcher>,
    compiler: QueryCompiler,
    enforcer: RlsEnforcer,
    translator: DialectTranslationService,
    cache: QueryCache,
    limiter: RateLimiter,
    settings: ServiceSettings,
}

impl QueryService {
    pub fn new(
        catalog: Arc<CatalogRegistry>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn SharedStore>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            catalog,
            dispatcher,
            compiler: QueryCompiler::new(settings.limits.clone()),
            enforcer: RlsEnforcer::new(),
            translator: DialectTranslationService::new(),
            cache: QueryCache::new(store.clone(), settings.lease),
            limiter: RateLimiter::new(store, settings.query_bucket, settings.metadata_bucket),
            settings,
        }
    }

    pub fn catalog(&self) -> &Arc<CatalogRegistry> {
        &self.catalog
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Run `query` for `tenant`, serving from the cache when possible.
    pub async fn run_query(
        &self,
        query: &SemanticQuery,
        tenant: &TenantContext,
    ) -> Result<QueryResult, GatewayError> {
        let started = Instant::now();
        let outcome = self.run_query_inner(query, tenant, started).await;

        match &outcome {
            Ok(result) => tracing::info!(
                dataset = %query.dataset_id,
                tenant = %tenant.tenant_id,
                api_key = %tenant.api_key_id,
                cache_hit = result.stats.cache_hit,
                rows = result.stats.row_count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Query completed"
            ),
            Err(e) => tracing::info!(
                dataset = %query.dataset_id,
                tenant = %tenant.tenant_id,
                api_key = %tenant.api_key_id,
                code = e.code(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Query failed"
            ),
        }
        outcome
    }

    async fn run_query_inner(
        &self,
        query: &SemanticQuery,
        tenant: &TenantContext,
        started: Instant,
    ) -> Result<QueryResult, GatewayError> {
        self.admit(tenant, RouteClass::Query).await?;

        let dataset = self.dataset(&query.dataset_id).await?;
        let prepared = self.prepare(&dataset, query, tenant)?;
        tracing::debug!(dataset = %dataset.id, key = %prepared.key, sql = %prepared.sql, "Query prepared");

        let deadline = started + self.settings.query_timeout;
        let ttl = dataset.cache_ttl(self.settings.default_cache_ttl);
        let dispatcher = self.dispatcher.clone();
        let sql = prepared.sql;

        self.cache
            .get_or_execute(&prepared.key, ttl, deadline, move || async move {
                let remaining = deadline.saturating_duration_since(Instant::now());
                dispatcher.execute(&sql, &dataset, remaining).await
            })
            .await
    }

    /// Show what `run_query` would execute, without executing it.
    pub async fn explain(
        &self,
        query: &SemanticQuery,
        tenant: &TenantContext,
    ) -> Result<ExplainOutput, GatewayError> {
        self.admit(tenant, RouteClass::Metadata).await?;

        let dataset = self.dataset(&query.dataset_id).await?;
        let prepared = self.prepare(&dataset, query, tenant)?;

        let mut warnings = Vec::new();
        match prepared.compiled.rls() {
            RlsState::Bypassed { .. } => {
                warnings.push("Row-level security is bypassed for this admin caller".to_string())
            }
            RlsState::Unscoped { .. } => {
                warnings.push("Dataset has no tenant column; rows are not filtered by tenant".to_string())
            }
            _ => {}
        }
        if dataset.cache_ttl(self.settings.default_cache_ttl).is_zero() {
            warnings.push("Caching is disabled for this dataset".to_string());
        }
        if query.limit.is_none() {
            warnings.push(format!(
                "No limit given; the default limit of {} rows applies",
                prepared.compiled.limit()
            ));
        }
        if prepared.compiled.offset().is_some() && prepared.compiled.order_by().is_empty() {
            warnings.push("Offset without a sort order gives unstable pages".to_string());
        }

        tracing::info!(
            dataset = %dataset.id,
            tenant = %tenant.tenant_id,
            api_key = %tenant.api_key_id,
            "Query explained"
        );

        Ok(ExplainOutput {
            sql: prepared.sql.as_str().to_string(),
            dialect: prepared.sql.dialect(),
            tables_used: prepared.compiled.tables_used(),
            warnings,
            cache_key: prepared.key.to_string(),
        })
    }

    pub async fn list_datasets(&self, tenant: &TenantContext) -> Result<Vec<DatasetSummary>, GatewayError> {
        self.admit(tenant, RouteClass::Metadata).await?;
        Ok(self.catalog.list().await)
    }

    /// Live schema of a source. Restricted to admins since it exposes
    /// tables outside any dataset.
    pub async fn describe_source(
        &self,
        source_id: &str,
        tenant: &TenantContext,
    ) -> Result<SourceSchema, GatewayError> {
        Self::require_admin(tenant, "describe sources")?;
        self.admit(tenant, RouteClass::Metadata).await?;

        self.dispatcher
            .describe_source(source_id, self.settings.query_timeout)
            .await
    }

    pub async fn reload_catalog(&self, tenant: &TenantContext) -> Result<CatalogVersion, GatewayError> {
        Self::require_admin(tenant, "reload the catalog")?;
        let version = self.catalog.reload().await?;
        tracing::warn!(
            api_key = %tenant.api_key_id,
            version = version.version,
            "Catalog reloaded"
        );
        Ok(version)
    }

    async fn admit(&self, tenant: &TenantContext, route: RouteClass) -> Result<(), GatewayError> {
        match self.limiter.admit(&tenant.api_key_id, route).await {
            Ok(Admission::Allowed) => Ok(()),
            Ok(Admission::Denied { retry_after }) => Err(GatewayError::RateLimited { retry_after }),
            Err(e) => {
                tracing::error!(error = %e, route = route.as_str(), "Rate limiter store unavailable");
                Err(e.into())
            }
        }
    }

    async fn dataset(&self, id: &str) -> Result<Arc<Dataset>, GatewayError> {
        self.catalog
            .get(id)
            .await
            .ok_or_else(|| CompileError::UnknownDataset(id.to_string()).into())
    }

    fn prepare(
        &self,
        dataset: &Dataset,
        query: &SemanticQuery,
        tenant: &TenantContext,
    ) -> Result<Prepared, GatewayError> {
        let compiled = self.compiler.compile(dataset, query)?;
        let compiled = self.enforcer.enforce(compiled, tenant, dataset)?;
        let sql = self.translator.render(&compiled)?;
        let key = CacheKey::for_query(&compiled)?;
        Ok(Prepared { compiled, sql, key })
    }

    fn require_admin(tenant: &TenantContext, action: &str) -> Result<(), GatewayError> {
        if tenant.bypasses_rls() {
            Ok(())
        } else {
            Err(GatewayError::Forbidden(format!("Only admins may {}", action)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::models::{BaseRelation, ColumnSchema, FieldExpr, FieldType, Role, RowSet, TableSchema};
    use crate::services::database::{Engine, SourceAdapter};
    use crate::services::sql::{AggregateFunction, Dialect};
    use crate::storage::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        executed: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for Recording {
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
            Ok(RowSet {
                columns: vec![ColumnSchema::new("region", "text"), ColumnSchema::new("revenue", "numeric")],
                rows: vec![vec![serde_json::json!("EU"), serde_json::json!(10.5)]],
            })
        }

        async fn describe_schema(&self) -> Result<Vec<TableSchema>, ExecutionError> {
            Ok(vec![TableSchema {
                name: "orders".into(),
                schema: Some("public".into()),
                columns: vec![],
            }])
        }
    }

    fn orders() -> Dataset {
        Dataset::new("orders", "warehouse", Dialect::Postgresql, BaseRelation::Table("orders".into()))
            .with_dimension("region", FieldExpr::Column("region".into()), FieldType::String)
            .with_metric("revenue", AggregateFunction::Sum, Some(FieldExpr::Column("amount".into())))
            .with_tenant_column("tenant_id")
    }

    async fn service(datasets: Vec<Dataset>) -> (QueryService, Arc<Recording>) {
        let adapter = Arc::new(Recording::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(adapter.clone());

        let catalog = CatalogRegistry::new(HashMap::from([("warehouse".to_string(), Dialect::Postgresql)]));
        catalog.replace(datasets).await.unwrap();

        let service = QueryService::new(
            Arc::new(catalog),
            Arc::new(dispatcher),
            Arc::new(MemoryStore::new()),
            ServiceSettings::default(),
        );
        (service, adapter)
    }

    fn analyst(tenant: &str) -> TenantContext {
        TenantContext::new(tenant, Role::Analyst, format!("key-{}", tenant))
    }

    fn revenue_by_region() -> SemanticQuery {
        SemanticQuery::new("orders").dimension("region").metric("revenue")
    }

    #[tokio::test]
    async fn test_run_query_filters_by_tenant_and_caches() {
        let (service, adapter) = service(vec![orders()]).await;

        let first = service.run_query(&revenue_by_region(), &analyst("acme")).await.unwrap();
        let second = service.run_query(&revenue_by_region(), &analyst("acme")).await.unwrap();

        assert!(!first.stats.cache_hit);
        assert!(second.stats.cache_hit);
        assert_eq!(first.rows, second.rows);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        let sql = adapter.executed.lock().unwrap()[0].clone();
        assert!(sql.contains("'acme'"), "tenant predicate missing: {}", sql);
    }

    #[tokio::test]
    async fn test_tenants_never_share_cache_entries() {
        let (service, adapter) = service(vec![orders()]).await;

        service.run_query(&revenue_by_region(), &analyst("acme")).await.unwrap();
        let other = service.run_query(&revenue_by_region(), &analyst("globex")).await.unwrap();

        assert!(!other.stats.cache_hit);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_dataset() {
        let (service, adapter) = service(vec![orders()]).await;
        let err = service
            .run_query(&SemanticQuery::new("missing").metric("revenue"), &analyst("acme"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_DATASET");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_explain_does_not_execute() {
        let (service, adapter) = service(vec![orders().with_cache_ttl_secs(0)]).await;
        let explained = service.explain(&revenue_by_region(), &analyst("acme")).await.unwrap();

        assert_eq!(explained.dialect, Dialect::Postgresql);
        assert_eq!(explained.tables_used, vec!["orders".to_string()]);
        assert!(explained.cache_key.starts_with("qc:v1:"));
        assert!(explained.warnings.iter().any(|w| w.contains("Caching is disabled")));
        assert!(explained.warnings.iter().any(|w| w.contains("default limit")));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_explain_matches_executed_sql() {
        let (service, adapter) = service(vec![orders()]).await;
        let explained = service.explain(&revenue_by_region(), &analyst("acme")).await.unwrap();
        service.run_query(&revenue_by_region(), &analyst("acme")).await.unwrap();
        assert_eq!(adapter.executed.lock().unwrap()[0], explained.sql);
    }

    #[tokio::test]
    async fn test_admin_bypass_is_reported() {
        let (service, _) = service(vec![orders()]).await;
        let admin = TenantContext::new("ops", Role::Admin, "key-admin");
        let explained = service.explain(&revenue_by_region(), &admin).await.unwrap();
        assert!(!explained.sql.contains("tenant_id"));
        assert!(explained.warnings.iter().any(|w| w.contains("bypassed")));
    }

    #[tokio::test]
    async fn test_metadata_operations_require_admin() {
        let (service, _) = service(vec![orders()]).await;

        let err = service.describe_source("warehouse", &analyst("acme")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
        let err = service.reload_catalog(&analyst("acme")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));

        let admin = TenantContext::new("ops", Role::Admin, "key-admin");
        let schema = service.describe_source("warehouse", &admin).await.unwrap();
        assert_eq!(schema.engine, Engine::Postgresql);
        assert_eq!(schema.tables[0].name, "orders");

        let err = service.describe_source("nowhere", &admin).await.unwrap_err();
        assert!(matches!(err, GatewayError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_datasets() {
        let (service, _) = service(vec![orders()]).await;
        let datasets = service.list_datasets(&analyst("acme")).await.unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].id, "orders");
    }
}
