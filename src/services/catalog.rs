// Dataset Catalog
//
// Read-only registry of datasets. Requests read an immutable snapshot;
// reload validates a complete new catalog before swapping it in, so a bad
// file never replaces a good catalog.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CatalogError;
use crate::models::{BaseRelation, Dataset, DatasetSummary, FieldExpr};
use crate::services::compiler::GRAIN_SEPARATOR;
use crate::services::sql::{AggregateFunction, Dialect};
use crate::validation::SqlValidator;

/// On-disk catalog layout.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    datasets: Vec<Dataset>,
}

/// Read datasets from a JSON catalog file.
pub async fn load_datasets_from_file(path: &Path) -> Result<Vec<Dataset>, CatalogError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CatalogError::Io(format!("{}: {}", path.display(), e)))?;
    let file: CatalogFile =
        serde_json::from_str(&raw).map_err(|e| CatalogError::Parse(format!("{}: {}", path.display(), e)))?;
    Ok(file.datasets)
}

/// Immutable view of the catalog at one version.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    datasets: HashMap<String, Arc<Dataset>>,
    version: u64,
    loaded_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CatalogSnapshot {
    pub fn get(&self, id: &str) -> Option<Arc<Dataset>> {
        self.datasets.get(id).cloned()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

/// Result of a successful reload.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogVersion {
    pub version: u64,
    pub datasets: usize,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

pub struct CatalogRegistry {
    current: RwLock<Arc<CatalogSnapshot>>,
    /// Dialect of every registered source, for cross-checking datasets.
    sources: HashMap<String, Dialect>,
    path: Option<PathBuf>,
}

impl CatalogRegistry {
    pub fn new(sources: HashMap<String, Dialect>) -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::default())),
            sources,
            path: None,
        }
    }

    /// Registry that reloads from `path`.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub async fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Dataset>> {
        self.snapshot().await.get(id)
    }

    /// Summaries of every dataset, sorted by id.
    pub async fn list(&self) -> Vec<DatasetSummary> {
        let snapshot = self.snapshot().await;
        let mut summaries: Vec<DatasetSummary> = snapshot.datasets.values().map(|d| d.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Validate `datasets` as a whole and swap them in.
    pub async fn replace(&self, datasets: Vec<Dataset>) -> Result<CatalogVersion, CatalogError> {
        let mut validated = HashMap::with_capacity(datasets.len());
        for dataset in datasets {
            validate_dataset(&dataset, &self.sources)?;
            if validated.contains_key(&dataset.id) {
                return Err(CatalogError::DuplicateDataset(dataset.id));
            }
            validated.insert(dataset.id.clone(), Arc::new(dataset));
        }

        let loaded_at = chrono::Utc::now();
        let mut current = self.current.write().await;
        let version = current.version + 1;
        let count = validated.len();
        *current = Arc::new(CatalogSnapshot {
            datasets: validated,
            version,
            loaded_at: Some(loaded_at),
        });

        tracing::info!(version, datasets = count, "Catalog loaded");
        Ok(CatalogVersion {
            version,
            datasets: count,
            loaded_at,
        })
    }

    /// Re-read the catalog file and swap it in.
    pub async fn reload(&self) -> Result<CatalogVersion, CatalogError> {
        let Some(path) = &self.path else {
            return Err(CatalogError::Io("No catalog path configured".to_string()));
        };
        let datasets = load_datasets_from_file(path).await?;
        self.replace(datasets).await.inspect_err(|e| {
            tracing::error!(error = %e, "Catalog reload rejected, keeping current catalog");
        })
    }

    pub async fn loaded_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.snapshot().await.loaded_at
    }
}

fn invalid(dataset: &Dataset, reason: impl Into<String>) -> CatalogError {
    CatalogError::InvalidDataset {
        dataset: dataset.id.clone(),
        reason: reason.into(),
    }
}

/// Check one dataset against the registered sources. Raw SQL fragments are
/// parsed here so a broken fragment fails at load, not at query time.
pub fn validate_dataset(dataset: &Dataset, sources: &HashMap<String, Dialect>) -> Result<(), CatalogError> {
    if dataset.id.trim().is_empty() {
        return Err(invalid(dataset, "id must not be empty"));
    }

    match sources.get(&dataset.source_id) {
        None => {
            return Err(invalid(
                dataset,
                format!("source '{}' is not registered", dataset.source_id),
            ))
        }
        Some(dialect) if *dialect != dataset.dialect => {
            return Err(invalid(
                dataset,
                format!(
                    "dialect {} does not match source '{}' ({})",
                    dataset.dialect, dataset.source_id, dialect
                ),
            ))
        }
        Some(_) => {}
    }

    match &dataset.base {
        BaseRelation::Table(name) if name.trim().is_empty() => {
            return Err(invalid(dataset, "base table must not be empty"))
        }
        BaseRelation::Table(_) => {}
        BaseRelation::Sql(sql) => SqlValidator::validate_subquery(dataset.dialect, sql)
            .map_err(|e| invalid(dataset, format!("base SQL: {}", e)))?,
    }

    // Aliases visible to column references, in join order.
    let mut aliases: HashSet<&str> = HashSet::from([dataset.alias.as_str()]);
    for join in &dataset.joins {
        if join.on.is_empty() {
            return Err(invalid(dataset, format!("join '{}' has no join keys", join.alias)));
        }
        for key in &join.on {
            if let Some((qualifier, _)) = key.left.split_once('.') {
                if !aliases.contains(qualifier) {
                    return Err(invalid(
                        dataset,
                        format!("join '{}' references unknown alias '{}'", join.alias, qualifier),
                    ));
                }
            }
        }
        if !aliases.insert(join.alias.as_str()) {
            return Err(invalid(dataset, format!("alias '{}' is used twice", join.alias)));
        }
    }

    let check_expr = |field: &str, expr: &FieldExpr| -> Result<(), CatalogError> {
        match expr {
            FieldExpr::Column(column) => match column.split_once('.') {
                Some((qualifier, _)) if !aliases.contains(qualifier) => Err(invalid(
                    dataset,
                    format!("field '{}' references unknown alias '{}'", field, qualifier),
                )),
                _ => Ok(()),
            },
            FieldExpr::Sql(sql) => SqlValidator::validate_expression(dataset.dialect, sql)
                .map_err(|e| invalid(dataset, format!("field '{}': {}", field, e))),
        }
    };

    for (id, dimension) in &dataset.dimensions {
        if id.contains(GRAIN_SEPARATOR) {
            return Err(invalid(
                dataset,
                format!("field id '{}' must not contain '{}'", id, GRAIN_SEPARATOR),
            ));
        }
        if dataset.metrics.contains_key(id) {
            return Err(invalid(dataset, format!("'{}' is both a dimension and a metric", id)));
        }
        check_expr(id, &dimension.expr)?;
    }

    for (id, metric) in &dataset.metrics {
        if id.contains(GRAIN_SEPARATOR) {
            return Err(invalid(
                dataset,
                format!("field id '{}' must not contain '{}'", id, GRAIN_SEPARATOR),
            ));
        }
        match &metric.expr {
            Some(expr) => check_expr(id, expr)?,
            None if metric.aggregation == AggregateFunction::Count => {}
            None => {
                return Err(invalid(
                    dataset,
                    format!("metric '{}' needs an expression for {}", id, metric.aggregation.as_str()),
                ))
            }
        }
    }

    if dataset.tenant_column.is_none() {
        if dataset.rls_required {
            tracing::warn!(
                dataset = %dataset.id,
                "Dataset requires row-level security but has no tenant column; queries will be refused"
            );
        } else {
            tracing::info!(dataset = %dataset.id, "Dataset is not tenant-scoped");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldType, JoinDef, JoinKey};
    use crate::services::sql::JoinKind;
    use std::io::Write;

    fn sources() -> HashMap<String, Dialect> {
        HashMap::from([("warehouse".to_string(), Dialect::Postgresql)])
    }

    fn orders() -> Dataset {
        Dataset::new(
            "orders",
            "warehouse",
            Dialect::Postgresql,
            BaseRelation::Table("public.orders".into()),
        )
        .with_dimension("status", FieldExpr::Column("status".into()), FieldType::String)
        .with_metric("order_count", AggregateFunction::Count, None)
        .with_tenant_column("tenant_id")
    }

    #[test]
    fn test_valid_dataset() {
        assert!(validate_dataset(&orders(), &sources()).is_ok());
    }

    #[test]
    fn test_unregistered_source_and_dialect_mismatch() {
        let mut dataset = orders();
        dataset.source_id = "elsewhere".into();
        assert!(validate_dataset(&dataset, &sources()).is_err());

        let mut dataset = orders();
        dataset.dialect = Dialect::Mysql;
        assert!(validate_dataset(&dataset, &sources()).is_err());
    }

    #[test]
    fn test_field_checks() {
        let dataset = orders().with_metric("status", AggregateFunction::Count, None);
        assert!(validate_dataset(&dataset, &sources()).is_err());

        let dataset = orders().with_metric("revenue", AggregateFunction::Sum, None);
        assert!(validate_dataset(&dataset, &sources()).is_err());

        let dataset = orders().with_dimension(
            "segment",
            FieldExpr::Column("customers.segment".into()),
            FieldType::String,
        );
        assert!(validate_dataset(&dataset, &sources()).is_err());

        let dataset = orders().with_dimension(
            "bad",
            FieldExpr::Sql("CASE WHEN".into()),
            FieldType::String,
        );
        assert!(validate_dataset(&dataset, &sources()).is_err());
    }

    #[test]
    fn test_join_references_must_resolve() {
        let dataset = orders()
            .with_join(JoinDef {
                alias: "customers".into(),
                table: "public.customers".into(),
                kind: JoinKind::Left,
                on: vec![JoinKey {
                    left: "customer_id".into(),
                    right: "id".into(),
                }],
            })
            .with_dimension(
                "segment",
                FieldExpr::Column("customers.segment".into()),
                FieldType::String,
            );
        assert!(validate_dataset(&dataset, &sources()).is_ok());

        let broken = dataset.with_join(JoinDef {
            alias: "regions".into(),
            table: "public.regions".into(),
            kind: JoinKind::Inner,
            on: vec![JoinKey {
                left: "nowhere.region_id".into(),
                right: "id".into(),
            }],
        });
        assert!(validate_dataset(&broken, &sources()).is_err());
    }

    #[tokio::test]
    async fn test_replace_rejects_duplicates_and_keeps_previous() {
        let registry = CatalogRegistry::new(sources());
        let first = registry.replace(vec![orders()]).await.unwrap();
        assert_eq!(first.version, 1);

        let err = registry.replace(vec![orders(), orders()]).await.unwrap_err();
        assert_eq!(err, CatalogError::DuplicateDataset("orders".into()));
        assert_eq!(registry.snapshot().await.version(), 1);
        assert!(registry.get("orders").await.is_some());
    }

    #[tokio::test]
    async fn test_reload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let catalog = serde_json::json!({ "datasets": [orders()] });
        write!(file, "{}", catalog).unwrap();

        let registry = CatalogRegistry::new(sources()).with_path(file.path());
        let version = registry.reload().await.unwrap();
        assert_eq!(version.datasets, 1);
        assert_eq!(registry.list().await[0].id, "orders");
    }

    #[tokio::test]
    async fn test_reload_with_bad_file_keeps_catalog() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let registry = CatalogRegistry::new(sources()).with_path(file.path());
        registry.replace(vec![orders()]).await.unwrap();
        assert!(matches!(registry.reload().await, Err(CatalogError::Parse(_))));
        assert!(registry.get("orders").await.is_some());
    }

    #[tokio::test]
    async fn test_example_catalog_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("catalog.example.json");
        let registry = CatalogRegistry::new(HashMap::from([
            ("warehouse".to_string(), Dialect::Postgresql),
            ("events".to_string(), Dialect::Druid),
        ]))
        .with_path(path);

        let version = registry.reload().await.unwrap();
        assert_eq!(version.datasets, 2);
        let orders = registry.get("orders").await.unwrap();
        assert_eq!(orders.joins[0].alias, "customers");
        assert!(orders.rls_required);
    }
}
