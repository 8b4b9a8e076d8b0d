use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::services::sql::{AggregateFunction, Dialect, JoinKind, TimeGrain};

fn default_alias() -> String {
    "base".to_string()
}

fn default_true() -> bool {
    true
}

/// Declared type of a dimension or metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    Timestamp,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float | FieldType::Decimal)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::Timestamp)
    }
}

/// Where a field's value comes from.
///
/// `column` may be qualified with a join alias (`customers.region`); an
/// unqualified column belongs to the base relation. `sql` is a trusted
/// expression written by the catalog author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldExpr {
    Column(String),
    Sql(String),
}

/// The dataset's base relation: a physical table or a trusted subquery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseRelation {
    Table(String),
    Sql(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub expr: FieldExpr,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Grain applied when the dimension is requested without a `__grain` suffix.
    #[serde(default)]
    pub time_grain: Option<TimeGrain>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub aggregation: AggregateFunction,
    /// Absent only for `count`, which then counts rows.
    #[serde(default)]
    pub expr: Option<FieldExpr>,
    #[serde(rename = "type", default = "default_metric_type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_metric_type() -> FieldType {
    FieldType::Float
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinKey {
    /// Column on the base relation or an earlier join (`alias.column`).
    pub left: String,
    /// Column on the joined table.
    pub right: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDef {
    pub alias: String,
    pub table: String,
    #[serde(default)]
    pub kind: JoinKind,
    pub on: Vec<JoinKey>,
}

/// A queryable dataset as loaded from the catalog. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub source_id: String,
    #[serde(default)]
    pub dialect: Dialect,
    pub base: BaseRelation,
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, Dimension>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Metric>,
    #[serde(default)]
    pub joins: Vec<JoinDef>,
    #[serde(default)]
    pub tenant_column: Option<String>,
    /// Defaults to true so a dataset without a tenant column is rejected
    /// unless the catalog explicitly opts out.
    #[serde(default = "default_true")]
    pub rls_required: bool,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Dataset {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        dialect: Dialect,
        base: BaseRelation,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            dialect,
            base,
            alias: default_alias(),
            dimensions: BTreeMap::new(),
            metrics: BTreeMap::new(),
            joins: Vec::new(),
            tenant_column: None,
            rls_required: true,
            cache_ttl_secs: None,
            description: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_dimension(
        mut self,
        id: impl Into<String>,
        expr: FieldExpr,
        field_type: FieldType,
    ) -> Self {
        self.dimensions.insert(
            id.into(),
            Dimension {
                expr,
                field_type,
                time_grain: None,
                description: None,
            },
        );
        self
    }

    pub fn with_metric(
        mut self,
        id: impl Into<String>,
        aggregation: AggregateFunction,
        expr: Option<FieldExpr>,
    ) -> Self {
        self.metrics.insert(
            id.into(),
            Metric {
                aggregation,
                expr,
                field_type: default_metric_type(),
                description: None,
            },
        );
        self
    }

    pub fn with_join(mut self, join: JoinDef) -> Self {
        self.joins.push(join);
        self
    }

    pub fn with_tenant_column(mut self, column: impl Into<String>) -> Self {
        self.tenant_column = Some(column.into());
        self
    }

    pub fn with_rls_required(mut self, required: bool) -> Self {
        self.rls_required = required;
        self
    }

    pub fn with_cache_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl_secs = Some(ttl_secs);
        self
    }

    pub fn dimension(&self, id: &str) -> Option<&Dimension> {
        self.dimensions.get(id)
    }

    pub fn metric(&self, id: &str) -> Option<&Metric> {
        self.metrics.get(id)
    }

    pub fn join(&self, alias: &str) -> Option<&JoinDef> {
        self.joins.iter().find(|j| j.alias == alias)
    }

    /// Cache TTL for this dataset, falling back to the gateway default.
    /// A zero TTL disables caching.
    pub fn cache_ttl(&self, default_ttl: Duration) -> Duration {
        self.cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(default_ttl)
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            id: self.id.clone(),
            source_id: self.source_id.clone(),
            dialect: self.dialect,
            description: self.description.clone(),
            dimensions: self
                .dimensions
                .iter()
                .map(|(id, d)| FieldSummary {
                    id: id.clone(),
                    field_type: d.field_type,
                    description: d.description.clone(),
                })
                .collect(),
            metrics: self
                .metrics
                .iter()
                .map(|(id, m)| FieldSummary {
                    id: id.clone(),
                    field_type: m.field_type,
                    description: m.description.clone(),
                })
                .collect(),
        }
    }
}

/// Public description of a dataset, without expressions or table names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub id: String,
    pub source_id: String,
    pub dialect: Dialect,
    pub description: Option<String>,
    pub dimensions: Vec<FieldSummary>,
    pub metrics: Vec<FieldSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_dataset_defaults() {
        let json = r#"{
            "id": "orders",
            "source_id": "warehouse",
            "base": {"table": "public.orders"},
            "dimensions": {
                "status": {"expr": {"column": "status"}, "type": "string"},
                "created_at": {"expr": {"column": "created_at"}, "type": "timestamp", "time_grain": "day"}
            },
            "metrics": {
                "order_count": {"aggregation": "count"},
                "revenue": {"aggregation": "sum", "expr": {"column": "amount"}, "type": "decimal"}
            }
        }"#;

        let dataset: Dataset = serde_json::from_str(json).unwrap();
        assert_eq!(dataset.dialect, Dialect::Postgresql);
        assert_eq!(dataset.alias, "base");
        assert!(dataset.rls_required);
        assert!(dataset.tenant_column.is_none());
        assert_eq!(
            dataset.dimension("created_at").unwrap().time_grain,
            Some(TimeGrain::Day)
        );
        assert_eq!(dataset.metric("order_count").unwrap().expr, None);
        assert_eq!(dataset.metric("revenue").unwrap().field_type, FieldType::Decimal);
    }

    #[test]
    fn test_cache_ttl_fallback() {
        let dataset = Dataset::new(
            "orders",
            "warehouse",
            Dialect::Postgresql,
            BaseRelation::Table("orders".to_string()),
        );
        assert_eq!(dataset.cache_ttl(Duration::from_secs(60)), Duration::from_secs(60));

        let dataset = dataset.with_cache_ttl_secs(0);
        assert_eq!(dataset.cache_ttl(Duration::from_secs(60)), Duration::ZERO);
    }

    #[test]
    fn test_summary_hides_expressions() {
        let dataset = Dataset::new(
            "orders",
            "warehouse",
            Dialect::Postgresql,
            BaseRelation::Table("orders".to_string()),
        )
        .with_dimension("status", FieldExpr::Column("status".to_string()), FieldType::String);

        let summary = serde_json::to_value(dataset.summary()).unwrap();
        assert_eq!(summary["dimensions"][0]["id"], "status");
        assert!(summary.to_string().find("\"column\"").is_none());
    }
}
