use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Abstract analytical query as submitted by a BI client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticQuery {
    #[serde(alias = "dataset")]
    pub dataset_id: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

impl SemanticQuery {
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            dimensions: Vec::new(),
            metrics: Vec::new(),
            filters: Vec::new(),
            sort: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn dimension(mut self, id: impl Into<String>) -> Self {
        self.dimensions.push(id.into());
        self
    }

    pub fn metric(mut self, id: impl Into<String>) -> Self {
        self.metrics.push(id.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// A filter tree. Leaves are predicates; `and`/`or`/`not` nest them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    And { and: Vec<Filter> },
    Or { or: Vec<Filter> },
    Not { not: Box<Filter> },
    Predicate(FilterPredicate),
}

impl Filter {
    pub fn predicate(field: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Filter::Predicate(FilterPredicate {
            field: field.into(),
            operator: operator.into(),
            value,
        })
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { and: filters }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { or: filters }
    }

    pub fn not(filter: Filter) -> Self {
        Filter::Not {
            not: Box::new(filter),
        }
    }

    /// Nesting depth; a bare predicate has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Filter::And { and: children } | Filter::Or { or: children } => {
                1 + children.iter().map(Filter::depth).max().unwrap_or(0)
            }
            Filter::Not { not } => 1 + not.depth(),
            Filter::Predicate(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub field: String,
    #[serde(alias = "op")]
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_nested_filters() {
        let query: SemanticQuery = serde_json::from_value(json!({
            "dataset": "orders",
            "dimensions": ["status"],
            "metrics": ["order_count"],
            "filters": [
                {"field": "status", "op": "in", "value": ["shipped", "paid"]},
                {"or": [
                    {"field": "region", "operator": "=", "value": "EU"},
                    {"not": {"field": "region", "operator": "is null"}}
                ]}
            ],
            "sort": [{"field": "order_count", "direction": "desc"}],
            "limit": 10
        }))
        .unwrap();

        assert_eq!(query.dataset_id, "orders");
        assert_eq!(query.filters.len(), 2);
        assert!(matches!(query.filters[0], Filter::Predicate(ref p) if p.operator == "in"));
        assert!(matches!(query.filters[1], Filter::Or { .. }));
        assert_eq!(query.filters[1].depth(), 3);
        assert_eq!(query.sort[0].direction, SortDirection::Desc);
        assert_eq!(query.offset, None);
    }

    #[test]
    fn test_missing_value_defaults_to_null() {
        let filter: Filter =
            serde_json::from_value(json!({"field": "region", "operator": "is not null"})).unwrap();
        match filter {
            Filter::Predicate(p) => assert!(p.value.is_null()),
            other => panic!("unexpected filter: {:?}", other),
        }
    }
}
