use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::sql::Dialect;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Rows returned by a source adapter, before stats are attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<ColumnSchema>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub elapsed_ms: u64,
    pub cache_hit: bool,
    pub row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnSchema>,
    pub rows: Vec<Vec<Value>>,
    pub stats: ExecutionStats,
}

impl QueryResult {
    pub fn from_rows(rows: RowSet, elapsed_ms: u64, cache_hit: bool) -> Self {
        let row_count = rows.rows.len();
        Self {
            columns: rows.columns,
            rows: rows.rows,
            stats: ExecutionStats {
                elapsed_ms,
                cache_hit,
                row_count,
            },
        }
    }
}

/// What `explain` reports instead of executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainOutput {
    pub sql: String,
    pub dialect: Dialect,
    pub tables_used: Vec<String>,
    pub warnings: Vec<String>,
    pub cache_key: String,
}
