use serde::{Deserialize, Serialize};

use crate::services::database::Engine;

/// Schema snapshot of one source, as reported by its adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSchema {
    pub source_id: String,
    pub engine: Engine,
    pub tables: Vec<TableSchema>,
    pub retrieved_at: chrono::DateTime<chrono::Utc>,
}

impl SourceSchema {
    pub fn new(source_id: impl Into<String>, engine: Engine, tables: Vec<TableSchema>) -> Self {
        Self {
            source_id: source_id.into(),
            engine,
            tables,
            retrieved_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub schema: Option<String>,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
}

/// Groups `(schema, table, column, type, nullable)` rows, in the order the
/// information schema returned them, into tables.
pub fn group_columns(
    rows: impl IntoIterator<Item = (Option<String>, String, String, String, bool)>,
) -> Vec<TableSchema> {
    let mut tables: Vec<TableSchema> = Vec::new();
    for (schema, table, column, data_type, is_nullable) in rows {
        let column = ColumnInfo {
            name: column,
            data_type,
            is_nullable,
        };
        match tables.last_mut() {
            Some(last) if last.name == table && last.schema == schema => last.columns.push(column),
            _ => tables.push(TableSchema {
                name: table,
                schema,
                columns: vec![column],
            }),
        }
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_columns() {
        let tables = group_columns(vec![
            (Some("public".into()), "orders".into(), "id".into(), "integer".into(), false),
            (Some("public".into()), "orders".into(), "status".into(), "text".into(), true),
            (Some("public".into()), "customers".into(), "id".into(), "integer".into(), false),
        ]);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].columns.len(), 2);
        assert_eq!(tables[1].name, "customers");
    }
}
