// Source adapter capability trait
use std::time::Duration;

use serde_json::Value;

use crate::error::ExecutionError;
use crate::models::{RowSet, TableSchema};
use crate::services::database::Engine;
use crate::services::sql::Dialect;

/// One registered data source. Adapters only ever receive SQL rendered for
/// their own dialect.
///
/// Dropping an `execute` future must stop the statement where the driver
/// allows it; the dispatcher relies on that to enforce its timeout.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn engine(&self) -> Engine;

    fn dialect(&self) -> Dialect {
        self.engine().dialect()
    }

    /// Check that the source is reachable with the configured credentials.
    async fn connect(&self) -> Result<(), ExecutionError>;

    /// Run one SELECT. `timeout` is a hint for engines that accept a
    /// server-side deadline.
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<RowSet, ExecutionError>;

    async fn describe_schema(&self) -> Result<Vec<TableSchema>, ExecutionError>;
}

/// Convert a value the driver returned as text into JSON using the column's
/// declared type. Unparseable values stay strings.
pub fn coerce_text_value(raw: Option<&str>, data_type: &str) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    let ty = data_type.to_ascii_lowercase();
    let base = ty.split(|c: char| c == '(' || c == ' ').next().unwrap_or_default();

    match base {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "int" | "bigint" | "tinyint"
        | "mediumint" | "year" | "long" => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        "float4" | "float8" | "real" | "float" | "double" | "numeric" | "decimal" => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        "bool" | "boolean" => match raw {
            "t" | "true" | "1" => Value::Bool(true),
            "f" | "false" | "0" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_text_value() {
        assert_eq!(coerce_text_value(Some("42"), "int8"), json!(42));
        assert_eq!(coerce_text_value(Some("1.5"), "numeric"), json!(1.5));
        assert_eq!(coerce_text_value(Some("t"), "bool"), json!(true));
        assert_eq!(coerce_text_value(Some("2024-01-01"), "date"), json!("2024-01-01"));
        assert_eq!(coerce_text_value(None, "int4"), Value::Null);
        assert_eq!(coerce_text_value(Some("NaN"), "float8"), json!("NaN"));
        assert_eq!(coerce_text_value(Some("12"), "DECIMAL(10,2)"), json!(12.0));
    }
}
