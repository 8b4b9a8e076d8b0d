// Dialect renderers
//
// Each target engine implements `DialectRenderer` to supply the pieces of SQL
// that differ between engines: identifier quoting, string escaping, date
// truncation, aggregate names and row limiting. The shared walk over the AST
// lives in the translator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlparser::dialect::{GenericDialect, MySqlDialect, PostgreSqlDialect};

use super::ast::{AggregateFunction, TimeGrain};
use crate::error::RenderError;

/// Target SQL dialect tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgresql,
    Mysql,
    Doris,
    Druid,
    Generic,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgresql => "postgresql",
            Dialect::Mysql => "mysql",
            Dialect::Doris => "doris",
            Dialect::Druid => "druid",
            Dialect::Generic => "generic",
        }
    }

    /// sqlparser dialect used to validate text written for this engine.
    pub fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        match self {
            Dialect::Postgresql => Box::new(PostgreSqlDialect {}),
            Dialect::Mysql | Dialect::Doris => Box::new(MySqlDialect {}),
            Dialect::Druid | Dialect::Generic => Box::new(GenericDialect {}),
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(Dialect::Postgresql),
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            "doris" => Ok(Dialect::Doris),
            "druid" => Ok(Dialect::Druid),
            "generic" | "ansi" => Ok(Dialect::Generic),
            other => Err(format!("Unsupported dialect: {}", other)),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Words that must be quoted when used as identifiers in every dialect we emit.
const RESERVED_WORDS: &[&str] = &[
    "all", "and", "any", "as", "asc", "between", "by", "case", "cast", "check", "column",
    "constraint", "create", "cross", "current_date", "current_time", "current_timestamp",
    "default", "delete", "desc", "distinct", "drop", "else", "end", "except", "exists", "false",
    "fetch", "for", "foreign", "from", "full", "group", "having", "in", "index", "inner",
    "insert", "intersect", "interval", "into", "is", "join", "key", "left", "like", "limit",
    "not", "null", "offset", "on", "or", "order", "outer", "primary", "references", "right",
    "rows", "select", "table", "then", "time", "timestamp", "to", "true", "union", "unique",
    "update", "user", "using", "values", "when", "where", "window", "with",
];

/// Dialect-specific rendering hooks.
pub trait DialectRenderer: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn quote_char(&self) -> char {
        '"'
    }

    /// MySQL-family engines treat backslash as an escape inside string literals.
    fn escapes_backslashes(&self) -> bool {
        false
    }

    fn is_reserved(&self, word: &str) -> bool {
        RESERVED_WORDS.binary_search(&word).is_ok()
    }

    fn date_trunc(&self, grain: TimeGrain, expr: &str) -> Result<String, RenderError>;

    fn aggregate(&self, func: AggregateFunction, arg: Option<&str>) -> Result<String, RenderError> {
        standard_aggregate(self.dialect(), func, arg)
    }

    fn limit_clause(&self, limit: u64, offset: Option<u64>) -> String {
        match offset {
            Some(offset) => format!("LIMIT {} OFFSET {}", limit, offset),
            None => format!("LIMIT {}", limit),
        }
    }
}

fn unsupported(dialect: Dialect, construct: impl Into<String>) -> RenderError {
    RenderError::UnsupportedConstruct {
        dialect,
        construct: construct.into(),
    }
}

fn standard_aggregate(
    dialect: Dialect,
    func: AggregateFunction,
    arg: Option<&str>,
) -> Result<String, RenderError> {
    let required = |arg: Option<&str>| {
        arg.map(str::to_string)
            .ok_or_else(|| unsupported(dialect, format!("{} without an argument", func.as_str())))
    };
    match func {
        AggregateFunction::Count => Ok(format!("COUNT({})", arg.unwrap_or("*"))),
        AggregateFunction::CountDistinct => Ok(format!("COUNT(DISTINCT {})", required(arg)?)),
        AggregateFunction::Sum => Ok(format!("SUM({})", required(arg)?)),
        AggregateFunction::Avg => Ok(format!("AVG({})", required(arg)?)),
        AggregateFunction::Min => Ok(format!("MIN({})", required(arg)?)),
        AggregateFunction::Max => Ok(format!("MAX({})", required(arg)?)),
        AggregateFunction::ApproxCountDistinct => {
            Err(unsupported(dialect, "approximate distinct count"))
        }
        AggregateFunction::Median => Err(unsupported(dialect, "median")),
    }
}

fn percentile_cont_median(
    dialect: Dialect,
    func: AggregateFunction,
    arg: Option<&str>,
) -> Result<String, RenderError> {
    match (func, arg) {
        (AggregateFunction::Median, Some(arg)) => Ok(format!(
            "PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY {})",
            arg
        )),
        _ => standard_aggregate(dialect, func, arg),
    }
}

pub struct PostgreSqlRenderer;

impl DialectRenderer for PostgreSqlRenderer {
    fn dialect(&self) -> Dialect {
        Dialect::Postgresql
    }

    fn date_trunc(&self, grain: TimeGrain, expr: &str) -> Result<String, RenderError> {
        Ok(format!("DATE_TRUNC('{}', {})", grain.as_str(), expr))
    }

    fn aggregate(&self, func: AggregateFunction, arg: Option<&str>) -> Result<String, RenderError> {
        percentile_cont_median(self.dialect(), func, arg)
    }
}

pub struct MySqlRenderer;

impl DialectRenderer for MySqlRenderer {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn escapes_backslashes(&self) -> bool {
        true
    }

    fn date_trunc(&self, grain: TimeGrain, expr: &str) -> Result<String, RenderError> {
        let format = match grain {
            TimeGrain::Minute => "%Y-%m-%d %H:%i:00",
            TimeGrain::Hour => "%Y-%m-%d %H:00:00",
            TimeGrain::Day => "%Y-%m-%d 00:00:00",
            TimeGrain::Month => "%Y-%m-01 00:00:00",
            TimeGrain::Year => "%Y-01-01 00:00:00",
            TimeGrain::Week | TimeGrain::Quarter => {
                return Err(unsupported(
                    self.dialect(),
                    format!("{} truncation", grain.as_str()),
                ));
            }
        };
        // DATE_FORMAT yields a string; cast back to DATETIME.
        Ok(format!("CAST(DATE_FORMAT({}, '{}') AS DATETIME)", expr, format))
    }
}

pub struct DorisRenderer;

impl DialectRenderer for DorisRenderer {
    fn dialect(&self) -> Dialect {
        Dialect::Doris
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn escapes_backslashes(&self) -> bool {
        true
    }

    fn date_trunc(&self, grain: TimeGrain, expr: &str) -> Result<String, RenderError> {
        Ok(format!("DATE_TRUNC({}, '{}')", expr, grain.as_str()))
    }

    fn aggregate(&self, func: AggregateFunction, arg: Option<&str>) -> Result<String, RenderError> {
        match (func, arg) {
            (AggregateFunction::ApproxCountDistinct, Some(arg)) => {
                Ok(format!("APPROX_COUNT_DISTINCT({})", arg))
            }
            (AggregateFunction::Median, Some(arg)) => Ok(format!("PERCENTILE({}, 0.5)", arg)),
            _ => standard_aggregate(self.dialect(), func, arg),
        }
    }
}

pub struct DruidRenderer;

impl DialectRenderer for DruidRenderer {
    fn dialect(&self) -> Dialect {
        Dialect::Druid
    }

    fn date_trunc(&self, grain: TimeGrain, expr: &str) -> Result<String, RenderError> {
        let period = match grain {
            TimeGrain::Minute => "PT1M",
            TimeGrain::Hour => "PT1H",
            TimeGrain::Day => "P1D",
            TimeGrain::Week => "P1W",
            TimeGrain::Month => "P1M",
            TimeGrain::Quarter => "P3M",
            TimeGrain::Year => "P1Y",
        };
        Ok(format!("TIME_FLOOR({}, '{}')", expr, period))
    }

    fn aggregate(&self, func: AggregateFunction, arg: Option<&str>) -> Result<String, RenderError> {
        match (func, arg) {
            (AggregateFunction::ApproxCountDistinct, Some(arg)) => {
                Ok(format!("APPROX_COUNT_DISTINCT({})", arg))
            }
            _ => standard_aggregate(self.dialect(), func, arg),
        }
    }
}

/// ANSI SQL for engines without a dedicated renderer.
pub struct GenericRenderer;

impl DialectRenderer for GenericRenderer {
    fn dialect(&self) -> Dialect {
        Dialect::Generic
    }

    fn date_trunc(&self, grain: TimeGrain, expr: &str) -> Result<String, RenderError> {
        Ok(format!("DATE_TRUNC('{}', {})", grain.as_str(), expr))
    }

    fn aggregate(&self, func: AggregateFunction, arg: Option<&str>) -> Result<String, RenderError> {
        percentile_cont_median(self.dialect(), func, arg)
    }

    fn limit_clause(&self, limit: u64, offset: Option<u64>) -> String {
        match offset {
            Some(offset) => format!(
                "OFFSET {} ROWS FETCH FIRST {} ROWS ONLY",
                offset, limit
            ),
            None => format!("FETCH FIRST {} ROWS ONLY", limit),
        }
    }
}
