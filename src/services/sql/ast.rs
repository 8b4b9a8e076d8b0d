// Portable SQL AST
//
// Engine-neutral representation of a compiled semantic query. The compiler
// builds it, the RLS enforcer rewrites it, the dialect translator renders it
// and the cache derives its key from its serialized form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Dialect;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

impl ColumnRef {
    pub fn new(qualifier: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            qualifier: qualifier.map(str::to_string),
            name: name.into(),
        }
    }

    /// Parses `alias.column` or a bare `column` owned by `default_qualifier`.
    pub fn parse(reference: &str, default_qualifier: &str) -> Self {
        match reference.split_once('.') {
            Some((qualifier, name)) => Self::new(Some(qualifier), name),
            None => Self::new(Some(default_qualifier), reference),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Count,
    CountDistinct,
    Avg,
    Min,
    Max,
    ApproxCountDistinct,
    Median,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
            AggregateFunction::CountDistinct => "count_distinct",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::ApproxCountDistinct => "approx_count_distinct",
            AggregateFunction::Median => "median",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrain {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGrain::Minute => "minute",
            TimeGrain::Hour => "hour",
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
        }
    }
}

impl FromStr for TimeGrain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(TimeGrain::Minute),
            "hour" => Ok(TimeGrain::Hour),
            "day" => Ok(TimeGrain::Day),
            "week" => Ok(TimeGrain::Week),
            "month" => Ok(TimeGrain::Month),
            "quarter" => Ok(TimeGrain::Quarter),
            "year" => Ok(TimeGrain::Year),
            other => Err(format!("unknown time grain '{}'", other)),
        }
    }
}

impl fmt::Display for TimeGrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

impl ComparisonOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "<>",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Column(ColumnRef),
    Literal(Literal),
    /// Trusted SQL from the catalog, validated when the catalog is loaded.
    Raw(String),
    Aggregate {
        func: AggregateFunction,
        arg: Option<Box<Expr>>,
    },
    DateTrunc {
        grain: TimeGrain,
        expr: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        op: ComparisonOp,
        right: Box<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Literal>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Literal,
        high: Literal,
    },
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Mandatory tenant predicate injected by row-level security.
    TenantGuard {
        column: ColumnRef,
        tenant_id: String,
    },
}

impl Expr {
    /// Tenant of the first guard found in this tree, if any.
    pub fn find_tenant_guard(&self) -> Option<&str> {
        match self {
            Expr::TenantGuard { tenant_id, .. } => Some(tenant_id),
            Expr::And(children) | Expr::Or(children) => {
                children.iter().find_map(Expr::find_tenant_guard)
            }
            Expr::Not(inner) => inner.find_tenant_guard(),
            _ => None,
        }
    }

    /// Column qualifiers referenced by this tree.
    pub fn qualifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_qualifiers(&mut out);
        out
    }

    fn collect_qualifiers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Column(col) | Expr::TenantGuard { column: col, .. } => {
                if let Some(q) = &col.qualifier {
                    out.push(q);
                }
            }
            Expr::Literal(_) | Expr::Raw(_) => {}
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.collect_qualifiers(out);
                }
            }
            Expr::DateTrunc { expr, .. }
            | Expr::InList { expr, .. }
            | Expr::Between { expr, .. }
            | Expr::Like { expr, .. }
            | Expr::IsNull { expr, .. }
            | Expr::Not(expr) => expr.collect_qualifiers(out),
            Expr::Compare { left, right, .. } => {
                left.collect_qualifiers(out);
                right.collect_qualifiers(out);
            }
            Expr::And(children) | Expr::Or(children) => {
                for child in children {
                    child.collect_qualifiers(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Table(String),
    Subquery(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRef {
    pub relation: Relation,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Inner,
    #[default]
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinCondition {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Vec<JoinCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderByExpr {
    pub expr: Expr,
    pub descending: bool,
}

/// Row-level security state of a compiled query. Every state except
/// `Unenforced` carries the tenant the query was resolved for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RlsState {
    Unenforced,
    Enforced { tenant_id: String },
    Bypassed { tenant_id: String },
    Unscoped { tenant_id: String },
}

impl RlsState {
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            RlsState::Unenforced => None,
            RlsState::Enforced { tenant_id }
            | RlsState::Bypassed { tenant_id }
            | RlsState::Unscoped { tenant_id } => Some(tenant_id),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RlsState::Unenforced => "unenforced",
            RlsState::Enforced { .. } => "enforced",
            RlsState::Bypassed { .. } => "bypassed",
            RlsState::Unscoped { .. } => "unscoped",
        }
    }
}

/// Compiled query. Only the compiler creates one and only the RLS enforcer
/// changes it; everything else reads it through accessors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub(crate) dataset_id: String,
    pub(crate) dialect: Dialect,
    pub(crate) projection: Vec<SelectItem>,
    pub(crate) from: TableRef,
    pub(crate) joins: Vec<Join>,
    pub(crate) selection: Option<Expr>,
    pub(crate) group_by: Vec<Expr>,
    pub(crate) having: Option<Expr>,
    pub(crate) order_by: Vec<OrderByExpr>,
    pub(crate) limit: u64,
    pub(crate) offset: Option<u64>,
    pub(crate) rls: RlsState,
}

impl CompiledQuery {
    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn projection(&self) -> &[SelectItem] {
        &self.projection
    }

    pub fn from(&self) -> &TableRef {
        &self.from
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn selection(&self) -> Option<&Expr> {
        self.selection.as_ref()
    }

    pub fn group_by(&self) -> &[Expr] {
        &self.group_by
    }

    pub fn having(&self) -> Option<&Expr> {
        self.having.as_ref()
    }

    pub fn order_by(&self) -> &[OrderByExpr] {
        &self.order_by
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn rls(&self) -> &RlsState {
        &self.rls
    }

    /// Tenant guard already present in the WHERE clause, if any.
    pub fn tenant_guard(&self) -> Option<&str> {
        self.selection.as_ref().and_then(Expr::find_tenant_guard)
    }

    /// Physical tables read by this query. A subquery base is reported by alias.
    pub fn tables_used(&self) -> Vec<String> {
        let mut tables = Vec::with_capacity(1 + self.joins.len());
        for table in std::iter::once(&self.from).chain(self.joins.iter().map(|j| &j.table)) {
            let name = match &table.relation {
                Relation::Table(name) => name.clone(),
                Relation::Subquery(_) => format!("(subquery) {}", table.alias),
            };
            if !tables.contains(&name) {
                tables.push(name);
            }
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_ref_parse() {
        assert_eq!(
            ColumnRef::parse("customers.region", "base"),
            ColumnRef::new(Some("customers"), "region")
        );
        assert_eq!(ColumnRef::parse("status", "base"), ColumnRef::new(Some("base"), "status"));
    }

    #[test]
    fn test_find_tenant_guard_nested() {
        let expr = Expr::And(vec![
            Expr::Compare {
                left: Box::new(Expr::Column(ColumnRef::new(Some("base"), "status"))),
                op: ComparisonOp::Eq,
                right: Box::new(Expr::Literal(Literal::String("paid".into()))),
            },
            Expr::TenantGuard {
                column: ColumnRef::new(Some("base"), "tenant_id"),
                tenant_id: "acme".into(),
            },
        ]);
        assert_eq!(expr.find_tenant_guard(), Some("acme"));
        assert_eq!(expr.qualifiers(), vec!["base", "base"]);
    }

    #[test]
    fn test_rls_state_serializes_tenant() {
        let state = RlsState::Bypassed {
            tenant_id: "acme".into(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "bypassed");
        assert_eq!(json["tenant_id"], "acme");
    }

    #[test]
    fn test_time_grain_from_str() {
        assert_eq!("quarter".parse::<TimeGrain>(), Ok(TimeGrain::Quarter));
        assert!("fortnight".parse::<TimeGrain>().is_err());
    }
}
