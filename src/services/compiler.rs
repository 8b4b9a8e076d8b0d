// Query Compiler
//
// Turns a SemanticQuery into a portable CompiledQuery using the dataset's
// catalog entry. Pure: no I/O, no clock, no randomness, so the same input
// always compiles to the same AST.

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;

use crate::error::CompileError;
use crate::models::{
    BaseRelation, Dataset, Dimension, FieldExpr, FieldType, Filter, FilterPredicate,
    SemanticQuery, SortDirection,
};
use crate::services::sql::{
    ColumnRef, CompiledQuery, ComparisonOp, Expr, Join, JoinCondition, Literal, OrderByExpr,
    Relation, RlsState, SelectItem, TableRef, TimeGrain,
};

/// Suffix separating a time dimension from a requested grain (`created_at__month`).
pub const GRAIN_SEPARATOR: &str = "__";

/// Complexity ceilings applied to every query.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerLimits {
    pub max_dimensions: usize,
    pub max_metrics: usize,
    pub max_filter_depth: usize,
    pub max_limit: u64,
    pub default_limit: u64,
    pub max_in_list: usize,
}

impl Default for CompilerLimits {
    fn default() -> Self {
        Self {
            max_dimensions: 10,
            max_metrics: 20,
            max_filter_depth: 4,
            max_limit: 100_000,
            default_limit: 1_000,
            max_in_list: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Junction {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Where,
    Having,
}

/// A field name resolved against the dataset.
struct ResolvedField {
    expr: Expr,
    field_type: FieldType,
    clause: Clause,
}

#[derive(Debug, Default)]
pub struct QueryCompiler {
    limits: CompilerLimits,
}

impl QueryCompiler {
    pub fn new(limits: CompilerLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &CompilerLimits {
        &self.limits
    }

    /// Compile `query` against `dataset`. The result has not been through
    /// row-level security yet.
    pub fn compile(
        &self,
        dataset: &Dataset,
        query: &SemanticQuery,
    ) -> Result<CompiledQuery, CompileError> {
        if query.dataset_id != dataset.id {
            return Err(CompileError::UnknownDataset(query.dataset_id.clone()));
        }
        if query.dimensions.is_empty() && query.metrics.is_empty() {
            return Err(CompileError::EmptyQuery);
        }
        self.check_ceilings(query)?;

        let scope = Scope { dataset };

        let mut selected = HashSet::new();
        let mut projection = Vec::with_capacity(query.dimensions.len() + query.metrics.len());
        let mut group_by = Vec::with_capacity(query.dimensions.len());

        for name in &query.dimensions {
            let field = scope.resolve(name)?;
            if field.clause != Clause::Where {
                return Err(scope.unknown(name));
            }
            if !selected.insert(name.as_str()) {
                return Err(CompileError::DuplicateField(name.clone()));
            }
            group_by.push(field.expr.clone());
            projection.push(SelectItem {
                expr: field.expr,
                alias: name.clone(),
            });
        }

        for name in &query.metrics {
            let field = scope.resolve(name)?;
            if field.clause != Clause::Having {
                return Err(scope.unknown(name));
            }
            if !selected.insert(name.as_str()) {
                return Err(CompileError::DuplicateField(name.clone()));
            }
            projection.push(SelectItem {
                expr: field.expr,
                alias: name.clone(),
            });
        }

        let mut where_parts = Vec::new();
        let mut having_parts = Vec::new();
        for filter in &query.filters {
            let (expr, clause) = self.compile_filter(&scope, filter)?;
            match clause {
                Clause::Where => where_parts.push(expr),
                Clause::Having => having_parts.push(expr),
            }
        }
        let selection = junction(where_parts, Junction::And);
        let having = junction(having_parts, Junction::And);

        let mut order_by = Vec::with_capacity(query.sort.len());
        for spec in &query.sort {
            if !selected.contains(spec.field.as_str()) {
                // Unknown names report as unknown before anything else.
                scope.resolve(&spec.field)?;
                return Err(CompileError::SortFieldNotSelected(spec.field.clone()));
            }
            order_by.push(OrderByExpr {
                expr: Expr::Column(ColumnRef::new(None, spec.field.clone())),
                descending: spec.direction == SortDirection::Desc,
            });
        }

        let limit = query.limit.unwrap_or(self.limits.default_limit);
        if limit > self.limits.max_limit {
            return Err(CompileError::QueryTooComplex(format!(
                "limit {} exceeds the maximum of {}",
                limit, self.limits.max_limit
            )));
        }

        let from = TableRef {
            relation: match &dataset.base {
                BaseRelation::Table(name) => Relation::Table(name.clone()),
                BaseRelation::Sql(sql) => Relation::Subquery(sql.clone()),
            },
            alias: dataset.alias.clone(),
        };

        let referenced = projection
            .iter()
            .map(|item| &item.expr)
            .chain(selection.iter())
            .chain(having.iter());
        let joins = required_joins(dataset, referenced);

        Ok(CompiledQuery {
            dataset_id: dataset.id.clone(),
            dialect: dataset.dialect,
            projection,
            from,
            joins,
            selection,
            group_by,
            having,
            order_by,
            limit,
            offset: query.offset.filter(|o| *o > 0),
            rls: RlsState::Unenforced,
        })
    }

    fn check_ceilings(&self, query: &SemanticQuery) -> Result<(), CompileError> {
        if query.dimensions.len() > self.limits.max_dimensions {
            return Err(CompileError::QueryTooComplex(format!(
                "{} dimensions requested, maximum is {}",
                query.dimensions.len(),
                self.limits.max_dimensions
            )));
        }
        if query.metrics.len() > self.limits.max_metrics {
            return Err(CompileError::QueryTooComplex(format!(
                "{} metrics requested, maximum is {}",
                query.metrics.len(),
                self.limits.max_metrics
            )));
        }
        if let Some(depth) = query.filters.iter().map(Filter::depth).max() {
            if depth > self.limits.max_filter_depth {
                return Err(CompileError::QueryTooComplex(format!(
                    "filter nesting depth {} exceeds the maximum of {}",
                    depth, self.limits.max_filter_depth
                )));
            }
        }
        Ok(())
    }

    fn compile_filter(&self, scope: &Scope<'_>, filter: &Filter) -> Result<(Expr, Clause), CompileError> {
        match filter {
            Filter::Predicate(predicate) => self.compile_predicate(scope, predicate),
            Filter::Not { not } => {
                let (inner, clause) = self.compile_filter(scope, not)?;
                Ok((Expr::Not(Box::new(inner)), clause))
            }
            Filter::And { and: children } => self.compile_group(scope, children, Junction::And),
            Filter::Or { or: children } => self.compile_group(scope, children, Junction::Or),
        }
    }

    fn compile_group(
        &self,
        scope: &Scope<'_>,
        children: &[Filter],
        kind: Junction,
    ) -> Result<(Expr, Clause), CompileError> {
        let name = match kind {
            Junction::And => "and",
            Junction::Or => "or",
        };
        let mut clause = None;
        let mut parts = Vec::with_capacity(children.len());
        for child in children {
            let (expr, child_clause) = self.compile_filter(scope, child)?;
            match clause {
                None => clause = Some(child_clause),
                Some(c) if c != child_clause => {
                    return Err(CompileError::InvalidFilter(format!(
                        "'{}' group mixes dimension and metric filters",
                        name
                    )));
                }
                Some(_) => {}
            }
            parts.push(expr);
        }
        match (junction(parts, kind), clause) {
            (Some(expr), Some(clause)) => Ok((expr, clause)),
            _ => Err(CompileError::InvalidFilter(format!(
                "'{}' requires at least one filter",
                name
            ))),
        }
    }

    fn compile_predicate(
        &self,
        scope: &Scope<'_>,
        predicate: &FilterPredicate,
    ) -> Result<(Expr, Clause), CompileError> {
        let field = scope.resolve(&predicate.field)?;
        let operator = predicate
            .operator
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let target = Box::new(field.expr);
        let value = &predicate.value;
        let name = predicate.field.as_str();

        let compare = |op: ComparisonOp| -> Result<Expr, CompileError> {
            Ok(Expr::Compare {
                left: target.clone(),
                op,
                right: Box::new(Expr::Literal(scalar(name, field.field_type, value)?)),
            })
        };

        let expr = match operator.as_str() {
            "=" => compare(ComparisonOp::Eq)?,
            "!=" | "<>" => compare(ComparisonOp::NotEq)?,
            ">" => compare(ComparisonOp::Gt)?,
            ">=" => compare(ComparisonOp::GtEq)?,
            "<" => compare(ComparisonOp::Lt)?,
            "<=" => compare(ComparisonOp::LtEq)?,
            "in" | "not in" => Expr::InList {
                expr: target.clone(),
                list: self.in_list(name, field.field_type, value)?,
                negated: operator == "not in",
            },
            "like" | "not like" => Expr::Like {
                expr: target.clone(),
                pattern: match value {
                    Value::String(pattern) => pattern.clone(),
                    _ => return Err(invalid_value(name, "'like' requires a string pattern")),
                },
                negated: operator == "not like",
            },
            "between" => match value {
                Value::Array(bounds) if bounds.len() == 2 => Expr::Between {
                    expr: target.clone(),
                    low: scalar(name, field.field_type, &bounds[0])?,
                    high: scalar(name, field.field_type, &bounds[1])?,
                },
                _ => {
                    return Err(invalid_value(
                        name,
                        "'between' requires an array of exactly two values",
                    ))
                }
            },
            "is null" | "is not null" => {
                if !value.is_null() {
                    return Err(invalid_value(name, "null checks take no value"));
                }
                Expr::IsNull {
                    expr: target.clone(),
                    negated: operator == "is not null",
                }
            }
            _ => return Err(CompileError::UnsupportedOperator(predicate.operator.clone())),
        };

        Ok((expr, field.clause))
    }

    fn in_list(&self, name: &str, field_type: FieldType, value: &Value) -> Result<Vec<Literal>, CompileError> {
        let items = match value {
            Value::Array(items) if !items.is_empty() => items,
            _ => return Err(invalid_value(name, "'in' requires a non-empty array")),
        };
        if items.len() > self.limits.max_in_list {
            return Err(CompileError::QueryTooComplex(format!(
                "'in' list for '{}' has {} values, maximum is {}",
                name,
                items.len(),
                self.limits.max_in_list
            )));
        }
        let mut list = items
            .iter()
            .map(|item| scalar(name, field_type, item))
            .collect::<Result<Vec<_>, _>>()?;
        list.sort_by_cached_key(|l| format!("{:?}", l));
        list.dedup();
        Ok(list)
    }
}

/// Name resolution against one dataset.
struct Scope<'a> {
    dataset: &'a Dataset,
}

impl Scope<'_> {
    fn field_expr(&self, expr: &FieldExpr) -> Expr {
        match expr {
            FieldExpr::Column(column) => Expr::Column(ColumnRef::parse(column, &self.dataset.alias)),
            FieldExpr::Sql(sql) => Expr::Raw(sql.clone()),
        }
    }

    fn unknown(&self, field: &str) -> CompileError {
        CompileError::UnknownField {
            dataset: self.dataset.id.clone(),
            field: field.to_string(),
        }
    }

    fn resolve(&self, name: &str) -> Result<ResolvedField, CompileError> {
        if let Some(dimension) = self.dataset.dimension(name) {
            return Ok(self.dimension(dimension, dimension.time_grain));
        }
        if let Some(metric) = self.dataset.metric(name) {
            return Ok(ResolvedField {
                expr: Expr::Aggregate {
                    func: metric.aggregation,
                    arg: metric.expr.as_ref().map(|e| Box::new(self.field_expr(e))),
                },
                field_type: metric.field_type,
                clause: Clause::Having,
            });
        }
        if let Some((base, grain)) = name.rsplit_once(GRAIN_SEPARATOR) {
            let dimension = self
                .dataset
                .dimension(base)
                .filter(|d| d.field_type.is_temporal());
            if let (Some(dimension), Ok(grain)) = (dimension, grain.parse::<TimeGrain>()) {
                return Ok(self.dimension(dimension, Some(grain)));
            }
        }
        Err(self.unknown(name))
    }

    fn dimension(&self, dimension: &Dimension, grain: Option<TimeGrain>) -> ResolvedField {
        let base = self.field_expr(&dimension.expr);
        let expr = match grain {
            Some(grain) => Expr::DateTrunc {
                grain,
                expr: Box::new(base),
            },
            None => base,
        };
        ResolvedField {
            expr,
            field_type: dimension.field_type,
            clause: Clause::Where,
        }
    }
}

fn invalid_value(field: &str, reason: impl Into<String>) -> CompileError {
    CompileError::InvalidFilterValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Convert a JSON filter value to a literal of the field's type.
fn scalar(field: &str, field_type: FieldType, value: &Value) -> Result<Literal, CompileError> {
    match value {
        Value::Null => Err(invalid_value(
            field,
            "null is only valid with 'is null' and 'is not null'",
        )),
        Value::Bool(b) if field_type == FieldType::Boolean => Ok(Literal::Boolean(*b)),
        Value::Number(n) if field_type.is_numeric() => match n.as_i64() {
            Some(i) => Ok(Literal::Integer(i)),
            None => n
                .as_f64()
                .map(Literal::Float)
                .ok_or_else(|| invalid_value(field, "number out of range")),
        },
        Value::String(s) if !field_type.is_numeric() && field_type != FieldType::Boolean => {
            Ok(Literal::String(s.clone()))
        }
        Value::Array(_) | Value::Object(_) => Err(invalid_value(field, "expected a single value")),
        _ => Err(invalid_value(
            field,
            format!("value does not match field type {:?}", field_type),
        )),
    }
}

/// Flatten, sort and deduplicate conjuncts or disjuncts so that filter order
/// in the request never changes the compiled output.
fn junction(parts: Vec<Expr>, kind: Junction) -> Option<Expr> {
    let mut flat = Vec::with_capacity(parts.len());
    for part in parts {
        match (part, kind) {
            (Expr::And(children), Junction::And) | (Expr::Or(children), Junction::Or) => {
                flat.extend(children)
            }
            (other, _) => flat.push(other),
        }
    }
    flat.sort_by_cached_key(|e| format!("{:?}", e));
    flat.dedup();
    match flat.len() {
        0 => None,
        1 => flat.pop(),
        _ => Some(match kind {
            Junction::And => Expr::And(flat),
            Junction::Or => Expr::Or(flat),
        }),
    }
}

/// Joins referenced by the given expressions, plus the joins they depend on,
/// in catalog order.
fn required_joins<'a>(dataset: &Dataset, exprs: impl Iterator<Item = &'a Expr>) -> Vec<Join> {
    let mut needed: BTreeSet<&str> = BTreeSet::new();
    for expr in exprs {
        needed.extend(expr.qualifiers());
        collect_raw_references(dataset, expr, &mut needed);
    }

    // Joins may hang off earlier joins; follow until stable.
    loop {
        let before = needed.len();
        for join in &dataset.joins {
            if needed.contains(join.alias.as_str()) {
                for key in &join.on {
                    if let Some((qualifier, _)) = key.left.split_once('.') {
                        if let Some(parent) = dataset.join(qualifier) {
                            needed.insert(parent.alias.as_str());
                        }
                    }
                }
            }
        }
        if needed.len() == before {
            break;
        }
    }

    dataset
        .joins
        .iter()
        .filter(|join| needed.contains(join.alias.as_str()))
        .map(|join| Join {
            kind: join.kind,
            table: TableRef {
                relation: Relation::Table(join.table.clone()),
                alias: join.alias.clone(),
            },
            on: join
                .on
                .iter()
                .map(|key| JoinCondition {
                    left: ColumnRef::parse(&key.left, &dataset.alias),
                    right: ColumnRef::new(Some(&join.alias), key.right.clone()),
                })
                .collect(),
        })
        .collect()
}

fn collect_raw_references<'a>(dataset: &'a Dataset, expr: &Expr, needed: &mut BTreeSet<&'a str>) {
    match expr {
        Expr::Raw(sql) => {
            for join in &dataset.joins {
                if references_alias(sql, &join.alias) {
                    needed.insert(join.alias.as_str());
                }
            }
        }
        Expr::Aggregate { arg: Some(inner), .. }
        | Expr::DateTrunc { expr: inner, .. }
        | Expr::InList { expr: inner, .. }
        | Expr::Between { expr: inner, .. }
        | Expr::Like { expr: inner, .. }
        | Expr::IsNull { expr: inner, .. }
        | Expr::Not(inner) => collect_raw_references(dataset, inner, needed),
        Expr::Compare { left, right, .. } => {
            collect_raw_references(dataset, left, needed);
            collect_raw_references(dataset, right, needed);
        }
        Expr::And(children) | Expr::Or(children) => {
            for child in children {
                collect_raw_references(dataset, child, needed);
            }
        }
        _ => {}
    }
}

/// Whether `sql` mentions `alias.` as a qualifier rather than inside a longer name.
fn references_alias(sql: &str, alias: &str) -> bool {
    let needle = format!("{}.", alias);
    sql.match_indices(&needle).any(|(idx, _)| {
        sql[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JoinDef, JoinKey};
    use crate::services::sql::{AggregateFunction, Dialect, JoinKind};
    use serde_json::json;

    fn orders() -> Dataset {
        Dataset::new(
            "orders",
            "warehouse",
            Dialect::Postgresql,
            BaseRelation::Table("orders".to_string()),
        )
        .with_dimension("region", FieldExpr::Column("region".into()), FieldType::String)
        .with_dimension("status", FieldExpr::Column("status".into()), FieldType::String)
        .with_dimension("created_at", FieldExpr::Column("created_at".into()), FieldType::Timestamp)
        .with_dimension("segment", FieldExpr::Column("customers.segment".into()), FieldType::String)
        .with_metric("revenue", AggregateFunction::Sum, Some(FieldExpr::Column("amount".into())))
        .with_metric("order_count", AggregateFunction::Count, None)
        .with_join(JoinDef {
            alias: "customers".into(),
            table: "public.customers".into(),
            kind: JoinKind::Left,
            on: vec![JoinKey {
                left: "customer_id".into(),
                right: "id".into(),
            }],
        })
        .with_tenant_column("tenant_id")
    }

    fn compile(query: SemanticQuery) -> Result<CompiledQuery, CompileError> {
        QueryCompiler::default().compile(&orders(), &query)
    }

    #[test]
    fn test_compile_groups_by_dimensions() {
        let compiled = compile(SemanticQuery::new("orders").dimension("region").metric("revenue")).unwrap();
        assert_eq!(compiled.projection().len(), 2);
        assert_eq!(compiled.group_by().len(), 1);
        assert_eq!(compiled.limit(), 1_000);
        assert!(compiled.joins().is_empty());
        assert_eq!(compiled.rls(), &RlsState::Unenforced);
    }

    #[test]
    fn test_scalar_aggregate_has_no_group_by() {
        let compiled = compile(SemanticQuery::new("orders").metric("order_count")).unwrap();
        assert!(compiled.group_by().is_empty());
    }

    #[test]
    fn test_unknown_field_names_dataset_and_field() {
        let err = compile(SemanticQuery::new("orders").dimension("nonexistent_field")).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownField {
                dataset: "orders".into(),
                field: "nonexistent_field".into()
            }
        );
    }

    #[test]
    fn test_unknown_filter_and_sort_fields() {
        let err = compile(
            SemanticQuery::new("orders")
                .metric("revenue")
                .filter(Filter::predicate("nope", "=", json!("x"))),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnknownField { .. }));

        let err = compile(SemanticQuery::new("orders").metric("revenue").sort_by("nope", SortDirection::Asc))
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownField { .. }));

        let err = compile(SemanticQuery::new("orders").metric("revenue").sort_by("region", SortDirection::Asc))
            .unwrap_err();
        assert_eq!(err, CompileError::SortFieldNotSelected("region".into()));
    }

    #[test]
    fn test_empty_and_duplicate_queries() {
        assert_eq!(compile(SemanticQuery::new("orders")).unwrap_err(), CompileError::EmptyQuery);
        assert_eq!(
            compile(SemanticQuery::new("orders").dimension("region").dimension("region")).unwrap_err(),
            CompileError::DuplicateField("region".into())
        );
    }

    #[test]
    fn test_unsupported_operator_and_bad_values() {
        let base = || SemanticQuery::new("orders").metric("revenue");
        assert_eq!(
            compile(base().filter(Filter::predicate("region", "regex", json!("x")))).unwrap_err(),
            CompileError::UnsupportedOperator("regex".into())
        );
        assert!(matches!(
            compile(base().filter(Filter::predicate("created_at", "between", json!(["2024-01-01"])))).unwrap_err(),
            CompileError::InvalidFilterValue { .. }
        ));
        assert!(matches!(
            compile(base().filter(Filter::predicate("region", "in", json!([])))).unwrap_err(),
            CompileError::InvalidFilterValue { .. }
        ));
        assert!(matches!(
            compile(base().filter(Filter::predicate("revenue", ">", json!("lots")))).unwrap_err(),
            CompileError::InvalidFilterValue { .. }
        ));
    }

    #[test]
    fn test_ceilings() {
        let compiler = QueryCompiler::new(CompilerLimits {
            max_dimensions: 1,
            max_filter_depth: 2,
            max_limit: 50,
            ..CompilerLimits::default()
        });
        let dataset = orders();
        let too_many = SemanticQuery::new("orders").dimension("region").dimension("status");
        assert!(matches!(
            compiler.compile(&dataset, &too_many),
            Err(CompileError::QueryTooComplex(_))
        ));

        let too_deep = SemanticQuery::new("orders").metric("revenue").filter(Filter::and(vec![
            Filter::not(Filter::predicate("region", "=", json!("EU"))),
        ]));
        assert!(matches!(
            compiler.compile(&dataset, &too_deep),
            Err(CompileError::QueryTooComplex(_))
        ));

        let too_long = SemanticQuery::new("orders").metric("revenue").limit(51);
        assert!(matches!(
            compiler.compile(&dataset, &too_long),
            Err(CompileError::QueryTooComplex(_))
        ));
    }

    #[test]
    fn test_filter_order_does_not_change_output() {
        let a = Filter::predicate("region", "=", json!("EU"));
        let b = Filter::predicate("status", "in", json!(["paid", "shipped"]));
        let b_reordered = Filter::predicate("status", "in", json!(["shipped", "paid"]));

        let first = compile(SemanticQuery::new("orders").metric("revenue").filter(a.clone()).filter(b)).unwrap();
        let second = compile(
            SemanticQuery::new("orders")
                .metric("revenue")
                .filter(Filter::and(vec![b_reordered, a])),
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_metric_filters_go_to_having() {
        let compiled = compile(
            SemanticQuery::new("orders")
                .dimension("region")
                .metric("revenue")
                .filter(Filter::predicate("revenue", ">", json!(1000)))
                .filter(Filter::predicate("region", "!=", json!("APAC"))),
        )
        .unwrap();
        assert!(matches!(compiled.having(), Some(Expr::Compare { .. })));
        assert!(matches!(compiled.selection(), Some(Expr::Compare { .. })));
    }

    #[test]
    fn test_mixed_group_is_rejected() {
        let err = compile(SemanticQuery::new("orders").metric("revenue").filter(Filter::or(vec![
            Filter::predicate("revenue", ">", json!(1000)),
            Filter::predicate("region", "=", json!("EU")),
        ])))
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidFilter(_)));
    }

    #[test]
    fn test_join_included_only_when_referenced() {
        let compiled = compile(SemanticQuery::new("orders").dimension("segment").metric("revenue")).unwrap();
        assert_eq!(compiled.joins().len(), 1);
        assert_eq!(compiled.tables_used(), vec!["orders".to_string(), "public.customers".to_string()]);

        let compiled = compile(
            SemanticQuery::new("orders")
                .metric("revenue")
                .filter(Filter::predicate("segment", "=", json!("smb"))),
        )
        .unwrap();
        assert_eq!(compiled.joins().len(), 1);
    }

    #[test]
    fn test_time_grain_suffix() {
        let compiled = compile(SemanticQuery::new("orders").dimension("created_at__month").metric("revenue")).unwrap();
        assert!(matches!(
            compiled.projection()[0].expr,
            Expr::DateTrunc { grain: TimeGrain::Month, .. }
        ));
        assert_eq!(compiled.projection()[0].alias, "created_at__month");

        let err = compile(SemanticQuery::new("orders").dimension("region__month")).unwrap_err();
        assert!(matches!(err, CompileError::UnknownField { .. }));
    }

    #[test]
    fn test_references_alias() {
        assert!(references_alias("customers.segment || 'x'", "customers"));
        assert!(references_alias("upper(customers.name)", "customers"));
        assert!(!references_alias("old_customers.segment", "customers"));
    }
}
