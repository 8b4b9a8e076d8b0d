// Dialect Translation Service
//
// Renders an RLS-enforced `CompiledQuery` into SQL text for the dataset's
// dialect and re-parses the result with sqlparser before handing it out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::ast::{ColumnRef, CompiledQuery, Expr, Join, JoinKind, Literal, Relation, RlsState, TableRef};
use super::dialect::{
    Dialect, DialectRenderer, DorisRenderer, DruidRenderer, GenericRenderer, MySqlRenderer,
    PostgreSqlRenderer,
};
use crate::error::RenderError;
use crate::validation::SqlValidator;

/// Rendered, validated SQL. Only the translator can produce one, so adapters
/// never see text that skipped enforcement or validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlText {
    sql: String,
    dialect: Dialect,
}

impl SqlText {
    /// Wrap text that is already known to be valid for `dialect`.
    pub(crate) fn new(sql: impl Into<String>, dialect: Dialect) -> Self {
        Self {
            sql: sql.into(),
            dialect,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.sql
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }
}

impl fmt::Display for SqlText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Registry of dialect renderers keyed by dialect tag.
pub struct DialectTranslationService {
    renderers: HashMap<Dialect, Arc<dyn DialectRenderer>>,
}

impl DialectTranslationService {
    /// Create a service with the built-in renderers registered.
    pub fn new() -> Self {
        let mut service = Self {
            renderers: HashMap::new(),
        };
        service.register_renderer(Arc::new(PostgreSqlRenderer));
        service.register_renderer(Arc::new(MySqlRenderer));
        service.register_renderer(Arc::new(DorisRenderer));
        service.register_renderer(Arc::new(DruidRenderer));
        service.register_renderer(Arc::new(GenericRenderer));
        service
    }

    /// Register or replace the renderer for its dialect.
    pub fn register_renderer(&mut self, renderer: Arc<dyn DialectRenderer>) {
        self.renderers.insert(renderer.dialect(), renderer);
    }

    pub fn supported_dialects(&self) -> Vec<Dialect> {
        let mut dialects: Vec<Dialect> = self.renderers.keys().copied().collect();
        dialects.sort_by_key(|d| d.as_str());
        dialects
    }

    /// Render `query` for its own dialect.
    pub fn render(&self, query: &CompiledQuery) -> Result<SqlText, RenderError> {
        if query.rls() == &RlsState::Unenforced {
            return Err(RenderError::NotEnforced);
        }

        let renderer = self
            .renderers
            .get(&query.dialect())
            .ok_or(RenderError::UnknownDialect(query.dialect()))?;

        // Without joins every column belongs to the base relation.
        let implicit_qualifier = query
            .joins()
            .is_empty()
            .then(|| query.from().alias.as_str());

        let sql = SqlWriter {
            renderer: renderer.as_ref(),
            implicit_qualifier,
        }
        .query(query)?;

        SqlValidator::validate_rendered(query.dialect(), &sql)?;

        tracing::debug!(dialect = %query.dialect(), sql = %sql, "Rendered query");

        Ok(SqlText {
            sql,
            dialect: query.dialect(),
        })
    }
}

impl Default for DialectTranslationService {
    fn default() -> Self {
        Self::new()
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

struct SqlWriter<'a> {
    renderer: &'a dyn DialectRenderer,
    implicit_qualifier: Option<&'a str>,
}

impl SqlWriter<'_> {
    fn ident(&self, name: &str) -> String {
        if is_plain_identifier(name) && !self.renderer.is_reserved(name) {
            return name.to_string();
        }
        let q = self.renderer.quote_char();
        let escaped = name.replace(q, &format!("{}{}", q, q));
        format!("{}{}{}", q, escaped, q)
    }

    fn object_name(&self, name: &str) -> String {
        name.split('.')
            .map(|part| self.ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn column(&self, column: &ColumnRef) -> String {
        match column.qualifier.as_deref() {
            Some(q) if Some(q) != self.implicit_qualifier => format!("{}.{}", self.ident(q), self.ident(&column.name)),
            _ => self.ident(&column.name),
        }
    }

    fn string_literal(&self, value: &str) -> String {
        let mut escaped = if self.renderer.escapes_backslashes() {
            value.replace('\\', "\\\\")
        } else {
            value.to_string()
        };
        escaped = escaped.replace('\'', "''");
        format!("'{}'", escaped)
    }

    fn literal(&self, literal: &Literal) -> String {
        match literal {
            Literal::Null => "NULL".to_string(),
            Literal::Boolean(true) => "TRUE".to_string(),
            Literal::Boolean(false) => "FALSE".to_string(),
            Literal::Integer(i) => i.to_string(),
            Literal::Float(f) => f.to_string(),
            Literal::String(s) => self.string_literal(s),
        }
    }

    fn expr(&self, expr: &Expr) -> Result<String, RenderError> {
        Ok(match expr {
            Expr::Column(column) => self.column(column),
            Expr::Literal(literal) => self.literal(literal),
            Expr::Raw(sql) => format!("({})", sql),
            Expr::Aggregate { func, arg } => {
                let arg = arg.as_deref().map(|a| self.expr(a)).transpose()?;
                self.renderer.aggregate(*func, arg.as_deref())?
            }
            Expr::DateTrunc { grain, expr } => {
                let inner = self.expr(expr)?;
                self.renderer.date_trunc(*grain, &inner)?
            }
            Expr::Compare { left, op, right } => {
                format!("{} {} {}", self.expr(left)?, op.as_sql(), self.expr(right)?)
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let items: Vec<String> = list.iter().map(|l| self.literal(l)).collect();
                format!(
                    "{} {}IN ({})",
                    self.expr(expr)?,
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                )
            }
            Expr::Between { expr, low, high } => format!(
                "{} BETWEEN {} AND {}",
                self.expr(expr)?,
                self.literal(low),
                self.literal(high)
            ),
            Expr::Like {
                expr,
                pattern,
                negated,
            } => format!(
                "{} {}LIKE {}",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" },
                self.string_literal(pattern)
            ),
            Expr::IsNull { expr, negated } => format!(
                "{} IS {}NULL",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" }
            ),
            Expr::And(children) => self.junction(children, " AND ")?,
            Expr::Or(children) => self.junction(children, " OR ")?,
            Expr::Not(inner) => format!("NOT ({})", self.expr(inner)?),
            Expr::TenantGuard { column, tenant_id } => {
                format!("{} = {}", self.column(column), self.string_literal(tenant_id))
            }
        })
    }

    fn junction(&self, children: &[Expr], separator: &str) -> Result<String, RenderError> {
        if children.is_empty() {
            return Ok("1 = 1".to_string());
        }
        let parts = children
            .iter()
            .map(|child| match child {
                Expr::And(_) | Expr::Or(_) => Ok(format!("({})", self.expr(child)?)),
                _ => self.expr(child),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join(separator))
    }

    fn table(&self, table: &TableRef) -> String {
        let relation = match &table.relation {
            Relation::Table(name) => self.object_name(name),
            Relation::Subquery(sql) => format!("({})", sql),
        };
        format!("{} AS {}", relation, self.ident(&table.alias))
    }

    fn join(&self, join: &Join) -> String {
        let keyword = match join.kind {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
        };
        let on: Vec<String> = join
            .on
            .iter()
            .map(|c| format!("{} = {}", self.column(&c.left), self.column(&c.right)))
            .collect();
        format!("{} {} ON {}", keyword, self.table(&join.table), on.join(" AND "))
    }

    fn query(&self, query: &CompiledQuery) -> Result<String, RenderError> {
        let mut parts = Vec::new();

        let items = query
            .projection()
            .iter()
            .map(|item| {
                let expr = self.expr(&item.expr)?;
                Ok(match &item.expr {
                    Expr::Column(column) if column.name == item.alias => expr,
                    _ => format!("{} AS {}", expr, self.ident(&item.alias)),
                })
            })
            .collect::<Result<Vec<_>, RenderError>>()?;
        parts.push(format!("SELECT {}", items.join(", ")));
        parts.push(format!("FROM {}", self.table(query.from())));

        for join in query.joins() {
            parts.push(self.join(join));
        }

        if let Some(selection) = query.selection() {
            parts.push(format!("WHERE {}", self.expr(selection)?));
        }

        if !query.group_by().is_empty() {
            let keys = query
                .group_by()
                .iter()
                .map(|e| self.expr(e))
                .collect::<Result<Vec<_>, _>>()?;
            parts.push(format!("GROUP BY {}", keys.join(", ")));
        }

        if let Some(having) = query.having() {
            parts.push(format!("HAVING {}", self.expr(having)?));
        }

        if !query.order_by().is_empty() {
            let keys = query
                .order_by()
                .iter()
                .map(|o| {
                    Ok(format!(
                        "{} {}",
                        self.expr(&o.expr)?,
                        if o.descending { "DESC" } else { "ASC" }
                    ))
                })
                .collect::<Result<Vec<_>, RenderError>>()?;
            parts.push(format!("ORDER BY {}", keys.join(", ")));
        }

        parts.push(self.renderer.limit_clause(query.limit(), query.offset()));

        Ok(parts.join(" "))
    }
}
