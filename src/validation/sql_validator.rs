use sqlparser::ast::{SetExpr, Statement};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::error::RenderError;
use crate::services::sql::Dialect;

/// Parses SQL with sqlparser to check that text is what it claims to be:
/// rendered queries, and the trusted fragments catalog authors write.
pub struct SqlValidator;

impl SqlValidator {
    /// Rendered text must be exactly one plain SELECT that keeps its row ceiling.
    pub fn validate_rendered(dialect: Dialect, sql: &str) -> Result<(), RenderError> {
        let parser_dialect = dialect.parser_dialect();
        let statements = Parser::new(parser_dialect.as_ref())
            .try_with_sql(sql)
            .and_then(|mut parser| parser.parse_statements())
            .map_err(|e| RenderError::InvalidSql(format!("SQL parsing error: {}", e)))?;

        match statements.as_slice() {
            [Statement::Query(query)] => {
                if !matches!(query.body.as_ref(), SetExpr::Select(_)) {
                    return Err(RenderError::InvalidSql("expected a plain SELECT".to_string()));
                }
                if query.limit_clause.is_none() && query.fetch.is_none() {
                    return Err(RenderError::InvalidSql("row limit missing".to_string()));
                }
                Ok(())
            }
            other => Err(RenderError::InvalidSql(format!(
                "expected exactly one SELECT statement, found {} statement(s)",
                other.len()
            ))),
        }
    }

    /// A catalog expression must parse as a single scalar expression.
    pub fn validate_expression(dialect: Dialect, fragment: &str) -> Result<(), String> {
        let parser_dialect = dialect.parser_dialect();
        let mut parser = Parser::new(parser_dialect.as_ref())
            .try_with_sql(fragment)
            .map_err(|e| format!("SQL parsing error: {}", e))?;

        parser
            .parse_expr()
            .map_err(|e| format!("SQL parsing error: {}", e))?;

        let next = parser.peek_token();
        if next.token != Token::EOF {
            return Err(format!("unexpected trailing input near '{}'", next.token));
        }
        Ok(())
    }

    /// A catalog base subquery must be exactly one SELECT query.
    pub fn validate_subquery(dialect: Dialect, sql: &str) -> Result<(), String> {
        let parser_dialect = dialect.parser_dialect();
        let statements = Parser::new(parser_dialect.as_ref())
            .try_with_sql(sql)
            .and_then(|mut parser| parser.parse_statements())
            .map_err(|e| format!("SQL parsing error: {}", e))?;

        match statements.as_slice() {
            [Statement::Query(_)] => Ok(()),
            [] => Err("Empty SQL query".to_string()),
            [other] => Err(format!("Only SELECT queries are permitted. Found: {}", other)),
            many => Err(format!(
                "expected a single SELECT query, found {} statements",
                many.len()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_expression() {
        assert!(SqlValidator::validate_expression(
            Dialect::Postgresql,
            "CASE WHEN amount > 100 THEN 'large' ELSE 'small' END"
        )
        .is_ok());
        assert!(SqlValidator::validate_expression(Dialect::Postgresql, "amount * 2").is_ok());
    }

    #[test]
    fn test_validate_expression_rejects_trailing_statements() {
        assert!(SqlValidator::validate_expression(
            Dialect::Postgresql,
            "amount; DROP TABLE orders"
        )
        .is_err());
        assert!(SqlValidator::validate_expression(Dialect::Mysql, "amount) OR (1 = 1").is_err());
    }

    #[test]
    fn test_validate_subquery() {
        assert!(SqlValidator::validate_subquery(
            Dialect::Postgresql,
            "SELECT id, tenant_id, amount FROM raw.orders WHERE deleted_at IS NULL"
        )
        .is_ok());
        assert!(SqlValidator::validate_subquery(Dialect::Postgresql, "DELETE FROM orders").is_err());
        assert!(SqlValidator::validate_subquery(Dialect::Postgresql, "SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn test_validate_rendered_requires_limit() {
        assert!(SqlValidator::validate_rendered(Dialect::Postgresql, "SELECT 1 LIMIT 1").is_ok());
        assert!(matches!(
            SqlValidator::validate_rendered(Dialect::Postgresql, "SELECT 1"),
            Err(RenderError::InvalidSql(_))
        ));
        assert!(SqlValidator::validate_rendered(
            Dialect::Generic,
            "SELECT a FROM t FETCH FIRST 5 ROWS ONLY"
        )
        .is_ok());
    }
}
