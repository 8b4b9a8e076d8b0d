use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::services::sql::Dialect;

/// Errors raised while turning a semantic query into a portable AST.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("Unknown field '{field}' in dataset '{dataset}'")]
    UnknownField { dataset: String, field: String },

    #[error("Field '{0}' is requested more than once")]
    DuplicateField(String),

    #[error("Unsupported filter operator '{0}'")]
    UnsupportedOperator(String),

    #[error("Invalid value for filter on '{field}': {reason}")]
    InvalidFilterValue { field: String, reason: String },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Sort field '{0}' must be one of the selected dimensions or metrics")]
    SortFieldNotSelected(String),

    #[error("Query too complex: {0}")]
    QueryTooComplex(String),

    #[error("Query selects no dimensions and no metrics")]
    EmptyQuery,
}

/// Row-level security failures. All of them fail closed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SecurityError {
    #[error("Dataset '{dataset}' requires row-level security but has no tenant column configured")]
    MissingRlsConfiguration { dataset: String },

    #[error("Compiled query is already scoped to a different tenant")]
    TenantMismatch,

    #[error("Compiled query has not passed row-level security enforcement")]
    Unenforced,
}

/// Errors raised while rendering the portable AST into dialect SQL.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("{construct} is not supported by the {dialect} dialect")]
    UnsupportedConstruct { dialect: Dialect, construct: String },

    #[error("No renderer registered for dialect {0}")]
    UnknownDialect(Dialect),

    #[error("Rendered SQL failed validation: {0}")]
    InvalidSql(String),

    #[error("Query must pass row-level security enforcement before rendering")]
    NotEnforced,
}

/// Engine-agnostic classification of adapter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Connection,
    Auth,
    Syntax,
    Resource,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Connection => "connection",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::Resource => "resource",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized adapter error.
///
/// `transient` marks failures that happened before the statement reached the
/// engine (pool exhaustion, admission queue full) and may be retried once.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{category} error: {message}")]
pub struct ExecutionError {
    pub category: ErrorCategory,
    pub message: String,
    pub transient: bool,
}

impl ExecutionError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            transient: false,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Syntax, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Resource, message)
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Only transient resource errors qualify for the dispatcher's single retry.
    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Resource && self.transient
    }
}

/// Shared store failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store codec error: {0}")]
    Codec(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Catalog loading and validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(String),

    #[error("Failed to parse catalog: {0}")]
    Parse(String),

    #[error("Dataset '{0}' is defined more than once")]
    DuplicateDataset(String),

    #[error("Invalid dataset '{dataset}': {reason}")]
    InvalidDataset { dataset: String, reason: String },
}

/// Top-level error returned by the gateway entry points.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Rate limit exceeded, retry after {}s", retry_after_secs(.retry_after))]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Source '{0}' is not registered")]
    SourceNotFound(String),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Shared store unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::Unavailable(err.to_string())
    }
}

/// Whole seconds until retry, rounded up so clients never retry early.
pub fn retry_after_secs(retry_after: &Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

impl GatewayError {
    /// Stable machine-readable category.
    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::Compile(_) => "validation",
            GatewayError::Render(RenderError::NotEnforced) => "internal",
            GatewayError::Render(_) => "validation",
            GatewayError::Security(_) => "security_configuration",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Execution(_) | GatewayError::SourceNotFound(_) => "execution",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::Catalog(_) => "configuration",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Finer-grained code for clients that branch on specific failures.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Compile(e) => match e {
                CompileError::UnknownDataset(_) => "UNKNOWN_DATASET",
                CompileError::UnknownField { .. } => "UNKNOWN_FIELD",
                CompileError::DuplicateField(_) => "DUPLICATE_FIELD",
                CompileError::UnsupportedOperator(_) => "UNSUPPORTED_OPERATOR",
                CompileError::InvalidFilterValue { .. } | CompileError::InvalidFilter(_) => {
                    "INVALID_FILTER"
                }
                CompileError::SortFieldNotSelected(_) => "INVALID_SORT",
                CompileError::QueryTooComplex(_) => "QUERY_TOO_COMPLEX",
                CompileError::EmptyQuery => "EMPTY_QUERY",
            },
            GatewayError::Render(e) => match e {
                RenderError::UnsupportedConstruct { .. } => "UNSUPPORTED_CONSTRUCT",
                RenderError::UnknownDialect(_) => "UNKNOWN_DIALECT",
                RenderError::InvalidSql(_) => "INVALID_SQL",
                RenderError::NotEnforced => "UNENFORCED_QUERY",
            },
            GatewayError::Security(_) => "ACCESS_DENIED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::Execution(e) => match e.category {
                ErrorCategory::Connection => "EXECUTION_CONNECTION",
                ErrorCategory::Auth => "EXECUTION_AUTH",
                ErrorCategory::Syntax => "EXECUTION_SYNTAX",
                ErrorCategory::Resource => "EXECUTION_RESOURCE",
            },
            GatewayError::SourceNotFound(_) => "SOURCE_NOT_FOUND",
            GatewayError::Timeout(_) => "QUERY_TIMEOUT",
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::Catalog(_) => "CATALOG_ERROR",
            GatewayError::Unavailable(_) => "UNAVAILABLE",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show to callers. Security failures never describe
    /// which tenant data exists, only that access was denied.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Security(_) => {
                "Access denied: the dataset's security configuration does not permit this query"
                    .to_string()
            }
            GatewayError::RateLimited { retry_after } => format!(
                "Too many requests, retry after {} seconds",
                retry_after_secs(retry_after)
            ),
            GatewayError::Unavailable(_) => "Service temporarily unavailable".to_string(),
            GatewayError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
