use axum::{extract::State, Extension, Json};

use crate::api::routes::AppState;
use crate::error::GatewayError;
use crate::models::{ExplainOutput, QueryResult, SemanticQuery, TenantContext};

/// Execute a semantic query
pub async fn run_query(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Json(query): Json<SemanticQuery>,
) -> Result<Json<QueryResult>, GatewayError> {
    let result = state.service.run_query(&query, &tenant).await?;
    Ok(Json(result))
}

/// Render a semantic query without executing it
pub async fn explain(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Json(query): Json<SemanticQuery>,
) -> Result<Json<ExplainOutput>, GatewayError> {
    let explained = state.service.explain(&query, &tenant).await?;
    Ok(Json(explained))
}
