use axum::{
    extract::{Path, State},
    Extension, Json,
};

use crate::api::routes::AppState;
use crate::error::GatewayError;
use crate::models::{SourceSchema, TenantContext};
use crate::services::CatalogVersion;

pub async fn list_datasets(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let datasets = state.service.list_datasets(&tenant).await?;
    Ok(Json(serde_json::json!({
        "datasets": datasets
    })))
}

/// Live schema of a registered source (admin only)
pub async fn describe_source(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<Json<SourceSchema>, GatewayError> {
    tracing::info!("Describing source: {}", id);
    let schema = state.service.describe_source(&id, &tenant).await?;
    Ok(Json(schema))
}

pub async fn reload_catalog(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
) -> Result<Json<CatalogVersion>, GatewayError> {
    let version = state.service.reload_catalog(&tenant).await?;
    Ok(Json(version))
}

/// Cache counters for this process (admin only)
pub async fn cache_stats(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    if !tenant.bypasses_rls() {
        return Err(GatewayError::Forbidden("Only admins may read cache statistics".to_string()));
    }
    let stats = state.service.cache_stats();
    Ok(Json(serde_json::json!({
        "cache": stats,
        "hit_ratio": stats.hit_ratio(),
    })))
}
