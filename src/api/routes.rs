use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::auth::{require_api_key, ApiKeyRegistry};
use crate::api::handlers::{catalog, query};
use crate::services::QueryService;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
    pub api_keys: ApiKeyRegistry,
}

/// Create router with application state
pub fn create_router(service: Arc<QueryService>, api_keys: ApiKeyRegistry) -> Router {
    let state = AppState { service, api_keys };

    let api = Router::new()
        .route("/api/query", post(query::run_query))
        .route("/api/explain", post(query::explain))
        .route("/api/datasets", get(catalog::list_datasets))
        .route("/api/sources/{id}/schema", get(catalog::describe_source))
        .route("/api/catalog/reload", post(catalog::reload_catalog))
        .route("/api/cache/stats", get(catalog::cache_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health_check))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
