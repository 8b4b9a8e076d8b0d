// API key authentication
//
// Resolves `Authorization: Bearer <key>` to a `TenantContext` and stores it
// in the request extensions for the handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::routes::AppState;
use crate::config::ApiKeyConfig;
use crate::error::GatewayError;
use crate::models::TenantContext;

/// Secret -> caller identity.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyRegistry {
    keys: Arc<HashMap<String, TenantContext>>,
}

impl ApiKeyRegistry {
    pub fn new(entries: &[ApiKeyConfig]) -> Self {
        let keys = entries
            .iter()
            .map(|entry| {
                (
                    entry.key.clone(),
                    TenantContext::new(&entry.tenant_id, entry.role, &entry.id),
                )
            })
            .collect();
        Self { keys: Arc::new(keys) }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn resolve(&self, authorization: Option<&str>) -> Result<TenantContext, GatewayError> {
        let header = authorization
            .ok_or_else(|| GatewayError::Unauthorized("Missing Authorization header".to_string()))?;
        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            GatewayError::Unauthorized("Invalid Authorization format. Expected: Bearer <key>".to_string())
        })?;
        self.keys
            .get(token.trim())
            .cloned()
            .ok_or_else(|| GatewayError::Unauthorized("Unknown API key".to_string()))
    }
}

pub async fn require_api_key(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match state.api_keys.resolve(authorization) {
        Ok(tenant) => {
            request.extensions_mut().insert(tenant);
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), "Rejected request: {}", e);
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn registry() -> ApiKeyRegistry {
        ApiKeyRegistry::new(&[ApiKeyConfig {
            id: "acme-bi".into(),
            key: "s3cret".into(),
            tenant_id: "acme".into(),
            role: Role::Analyst,
        }])
    }

    #[test]
    fn test_resolve_bearer_key() {
        let tenant = registry().resolve(Some("Bearer s3cret")).unwrap();
        assert_eq!(tenant.tenant_id, "acme");
        assert_eq!(tenant.api_key_id, "acme-bi");
        assert_eq!(tenant.role, Role::Analyst);
    }

    #[test]
    fn test_rejects_missing_or_unknown_keys() {
        let registry = registry();
        assert!(matches!(registry.resolve(None), Err(GatewayError::Unauthorized(_))));
        assert!(matches!(registry.resolve(Some("s3cret")), Err(GatewayError::Unauthorized(_))));
        assert!(matches!(registry.resolve(Some("Bearer nope")), Err(GatewayError::Unauthorized(_))));
    }
}
