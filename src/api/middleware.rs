use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{retry_after_secs, ErrorCategory, GatewayError};

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub category: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            code: err.code().to_string(),
            category: err.category().to_string(),
            message: err.user_message(),
        }
    }
}

/// HTTP status for each failure class.
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Compile(_) | GatewayError::Render(_) => StatusCode::BAD_REQUEST,
        GatewayError::Security(_) | GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
        GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::SourceNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Execution(e) if e.category == ErrorCategory::Syntax => StatusCode::BAD_REQUEST,
        GatewayError::Execution(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Catalog(_) | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail::from_error(&self),
        });
        let mut response = (status, body).into_response();

        if let Some(retry_after) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs(&retry_after).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
