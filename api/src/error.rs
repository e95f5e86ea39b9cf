use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use opsdeck_core::error::{self, ApiError};

use crate::store::StoreError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or wrong bearer token (401)
    Unauthorized { message: String },
    /// Unknown route or record (404)
    NotFound { resource: String },
    /// Internal error (500)
    Internal(String),
}

impl AppError {
    /// 400 for a required body field that was absent or blank.
    pub fn missing_field(field: &str) -> Self {
        AppError::Validation {
            message: format!("{field} is required"),
            field: Some(field.to_string()),
            received: None,
            docs_hint: Some(
                "Check the request body against the endpoint's schema (GET /openapi.json)."
                    .to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Unauthorized { message } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: error::codes::UNAUTHORIZED.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: Some(
                        "Send `Authorization: Bearer <OPSDECK_TOKEN>`; /events also accepts ?access_token=."
                            .to_string(),
                    ),
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message: format!("{resource} not found"),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                },
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Trimmed value of a required string field, or a 400 naming the field.
pub fn require(value: Option<String>, field: &str) -> Result<String, AppError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::missing_field(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_rejects_blank_values() {
        assert!(matches!(
            require(Some("   ".to_string()), "agentId"),
            Err(AppError::Validation { field: Some(ref f), .. }) if f == "agentId"
        ));
        assert!(require(None, "agentId").is_err());
        assert_eq!(require(Some(" codex ".to_string()), "agentId").ok().as_deref(), Some("codex"));
    }

    #[test]
    fn status_codes_match_variants() {
        let not_found = AppError::NotFound {
            resource: "session s1".to_string(),
        }
        .into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        let unauthorized = AppError::Unauthorized {
            message: "missing token".to_string(),
        }
        .into_response();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
    }
}
