//! `AppJson<T>` replaces `axum::Json<T>` in handlers so a malformed body is a
//! structured 400 instead of axum's plain-text 422.

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};

use crate::error::AppError;

pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(validation_error(&rejection.body_text())),
        }
    }
}

fn validation_error(body_text: &str) -> AppError {
    let field = quoted_after(body_text, "missing field `")
        .or_else(|| quoted_after(body_text, "unknown field `"))
        .unwrap_or_else(|| "body".to_string());
    // Enum fields (status, level, risk, transport) reject unknown names.
    let received = quoted_after(body_text, "unknown variant `").map(serde_json::Value::String);

    AppError::Validation {
        message: format!("Invalid request body: {body_text}"),
        field: Some(field),
        received,
        docs_hint: Some(
            "Check the request body against the endpoint's schema (GET /openapi.json)."
                .to_string(),
        ),
    }
}

/// Text between `pattern` and the next backtick, as serde quotes names.
fn quoted_after(msg: &str, pattern: &str) -> Option<String> {
    let start = msg.find(pattern)? + pattern.len();
    let rest = &msg[start..];
    rest.find('`').map(|end| rest[..end].to_string())
}
