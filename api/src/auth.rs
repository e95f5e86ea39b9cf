//! Shared bearer-token gate.
//!
//! When `OPSDECK_TOKEN` is set every route except the public ones requires
//! `Authorization: Bearer <token>`. Browsers cannot set headers on an
//! `EventSource`, so `/events` also accepts `?access_token=<token>`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use opsdeck_core::auth::{token_hint, token_matches};
use tower::{Layer, Service, ServiceExt};

use crate::error::AppError;

const PUBLIC_PATHS: &[&str] = &["/healthz", "/openapi.json"];
const QUERY_TOKEN_PATHS: &[&str] = &["/events"];

/// Tower Layer that rejects requests without the shared token.
/// A `None` hash disables the check entirely.
#[derive(Clone)]
pub struct BearerAuthLayer {
    token_hash: Option<Arc<str>>,
}

impl BearerAuthLayer {
    pub fn new(token_hash: Option<String>) -> Self {
        Self {
            token_hash: token_hash.map(Arc::from),
        }
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuthService {
            inner,
            token_hash: self.token_hash.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BearerAuthService<S> {
    inner: S,
    token_hash: Option<Arc<str>>,
}

impl<S> Service<Request> for BearerAuthService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let verdict = check_request(&req, self.token_hash.as_deref());

        Box::pin(async move {
            if let Err(err) = verdict {
                tracing::debug!(path = %req.uri().path(), "request rejected by token gate");
                return Ok(err.into_response());
            }
            Ok(ready.oneshot(req).await.into_response())
        })
    }
}

fn check_request(req: &Request, token_hash: Option<&str>) -> Result<(), AppError> {
    let Some(expected) = token_hash else {
        return Ok(());
    };
    let path = req.uri().path();
    if req.method() == Method::OPTIONS || PUBLIC_PATHS.contains(&path) {
        return Ok(());
    }

    let presented = extract_bearer_token(req).or_else(|| {
        QUERY_TOKEN_PATHS
            .contains(&path)
            .then(|| extract_query_token(req))
            .flatten()
    });

    match presented {
        Some(token) if token_matches(&token, expected) => Ok(()),
        Some(token) => {
            tracing::warn!(path, token = %token_hint(&token), "invalid bearer token");
            Err(AppError::Unauthorized {
                message: "Invalid token".to_string(),
            })
        }
        None => Err(AppError::Unauthorized {
            message: "Missing bearer token".to_string(),
        }),
    }
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(req: &Request) -> Option<String> {
    let auth_header = req.headers().get("authorization")?.to_str().ok()?;
    auth_header
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_owned())
}

fn extract_query_token(req: &Request) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "access_token")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}
