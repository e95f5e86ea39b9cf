use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Closed set of reasons an upstream call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Auth,
    Quota,
    RateLimit,
    InvalidRequest,
    Server,
    Timeout,
    Network,
    Unknown,
}

impl FailureKind {
    /// Failures that will not clear up on their own within seconds.
    pub fn is_hard(self) -> bool {
        matches!(
            self,
            FailureKind::Auth
                | FailureKind::Quota
                | FailureKind::RateLimit
                | FailureKind::InvalidRequest
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Auth => "auth",
            FailureKind::Quota => "quota",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::Server => "server",
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const QUOTA_VOCABULARY: &[&str] = &["quota", "credit", "balance", "billing", "insufficient_funds"];
const TIMEOUT_VOCABULARY: &[&str] = &["timeout", "timed out", "abort", "deadline"];
const NETWORK_VOCABULARY: &[&str] = &[
    "fetch",
    "connection refused",
    "econnrefused",
    "econnreset",
    "connection reset",
    "enotfound",
    "dns",
    "failed to lookup",
    "network",
    "unreachable",
    "error trying to connect",
];

pub fn classify_http_status(status: u16, body: &str) -> FailureKind {
    match status {
        401 | 403 => FailureKind::Auth,
        429 => {
            let body = body.to_lowercase();
            if QUOTA_VOCABULARY.iter().any(|word| body.contains(word)) {
                FailureKind::Quota
            } else {
                FailureKind::RateLimit
            }
        }
        400 | 404 | 405 | 409 | 413 | 415 | 422 => FailureKind::InvalidRequest,
        s if s >= 500 => FailureKind::Server,
        _ => FailureKind::Unknown,
    }
}

/// Classify a transport error from its rendered message. Timeouts are checked
/// first so "connection timed out" lands on `timeout`.
pub fn classify_transport_message(message: &str) -> FailureKind {
    let message = message.to_lowercase();
    if TIMEOUT_VOCABULARY.iter().any(|word| message.contains(word)) {
        FailureKind::Timeout
    } else if NETWORK_VOCABULARY.iter().any(|word| message.contains(word)) {
        FailureKind::Network
    } else {
        FailureKind::Unknown
    }
}

/// A classified upstream failure, carried as a value through orchestration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} upstream failure{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct UpstreamFailure {
    pub kind: FailureKind,
    pub status: Option<u16>,
    /// Explicit retry hint from the upstream (e.g. `retry-after`).
    pub retry_after_seconds: Option<u64>,
    pub detail: String,
}

impl UpstreamFailure {
    pub fn http(status: u16, body: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        let detail = body.into();
        Self {
            kind: classify_http_status(status, &detail),
            status: Some(status),
            retry_after_seconds,
            detail,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        let detail = message.into();
        Self {
            kind: classify_transport_message(&detail),
            status: None,
            retry_after_seconds: None,
            detail,
        }
    }

    pub fn of_kind(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            retry_after_seconds: None,
            detail: detail.into(),
        }
    }

    /// True for an `invalid_request` whose details point at the model name.
    pub fn mentions_unknown_model(&self) -> bool {
        if self.kind != FailureKind::InvalidRequest {
            return false;
        }
        let detail = self.detail.to_lowercase();
        detail.contains("model")
            && ["not found", "does not exist", "unknown", "unsupported", "not supported", "invalid model"]
                .iter()
                .any(|phrase| detail.contains(phrase))
    }
}
