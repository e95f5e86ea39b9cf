use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use opsdeck_core::error::ApiError;
use opsdeck_core::model::{AgentPendingCommand, Decision, HandoffStatus, QaHandoff};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::error::{AppError, require};
use crate::extract::AppJson;
use crate::routes::agents::{Accepted, non_blank};
use crate::state::AppState;
use crate::store::{DecisionInput, HandoffDraft};

const QA_SOURCE: &str = "qa";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/qa/handoff", post(create_handoff))
        .route("/qa/handoff/decision", post(decide_handoff))
        .route("/qa/handoffs", get(list_handoffs))
        .route("/qa/handoff/{handoff_id}", get(get_handoff))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HandoffCreateRequest {
    /// Defaults to a fresh UUIDv7. Re-posting a known id refreshes it.
    pub handoff_id: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub pull_request_url: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HandoffDecisionRequest {
    pub handoff_id: Option<String>,
    pub approve: Option<bool>,
    pub decided_by: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HandoffListQuery {
    /// Only handoffs in this status
    pub status: Option<HandoffStatus>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HandoffListResponse {
    pub handoffs: Vec<QaHandoff>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HandoffDetail {
    pub handoff: QaHandoff,
    /// The synthesized approval command, unless it was evicted.
    pub command: Option<AgentPendingCommand>,
}

/// Open a QA handoff
///
/// Also creates the pending command `qa.approve <handoffId>` (risk medium)
/// so the handoff can be decided from the command queue.
#[utoipa::path(
    post,
    path = "/qa/handoff",
    request_body = HandoffCreateRequest,
    responses(
        (status = 202, description = "Handoff and command created", body = Accepted),
        (status = 400, description = "Missing title", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "qa"
)]
pub async fn create_handoff(
    State(state): State<AppState>,
    AppJson(req): AppJson<HandoffCreateRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let title = require(req.title, "title")?;
    let draft = HandoffDraft {
        handoff_id: non_blank(req.handoff_id),
        title,
        summary: non_blank(req.summary),
        session_id: non_blank(req.session_id),
        agent_id: non_blank(req.agent_id),
        repository: non_blank(req.repository),
        branch: non_blank(req.branch),
        pull_request_url: non_blank(req.pull_request_url),
    };
    let created = state.store.create_qa_handoff(draft, QA_SOURCE).await?;
    tracing::info!(
        handoff_id = %created.handoff.handoff_id,
        command_id = %created.command.command_id,
        "QA handoff opened"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: true,
            sequence: created.sequence,
            handoff_id: Some(created.handoff.handoff_id),
            command_id: Some(created.command.command_id),
            session_id: created.handoff.session_id,
            ..Accepted::default()
        }),
    ))
}

/// Approve or reject a QA handoff
///
/// The linked `qa.approve` command takes the matching status.
#[utoipa::path(
    post,
    path = "/qa/handoff/decision",
    request_body = HandoffDecisionRequest,
    responses(
        (status = 202, description = "Decision recorded", body = Accepted),
        (status = 400, description = "Missing handoffId or approve", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Unknown handoff", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "qa"
)]
pub async fn decide_handoff(
    State(state): State<AppState>,
    AppJson(req): AppJson<HandoffDecisionRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let handoff_id = require(req.handoff_id, "handoffId")?;
    let approve = req.approve.ok_or_else(|| AppError::missing_field("approve"))?;
    let input = DecisionInput {
        decided_by: non_blank(req.decided_by),
        note: non_blank(req.note),
    };
    let outcome = state
        .store
        .decide_qa_handoff(&handoff_id, Decision::from_approve(approve), &input, QA_SOURCE)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource: format!("QA handoff {handoff_id}"),
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: true,
            sequence: outcome.sequence,
            handoff_id: Some(outcome.handoff.handoff_id),
            command_id: outcome.command.map(|c| c.command_id),
            entry_id: Some(outcome.feed_entry.entry_id),
            ..Accepted::default()
        }),
    ))
}

/// List QA handoffs, newest first
#[utoipa::path(
    get,
    path = "/qa/handoffs",
    params(HandoffListQuery),
    responses(
        (status = 200, description = "Handoffs", body = HandoffListResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "qa"
)]
pub async fn list_handoffs(
    State(state): State<AppState>,
    Query(query): Query<HandoffListQuery>,
) -> Json<HandoffListResponse> {
    let mut handoffs: Vec<QaHandoff> = state
        .store
        .snapshot()
        .await
        .qa_handoffs
        .into_iter()
        .filter(|h| query.status.is_none_or(|status| h.status == status))
        .collect();
    handoffs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Json(HandoffListResponse { handoffs })
}

/// Get one QA handoff with its linked command
#[utoipa::path(
    get,
    path = "/qa/handoff/{handoff_id}",
    params(("handoff_id" = String, Path, description = "Handoff id")),
    responses(
        (status = 200, description = "Handoff", body = HandoffDetail),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Unknown handoff", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "qa"
)]
pub async fn get_handoff(
    State(state): State<AppState>,
    Path(handoff_id): Path<String>,
) -> Result<Json<HandoffDetail>, AppError> {
    let snapshot = state.store.snapshot().await;
    let handoff = snapshot
        .qa_handoff(&handoff_id)
        .cloned()
        .ok_or_else(|| AppError::NotFound {
            resource: format!("QA handoff {handoff_id}"),
        })?;
    let command = snapshot.pending_command(&handoff.linked_command_id).cloned();
    Ok(Json(HandoffDetail { handoff, command }))
}
