use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use opsdeck_core::error::ApiError;
use opsdeck_core::model::{
    AgentFeedEntry, AgentPendingCommand, AgentProfile, AgentSession, AgentStatus, AgentTransport,
    CommandRisk, CommandStatus, Decision, FeedLevel,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, require};
use crate::extract::AppJson;
use crate::state::AppState;
use crate::store::DecisionInput;

const OPERATOR_SOURCE: &str = "operator";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/agents/session", post(upsert_session))
        .route("/agents/feed", post(append_feed))
        .route("/agents/command", post(upsert_command))
        .route("/agents/dispatch", post(dispatch_agent))
        .route("/agents/message", post(post_message))
        .route("/agents/command/decision", post(decide_command))
        .route("/agents/stop", post(stop_agent))
}

/// Common 202 body for agent mutations. Only the ids relevant to the
/// endpoint are present.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub accepted: bool,
    /// Store sequence once the change was applied.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_id: Option<String>,
    /// Decision endpoints only: whether the command id was known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_found: Option<bool>,
}

fn accepted(sequence: u64) -> Accepted {
    Accepted {
        accepted: true,
        sequence,
        ..Accepted::default()
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpsertRequest {
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub transport: AgentTransport,
    #[serde(default)]
    pub summary: String,
    #[serde(flatten)]
    pub profile: AgentProfile,
    pub workspace: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub source: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeedAppendRequest {
    pub entry_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    #[serde(default)]
    pub level: FeedLevel,
    pub message: Option<String>,
    #[serde(flatten)]
    pub profile: AgentProfile,
    pub repository: Option<String>,
    pub workspace: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandUpsertRequest {
    pub command_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub command: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub risk: CommandRisk,
    #[serde(default)]
    pub status: CommandStatus,
    pub handoff_id: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub agent_id: Option<String>,
    /// Defaults to a fresh UUIDv7.
    pub session_id: Option<String>,
    pub task: Option<String>,
    #[serde(default)]
    pub transport: AgentTransport,
    #[serde(flatten)]
    pub profile: AgentProfile,
    pub workspace: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub message: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    #[serde(default)]
    pub level: FeedLevel,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandDecisionRequest {
    pub command_id: Option<String>,
    pub approve: Option<bool>,
    pub decided_by: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub session_id: Option<String>,
    pub reason: Option<String>,
}

fn source_or(source: Option<String>, default: &str) -> String {
    source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Insert or replace an agent session
#[utoipa::path(
    post,
    path = "/agents/session",
    request_body = SessionUpsertRequest,
    responses(
        (status = 202, description = "Session stored and broadcast", body = Accepted),
        (status = 400, description = "Missing sessionId, agentId or status", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn upsert_session(
    State(state): State<AppState>,
    AppJson(req): AppJson<SessionUpsertRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let session_id = require(req.session_id, "sessionId")?;
    let agent_id = require(req.agent_id, "agentId")?;
    let status = req.status.ok_or_else(|| AppError::missing_field("status"))?;
    let now = Utc::now();

    let session = AgentSession {
        session_id,
        agent_id,
        transport: req.transport,
        status,
        summary: req.summary,
        profile: req.profile,
        workspace: req.workspace,
        repository: req.repository,
        branch: req.branch,
        started_at: req.started_at.unwrap_or(now),
        last_heartbeat: req.last_heartbeat.unwrap_or(now),
        updated_at: now,
    };
    let source = source_or(req.source, "agent");
    let recorded = state.store.upsert_session(session, &source).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            session_id: Some(recorded.session.session_id),
            ..accepted(recorded.sequence)
        }),
    ))
}

/// Append a feed entry
#[utoipa::path(
    post,
    path = "/agents/feed",
    request_body = FeedAppendRequest,
    responses(
        (status = 202, description = "Entry appended and broadcast", body = Accepted),
        (status = 400, description = "Missing message", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn append_feed(
    State(state): State<AppState>,
    AppJson(req): AppJson<FeedAppendRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let message = require(req.message, "message")?;
    let entry = AgentFeedEntry {
        entry_id: non_blank(req.entry_id).unwrap_or_else(|| Uuid::now_v7().to_string()),
        session_id: non_blank(req.session_id),
        agent_id: non_blank(req.agent_id),
        level: req.level,
        message,
        profile: req.profile,
        repository: req.repository,
        workspace: req.workspace,
        occurred_at: req.occurred_at.unwrap_or_else(Utc::now),
    };
    let entry_id = entry.entry_id.clone();
    let source = source_or(req.source, "agent");
    let envelope = state.store.append_feed(entry, &source).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            entry_id: Some(entry_id),
            ..accepted(envelope.sequence)
        }),
    ))
}

/// Insert or replace a pending command
#[utoipa::path(
    post,
    path = "/agents/command",
    request_body = CommandUpsertRequest,
    responses(
        (status = 202, description = "Command stored and broadcast", body = Accepted),
        (status = 400, description = "Missing command", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn upsert_command(
    State(state): State<AppState>,
    AppJson(req): AppJson<CommandUpsertRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let command_text = require(req.command, "command")?;
    let now = Utc::now();
    let command = AgentPendingCommand {
        command_id: non_blank(req.command_id).unwrap_or_else(|| Uuid::now_v7().to_string()),
        session_id: non_blank(req.session_id),
        agent_id: non_blank(req.agent_id),
        command: command_text,
        summary: req.summary,
        risk: req.risk,
        status: req.status,
        created_at: now,
        updated_at: now,
        decided_at: None,
        decided_by: None,
        note: None,
        handoff_id: non_blank(req.handoff_id),
    };
    let command_id = command.command_id.clone();
    let source = source_or(req.source, "agent");
    let envelope = state.store.upsert_pending_command(command, &source).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            command_id: Some(command_id),
            ..accepted(envelope.sequence)
        }),
    ))
}

/// Dispatch an agent
///
/// Creates a session in `waiting` status and records the dispatch on the
/// feed.
#[utoipa::path(
    post,
    path = "/agents/dispatch",
    request_body = DispatchRequest,
    responses(
        (status = 202, description = "Session created", body = Accepted),
        (status = 400, description = "Missing agentId", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn dispatch_agent(
    State(state): State<AppState>,
    AppJson(req): AppJson<DispatchRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let agent_id = require(req.agent_id, "agentId")?;
    let task = non_blank(req.task);
    let now = Utc::now();
    let session = AgentSession {
        session_id: non_blank(req.session_id).unwrap_or_else(|| Uuid::now_v7().to_string()),
        agent_id,
        transport: req.transport,
        status: AgentStatus::Waiting,
        summary: task.clone().unwrap_or_default(),
        profile: req.profile,
        workspace: req.workspace,
        repository: req.repository,
        branch: req.branch,
        started_at: now,
        last_heartbeat: now,
        updated_at: now,
    };
    let dispatched = state
        .store
        .dispatch_agent(session, task.as_deref(), OPERATOR_SOURCE)
        .await?;
    let session = dispatched.session;
    tracing::info!(session_id = %session.session_id, agent_id = %session.agent_id, "agent dispatched");

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            session_id: Some(session.session_id),
            entry_id: Some(dispatched.feed_entry.entry_id),
            ..accepted(dispatched.sequence)
        }),
    ))
}

/// Post a message to the feed
#[utoipa::path(
    post,
    path = "/agents/message",
    request_body = MessageRequest,
    responses(
        (status = 202, description = "Message appended", body = Accepted),
        (status = 400, description = "Missing message", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn post_message(
    State(state): State<AppState>,
    AppJson(req): AppJson<MessageRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let message = require(req.message, "message")?;
    let mut entry = AgentFeedEntry::new(req.level, message);
    entry.session_id = non_blank(req.session_id);
    entry.agent_id = non_blank(req.agent_id);
    let posted = state.store.post_message(entry, OPERATOR_SOURCE).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            session_id: posted.entry.session_id,
            entry_id: Some(posted.entry.entry_id),
            ..accepted(posted.sequence)
        }),
    ))
}

/// Approve or reject a pending command
///
/// Always accepted: an unknown command id still records the decision on the
/// feed (`commandFound: false`). Deciding a command synthesized for a QA
/// handoff also decides the handoff.
#[utoipa::path(
    post,
    path = "/agents/command/decision",
    request_body = CommandDecisionRequest,
    responses(
        (status = 202, description = "Decision recorded", body = Accepted),
        (status = 400, description = "Missing commandId or approve", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn decide_command(
    State(state): State<AppState>,
    AppJson(req): AppJson<CommandDecisionRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let command_id = require(req.command_id, "commandId")?;
    let approve = req.approve.ok_or_else(|| AppError::missing_field("approve"))?;
    let input = DecisionInput {
        decided_by: non_blank(req.decided_by),
        note: non_blank(req.note),
    };
    let outcome = state
        .store
        .decide_command(&command_id, Decision::from_approve(approve), &input, OPERATOR_SOURCE)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            command_id: Some(command_id),
            entry_id: Some(outcome.feed_entry.entry_id),
            handoff_id: outcome.handoff.map(|h| h.handoff_id),
            command_found: Some(outcome.command.is_some()),
            ..accepted(outcome.sequence)
        }),
    ))
}

/// Stop an agent session
///
/// Marks the session `offline` and records the stop on the feed.
#[utoipa::path(
    post,
    path = "/agents/stop",
    request_body = StopRequest,
    responses(
        (status = 202, description = "Session stopped", body = Accepted),
        (status = 400, description = "Missing sessionId", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Unknown session", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn stop_agent(
    State(state): State<AppState>,
    AppJson(req): AppJson<StopRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let session_id = require(req.session_id, "sessionId")?;
    let reason = non_blank(req.reason);
    let stopped = state
        .store
        .stop_session(&session_id, reason.as_deref(), OPERATOR_SOURCE)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource: format!("session {session_id}"),
        })?;
    tracing::info!(session_id = %stopped.session.session_id, "agent stopped");

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            session_id: Some(stopped.session.session_id),
            entry_id: Some(stopped.feed_entry.entry_id),
            ..accepted(stopped.sequence)
        }),
    ))
}
