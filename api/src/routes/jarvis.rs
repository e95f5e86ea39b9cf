use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use opsdeck_core::cooldown::CooldownSnapshot;
use opsdeck_core::envelope::EnvelopePayload;
use opsdeck_core::error::ApiError;
use opsdeck_core::failure::FailureKind;
use opsdeck_core::model::{
    AgentFeedEntry, AgentProfile, AgentSession, AgentStatus, AgentTransport, FeedLevel,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, require};
use crate::extract::AppJson;
use crate::orchestrator::ReplyOrigin;
use crate::state::AppState;
use crate::upstream::truncate;

const JARVIS_SOURCE: &str = "jarvis";
const JARVIS_AGENT_ID: &str = "jarvis";
const SUMMARY_CHARS: usize = 160;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jarvis/respond", post(respond))
        .route("/jarvis/speak", post(speak))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RespondRequest {
    pub prompt: Option<String>,
    /// Session the reply is recorded under (default `jarvis`).
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RespondResponse {
    pub accepted: bool,
    pub session_id: String,
    pub entry_id: String,
    pub reply: String,
    pub origin: ReplyOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    pub channel: CooldownSnapshot,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpeakRequest {
    pub text: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpeakResponse {
    pub accepted: bool,
    pub entry_id: String,
    /// Base64 MP3, absent when no provider produced audio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    pub channel: CooldownSnapshot,
}

fn session_id_or_default(session_id: Option<String>) -> String {
    session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| JARVIS_AGENT_ID.to_string())
}

/// The session a reply is recorded under. A session owned by another agent
/// keeps its identity and placement; only its status and summary move.
fn reply_session(
    existing: Option<AgentSession>,
    session_id: String,
    status: AgentStatus,
    summary: String,
    model: Option<String>,
) -> AgentSession {
    match existing {
        Some(mut session) if session.agent_id != JARVIS_AGENT_ID => {
            let now = Utc::now();
            session.status = status;
            session.summary = summary;
            session.last_heartbeat = now;
            session.updated_at = now;
            session
        }
        _ => jarvis_session(session_id, status, summary, model),
    }
}

fn jarvis_session(session_id: String, status: AgentStatus, summary: String, model: Option<String>) -> AgentSession {
    let now = Utc::now();
    AgentSession {
        session_id,
        agent_id: JARVIS_AGENT_ID.to_string(),
        transport: AgentTransport::Local,
        status,
        summary,
        profile: AgentProfile {
            service: Some("jarvis".to_string()),
            model,
            ..AgentProfile::default()
        },
        workspace: None,
        repository: None,
        branch: None,
        started_at: now,
        last_heartbeat: now,
        updated_at: now,
    }
}

/// Ask the assistant
///
/// Never fails on upstream trouble: a degraded chat channel yields a reply
/// computed from snapshot counts (`origin: fallback`). The reply is recorded
/// as a session update plus feed entry.
#[utoipa::path(
    post,
    path = "/jarvis/respond",
    request_body = RespondRequest,
    responses(
        (status = 202, description = "Reply produced and recorded", body = RespondResponse),
        (status = 400, description = "Missing prompt", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "jarvis"
)]
pub async fn respond(
    State(state): State<AppState>,
    AppJson(req): AppJson<RespondRequest>,
) -> Result<(StatusCode, Json<RespondResponse>), AppError> {
    let prompt = require(req.prompt, "prompt")?;
    let session_id = session_id_or_default(req.session_id);
    let snapshot = state.store.snapshot().await;
    let reply = state.jarvis.respond(&prompt, &snapshot).await;

    let (status, level) = match reply.origin {
        ReplyOrigin::Upstream => (AgentStatus::Online, FeedLevel::Info),
        ReplyOrigin::Fallback => (AgentStatus::Error, FeedLevel::Warn),
    };
    let session = reply_session(
        state.store.session(&session_id).await,
        session_id.clone(),
        status,
        truncate(&reply.text, SUMMARY_CHARS),
        reply.model.clone(),
    );

    let mut changes = vec![EnvelopePayload::Session(session.clone())];
    if let Some(notice) = &reply.notice {
        changes.push(EnvelopePayload::Feed(
            AgentFeedEntry::new(FeedLevel::Warn, notice.clone()).for_session(&session),
        ));
    }
    let entry = AgentFeedEntry::new(level, reply.text.clone()).for_session(&session);
    let entry_id = entry.entry_id.clone();
    changes.push(EnvelopePayload::Feed(entry));
    state.store.record(changes, JARVIS_SOURCE).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RespondResponse {
            accepted: true,
            session_id,
            entry_id,
            reply: reply.text,
            origin: reply.origin,
            model: reply.model,
            failure_kind: reply.failure_kind,
            notice: reply.notice,
            channel: reply.channel,
        }),
    ))
}

/// Synthesize speech
///
/// Tries the preferred provider, then the secondary when allowed. Missing
/// audio is reported in the body, not as an error status.
#[utoipa::path(
    post,
    path = "/jarvis/speak",
    request_body = SpeakRequest,
    responses(
        (status = 202, description = "Speech attempt recorded", body = SpeakResponse),
        (status = 400, description = "Missing text", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "jarvis"
)]
pub async fn speak(
    State(state): State<AppState>,
    AppJson(req): AppJson<SpeakRequest>,
) -> Result<(StatusCode, Json<SpeakResponse>), AppError> {
    let text = require(req.text, "text")?;
    let session_id = session_id_or_default(req.session_id);
    let outcome = state.jarvis.speak(&text).await;

    let (message, level) = match (&outcome.provider, outcome.failure_kind) {
        (Some(provider), _) => (
            format!("Spoke {} characters via {provider}", text.chars().count()),
            FeedLevel::Info,
        ),
        (None, Some(kind)) => (format!("Speech unavailable ({kind})"), FeedLevel::Warn),
        (None, None) => ("Speech unavailable".to_string(), FeedLevel::Warn),
    };
    let mut entry = AgentFeedEntry::new(level, message);
    entry.session_id = Some(session_id);
    entry.agent_id = Some(JARVIS_AGENT_ID.to_string());
    let entry_id = entry.entry_id.clone();

    let mut changes = Vec::new();
    if let Some(notice) = &outcome.notice {
        let mut notice_entry = AgentFeedEntry::new(FeedLevel::Warn, notice.clone());
        notice_entry.session_id = entry.session_id.clone();
        notice_entry.agent_id = entry.agent_id.clone();
        changes.push(EnvelopePayload::Feed(notice_entry));
    }
    changes.push(EnvelopePayload::Feed(entry));
    state.store.record(changes, JARVIS_SOURCE).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SpeakResponse {
            accepted: true,
            entry_id,
            audio_base64: outcome.audio.map(|audio| STANDARD.encode(audio)),
            mime_type: "audio/mpeg".to_string(),
            provider: outcome.provider,
            failure_kind: outcome.failure_kind,
            notice: outcome.notice,
            channel: outcome.channel,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_keeps_foreign_session_identity() {
        let mut codex = jarvis_session("S1".to_string(), AgentStatus::Busy, String::new(), None);
        codex.agent_id = "codex".to_string();
        codex.transport = AgentTransport::Cli;
        codex.repository = Some("acme/api".to_string());

        let updated = reply_session(
            Some(codex.clone()),
            "S1".to_string(),
            AgentStatus::Error,
            "fallback".to_string(),
            Some("gpt-5".to_string()),
        );
        assert_eq!(updated.agent_id, "codex");
        assert_eq!(updated.transport, AgentTransport::Cli);
        assert_eq!(updated.repository.as_deref(), Some("acme/api"));
        assert_eq!(updated.profile, codex.profile);
        assert_eq!(updated.status, AgentStatus::Error);
        assert_eq!(updated.summary, "fallback");

        let own = reply_session(None, "S2".to_string(), AgentStatus::Online, "hi".to_string(), None);
        assert_eq!(own.agent_id, JARVIS_AGENT_ID);
    }

    #[test]
    fn summary_truncates_long_replies() {
        let long = "x".repeat(SUMMARY_CHARS + 10);
        let summary = truncate(&long, SUMMARY_CHARS);
        assert_eq!(summary.chars().count(), SUMMARY_CHARS + 3);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn blank_session_id_falls_back_to_jarvis() {
        assert_eq!(session_id_or_default(Some("  ".to_string())), "jarvis");
        assert_eq!(session_id_or_default(Some("ops-1".to_string())), "ops-1");
    }
}
