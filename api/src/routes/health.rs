use axum::extract::State;
use axum::{Json, Router, routing::get};
use opsdeck_core::cooldown::{Channel, CooldownSnapshot};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(health_check))
}

#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sequence: u64,
    pub subscribers: usize,
    pub published_envelopes: u64,
    pub dropped_subscribers: u64,
    pub config: ConfigEcho,
    pub channels: ChannelHealth,
}

/// Non-secret configuration, echoed for operators.
#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEcho {
    pub bind: String,
    pub auth_enabled: bool,
    pub heartbeat_seconds: u64,
    pub hard_cooldown_seconds: u64,
    pub soft_cooldown_seconds: u64,
    pub chat_model: String,
    pub speech_providers: Vec<String>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct ChannelHealth {
    pub chat: CooldownSnapshot,
    pub speech: CooldownSnapshot,
}

/// Liveness plus stream and upstream channel state. Never requires a token.
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = &state.config;
    let stats = state.store.broadcaster().stats();
    let speech_providers = [
        config.jarvis.speech_preferred.as_ref(),
        config.jarvis.speech_secondary.as_ref(),
    ]
    .into_iter()
    .flatten()
    .map(|p| p.name.clone())
    .collect();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sequence: state.store.sequence().await,
        subscribers: stats.subscribers,
        published_envelopes: stats.published,
        dropped_subscribers: stats.dropped_subscribers,
        config: ConfigEcho {
            bind: config.bind_addr().to_string(),
            auth_enabled: config.auth_enabled(),
            heartbeat_seconds: config.heartbeat_interval.as_secs(),
            hard_cooldown_seconds: config.cooldown.hard_cooldown_seconds,
            soft_cooldown_seconds: config.cooldown.soft_cooldown_seconds,
            chat_model: config.jarvis.chat.model.clone(),
            speech_providers,
        },
        channels: ChannelHealth {
            chat: state.jarvis.channel_status(Channel::Chat),
            speech: state.jarvis.channel_status(Channel::Speech),
        },
    })
}
