use axum::http::Uri;
use axum::routing::get;
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::auth::BearerAuthLayer;
use crate::error::AppError;
use crate::middleware;
use crate::routes;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Opsdeck API",
        version = "0.1.0",
        description = "Sync core of the ops dashboard: authoritative snapshot, sequenced push stream, agent and QA mutations, resilient assistant calls."
    ),
    paths(
        routes::health::health_check,
        routes::snapshot::get_snapshot,
        routes::snapshot::replace_snapshot,
        routes::events::stream_events,
        routes::agents::upsert_session,
        routes::agents::append_feed,
        routes::agents::upsert_command,
        routes::agents::dispatch_agent,
        routes::agents::post_message,
        routes::agents::decide_command,
        routes::agents::stop_agent,
        routes::qa::create_handoff,
        routes::qa::decide_handoff,
        routes::qa::list_handoffs,
        routes::qa::get_handoff,
        routes::jarvis::respond,
        routes::jarvis::speak,
    ),
    components(schemas(
        opsdeck_core::error::ApiError,
        opsdeck_core::model::Snapshot,
        opsdeck_core::model::SnapshotMeta,
        opsdeck_core::model::AgentSession,
        opsdeck_core::model::AgentFeedEntry,
        opsdeck_core::model::AgentPendingCommand,
        opsdeck_core::model::QaHandoff,
        opsdeck_core::envelope::StreamEnvelope,
        opsdeck_core::envelope::EventType,
        opsdeck_core::envelope::Heartbeat,
        opsdeck_core::cooldown::CooldownSnapshot,
        opsdeck_core::failure::FailureKind,
        routes::health::HealthResponse,
        routes::health::ConfigEcho,
        routes::health::ChannelHealth,
        routes::snapshot::SnapshotReplaced,
        routes::agents::Accepted,
        routes::agents::SessionUpsertRequest,
        routes::agents::FeedAppendRequest,
        routes::agents::CommandUpsertRequest,
        routes::agents::DispatchRequest,
        routes::agents::MessageRequest,
        routes::agents::CommandDecisionRequest,
        routes::agents::StopRequest,
        routes::qa::HandoffCreateRequest,
        routes::qa::HandoffDecisionRequest,
        routes::qa::HandoffListResponse,
        routes::qa::HandoffDetail,
        routes::jarvis::RespondRequest,
        routes::jarvis::RespondResponse,
        routes::jarvis::SpeakRequest,
        routes::jarvis::SpeakResponse,
    )),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound {
        resource: format!("route {}", uri.path()),
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors_layer = middleware::cors::build_cors_layer(&state.config.cors_origins);
    let auth_layer = BearerAuthLayer::new(state.config.token_hash.clone());

    Router::new()
        .route("/openapi.json", get(openapi_json))
        .merge(routes::health::router())
        .merge(routes::snapshot::router())
        .merge(routes::events::router())
        .merge(routes::agents::router())
        .merge(routes::qa::router())
        .merge(routes::jarvis::router())
        .fallback(not_found)
        .layer(auth_layer)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use futures::StreamExt;
    use opsdeck_core::envelope::{EnvelopePayload, EventType};
    use opsdeck_core::failure::UpstreamFailure;
    use opsdeck_core::model::{AgentStatus, Snapshot};
    use opsdeck_core::sse::{SseDecoder, parse_envelope};
    use tower::ServiceExt;

    use super::*;
    use crate::broadcast::{EventBroadcaster, SUBSCRIBER_BUFFER};
    use crate::config::{ServerConfig, SpeechProviderConfig};
    use crate::orchestrator::RequestOrchestrator;
    use crate::store::SnapshotStore;
    use crate::upstream::{ChatRequest, Upstream};

    struct OfflineUpstream;

    #[async_trait]
    impl Upstream for OfflineUpstream {
        async fn complete_chat(&self, _request: &ChatRequest) -> Result<String, UpstreamFailure> {
            Err(UpstreamFailure::transport("error trying to connect: connection refused"))
        }

        async fn synthesize_speech(
            &self,
            _provider: &SpeechProviderConfig,
            _text: &str,
        ) -> Result<Vec<u8>, UpstreamFailure> {
            Err(UpstreamFailure::transport("error trying to connect: connection refused"))
        }
    }

    fn state_with(token: Option<&str>) -> AppState {
        let token = token.map(str::to_string);
        let config = ServerConfig::from_lookup(|key| match key {
            "OPSDECK_TOKEN" => token.clone(),
            _ => None,
        });
        let jarvis = RequestOrchestrator::new(
            Arc::new(OfflineUpstream),
            config.jarvis.clone(),
            config.cooldown,
        );
        AppState {
            store: Arc::new(SnapshotStore::new(EventBroadcaster::new(SUBSCRIBER_BUFFER))),
            jarvis: Arc::new(jarvis),
            config: Arc::new(config),
        }
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request builds")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request builds")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body reads");
        serde_json::from_slice(&bytes).expect("body is json")
    }

    #[tokio::test]
    async fn dispatch_is_visible_in_snapshot_and_stream() {
        let state = state_with(None);
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(post("/agents/dispatch", serde_json::json!({"agentId": "Codex"})))
            .await
            .expect("dispatch responds");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["accepted"], true);
        let session_id = body["sessionId"].as_str().expect("sessionId").to_string();

        let response = app.clone().oneshot(get("/snapshot")).await.expect("snapshot responds");
        assert_eq!(response.status(), StatusCode::OK);
        let snapshot: Snapshot =
            serde_json::from_value(json_body(response).await).expect("snapshot json");
        let session = snapshot.session(&session_id).expect("session present");
        assert_eq!(session.status, AgentStatus::Waiting);
        assert_eq!(session.agent_id, "Codex");

        let response = app.oneshot(get("/events")).await.expect("events responds");
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body().into_data_stream();
        let mut decoder = SseDecoder::new();
        let frame = loop {
            let chunk = body.next().await.expect("stream open").expect("chunk reads");
            if let Some(frame) = decoder.push(&chunk).into_iter().next() {
                break frame;
            }
        };
        assert_eq!(frame.event.as_deref(), Some("snapshot"));
        let envelope = parse_envelope(&frame).expect("envelope parses");
        assert_eq!(envelope.event_type, EventType::Snapshot);
        assert_eq!(frame.id.as_deref(), Some(envelope.sequence.to_string().as_str()));
        match envelope.decode().expect("payload decodes") {
            EnvelopePayload::Snapshot(snapshot) => {
                assert!(snapshot.session(&session_id).is_some());
            }
            other => panic!("expected snapshot payload, got {:?}", other.event_type()),
        }
    }

    #[tokio::test]
    async fn missing_field_is_rejected_without_mutation() {
        let state = state_with(None);
        let app = build_router(state.clone());
        let response = app
            .oneshot(post("/agents/dispatch", serde_json::json!({"task": "fix CI"})))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "validation_failed");
        assert_eq!(body["field"], "agentId");
        assert_eq!(state.store.sequence().await, 0);
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let app = build_router(state_with(None));
        let request = Request::builder()
            .method("POST")
            .uri("/agents/feed")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .expect("request builds");
        let response = app.oneshot(request).await.expect("responds");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = build_router(state_with(None));
        let response = app.oneshot(get("/nope")).await.expect("responds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn token_gate_protects_everything_but_health() {
        let app = build_router(state_with(Some("s3cret")));

        let response = app.clone().oneshot(get("/snapshot")).await.expect("responds");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "unauthorized");

        let response = app.clone().oneshot(get("/healthz")).await.expect("responds");
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri("/snapshot")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .expect("request builds");
        let response = app.oneshot(request).await.expect("responds");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn repeated_decision_is_accepted_twice() {
        let app = build_router(state_with(None));
        let response = app
            .clone()
            .oneshot(post("/qa/handoff", serde_json::json!({"handoffId": "H", "title": "Release"})))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let command_id = json_body(response).await["commandId"]
            .as_str()
            .expect("commandId")
            .to_string();

        for approve in [true, false] {
            let response = app
                .clone()
                .oneshot(post(
                    "/agents/command/decision",
                    serde_json::json!({"commandId": command_id, "approve": approve}),
                ))
                .await
                .expect("responds");
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            let body = json_body(response).await;
            assert_eq!(body["commandFound"], true);
            assert_eq!(body["handoffId"], "H");
        }

        let response = app.oneshot(get("/qa/handoff/H")).await.expect("responds");
        let detail = json_body(response).await;
        assert_eq!(detail["handoff"]["status"], "rejected");
        assert_eq!(detail["command"]["status"], "rejected");
    }

    #[tokio::test]
    async fn stop_unknown_session_is_not_found() {
        let app = build_router(state_with(None));
        let response = app
            .oneshot(post("/agents/stop", serde_json::json!({"sessionId": "ghost"})))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn jarvis_falls_back_when_upstream_is_down() {
        let state = state_with(None);
        let app = build_router(state.clone());
        let response = app
            .oneshot(post("/jarvis/respond", serde_json::json!({"prompt": "status?"})))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["origin"], "fallback");
        assert_eq!(body["failureKind"], "network");
        assert_eq!(body["channel"]["degraded"], true);

        let snapshot = state.store.snapshot().await;
        let session = snapshot.session("jarvis").expect("jarvis session recorded");
        assert_eq!(session.status, AgentStatus::Error);
        assert!(snapshot.feed.iter().any(|e| e.message.contains("local state")));
    }

    #[tokio::test]
    async fn unknown_command_decision_is_recorded_each_time() {
        let state = state_with(None);
        let app = build_router(state.clone());
        let feed_before = state.store.snapshot().await.feed.len();

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post(
                    "/agents/command/decision",
                    serde_json::json!({"commandId": "X", "approve": false}),
                ))
                .await
                .expect("responds");
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            let body = json_body(response).await;
            assert_eq!(body["commandFound"], false);
            assert_eq!(body["commandId"], "X");
            assert_eq!(body["sequence"], state.store.sequence().await);
        }

        let snapshot = state.store.snapshot().await;
        assert_eq!(snapshot.feed.len(), feed_before + 2);
        assert!(snapshot.pending_commands.is_empty());
    }

    #[tokio::test]
    async fn jarvis_reply_does_not_take_over_agent_session() {
        let state = state_with(None);
        let app = build_router(state.clone());
        let response = app
            .clone()
            .oneshot(post(
                "/agents/dispatch",
                serde_json::json!({"agentId": "Codex", "sessionId": "S1", "repository": "acme/api"}),
            ))
            .await
            .expect("dispatch responds");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        // Session then feed line.
        assert_eq!(json_body(response).await["sequence"], 2);

        let response = app
            .oneshot(post(
                "/jarvis/respond",
                serde_json::json!({"prompt": "status?", "sessionId": "S1"}),
            ))
            .await
            .expect("respond responds");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let snapshot = state.store.snapshot().await;
        let session = snapshot.session("S1").expect("session kept");
        assert_eq!(session.agent_id, "Codex");
        assert_eq!(session.repository.as_deref(), Some("acme/api"));
        assert_eq!(session.transport, opsdeck_core::model::AgentTransport::Unknown);
        assert_eq!(session.status, AgentStatus::Error);
        assert!(snapshot.session("jarvis").is_none());
    }

    #[tokio::test]
    async fn openapi_document_is_public() {
        let app = build_router(state_with(Some("s3cret")));
        let response = app.oneshot(get("/openapi.json")).await.expect("responds");
        assert_eq!(response.status(), StatusCode::OK);
        let doc = json_body(response).await;
        assert!(doc["paths"]["/agents/dispatch"].is_object());
    }
}
