use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use opsdeck_core::error::ApiError;
use opsdeck_core::model::Snapshot;
use serde::Serialize;

use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/snapshot", get(get_snapshot))
        .route("/snapshot/update", post(replace_snapshot))
}

#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotReplaced {
    pub accepted: bool,
    pub sequence: u64,
}

/// Current authoritative snapshot
///
/// Bootstrap and resync source for viewers. `meta.sequence` is the sequence
/// of the last change included.
#[utoipa::path(
    get,
    path = "/snapshot",
    responses(
        (status = 200, description = "Current snapshot", body = Snapshot),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "snapshot"
)]
pub async fn get_snapshot(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.store.snapshot().await)
}

/// Replace the whole snapshot
///
/// The submitted `meta.sequence` is ignored; the server assigns the next
/// one and broadcasts a `snapshot` envelope.
#[utoipa::path(
    post,
    path = "/snapshot/update",
    request_body = Snapshot,
    responses(
        (status = 202, description = "Snapshot replaced", body = SnapshotReplaced),
        (status = 400, description = "Malformed snapshot", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "snapshot"
)]
pub async fn replace_snapshot(
    State(state): State<AppState>,
    AppJson(snapshot): AppJson<Snapshot>,
) -> Result<(StatusCode, Json<SnapshotReplaced>), AppError> {
    let source = snapshot.meta.source.clone();
    let envelope = state.store.replace_snapshot(snapshot, &source).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SnapshotReplaced {
            accepted: true,
            sequence: envelope.sequence,
        }),
    ))
}
