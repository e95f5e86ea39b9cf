use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::Router;
use futures::{Stream, StreamExt};
use opsdeck_core::error::ApiError;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/events", get(stream_events))
}

/// Push stream of sequenced envelopes
///
/// The first event is always a `snapshot` envelope at the current sequence,
/// followed by every change in sequence order and periodic `heartbeat`
/// envelopes. Each frame carries `id: <sequence>`, `event: <eventType>` and
/// the envelope JSON as `data`. A subscriber that falls too far behind is
/// disconnected and should reconnect.
#[utoipa::path(
    get,
    path = "/events",
    responses(
        (status = 200, description = "text/event-stream of StreamEnvelope frames", content_type = "text/event-stream"),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    params(
        ("access_token" = Option<String>, Query, description = "Alternative to the Authorization header for EventSource clients")
    ),
    security(("bearer_auth" = [])),
    tag = "events"
)]
pub async fn stream_events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let subscription = state.store.subscribe().await?;
    tracing::info!(
        subscriber_id = %subscription.id(),
        subscribers = state.store.subscriber_count(),
        "stream subscriber connected"
    );

    let stream = subscription.map(|prepared| {
        Ok(Event::default()
            .id(prepared.id.as_str())
            .event(prepared.event_type.as_str())
            .data(prepared.data.as_str()))
    });
    Ok(Sse::new(stream))
}
