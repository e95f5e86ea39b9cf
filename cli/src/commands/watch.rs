use std::time::Duration;

use opsdeck_core::model::{AgentStatus, CommandStatus, HandoffStatus, Snapshot};
use opsdeck_core::reconcile::{ReconcileOutcome, Reconciler};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::stream::{StreamConsumer, StreamEvent};
use crate::util::{client, fetch_json};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Reconnect delay: 1s doubling to 30s, back to 1s once a connection holds.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}

/// One line per change: the counts an operator watches for.
fn summary(snapshot: &Snapshot, outcome: &ReconcileOutcome) -> serde_json::Value {
    let active_sessions = snapshot
        .sessions
        .iter()
        .filter(|s| s.status != AgentStatus::Offline)
        .count();
    let pending_commands = snapshot
        .pending_commands
        .iter()
        .filter(|c| c.status == CommandStatus::Pending)
        .count();
    let open_handoffs = snapshot
        .qa_handoffs
        .iter()
        .filter(|h| h.status == HandoffStatus::Pending)
        .count();
    let (change, sequence) = match outcome {
        ReconcileOutcome::Replaced { sequence } => ("snapshot".to_string(), *sequence),
        ReconcileOutcome::Applied {
            sequence,
            event_type,
        } => (event_type.to_string(), *sequence),
        _ => ("resync".to_string(), snapshot.meta.sequence),
    };
    json!({
        "sequence": sequence,
        "change": change,
        "sessions": snapshot.sessions.len(),
        "activeSessions": active_sessions,
        "pendingCommands": pending_commands,
        "openHandoffs": open_handoffs,
        "feedEntries": snapshot.feed.len(),
        "latestFeed": snapshot.feed.last().map(|e| e.message.as_str()),
    })
}

fn print_line(value: &serde_json::Value) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::warn!(error = %err, "could not render update"),
    }
}

/// Sleep unless shutdown comes first. Returns false on shutdown.
async fn pause(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Follow the live stream, printing a summary per applied change.
///
/// Bootstraps from `GET /snapshot`, refetches it whenever the reconciler
/// reports a gap, and reconnects with backoff until Ctrl-C.
pub async fn run(api_url: &str, token: Option<&str>, envelopes: bool) -> i32 {
    let http = client();
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let events_url = format!("{api_url}/events");
    let mut reconciler = Reconciler::new();
    let mut backoff = Backoff::new();

    'session: loop {
        if reconciler.snapshot().is_none() {
            match fetch_json::<Snapshot>(&http, api_url, "/snapshot", token).await {
                Ok(snapshot) => {
                    tracing::info!(sequence = snapshot.meta.sequence, "snapshot loaded");
                    reconciler.reset(snapshot);
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "snapshot fetch failed");
                    if !pause(delay, &shutdown).await {
                        break 'session;
                    }
                    continue 'session;
                }
            }
        }

        let mut consumer =
            StreamConsumer::open(http.clone(), events_url.clone(), token.map(str::to_string));
        let reason = loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => None,
                event = consumer.next_event() => Some(event),
            };
            let Some(event) = event else {
                consumer.close().await;
                break 'session;
            };
            let envelope = match event {
                Some(StreamEvent::Connected) => {
                    backoff.reset();
                    reconciler.mark_connected(true);
                    tracing::info!(url = %events_url, "stream connected");
                    continue;
                }
                Some(StreamEvent::Envelope(envelope)) => envelope,
                Some(StreamEvent::ParseError(err)) => {
                    tracing::warn!(error = %err, "skipping unreadable frame");
                    continue;
                }
                Some(StreamEvent::Disconnected { reason }) => break reason,
                None => break "stream ended".to_string(),
            };

            if envelopes {
                match serde_json::to_value(&envelope) {
                    Ok(value) => print_line(&value),
                    Err(err) => tracing::warn!(error = %err, "could not render envelope"),
                }
            }

            match reconciler.apply(&envelope) {
                Ok(ReconcileOutcome::ResyncRequired(why)) => {
                    tracing::warn!(sequence = envelope.sequence, reason = ?why, "resyncing from snapshot");
                    match fetch_json::<Snapshot>(&http, api_url, "/snapshot", token).await {
                        Ok(snapshot) => {
                            reconciler.reset(snapshot);
                            reconciler.mark_connected(true);
                        }
                        Err(err) => break format!("resync failed: {err}"),
                    }
                    if let (false, Some(snapshot)) = (envelopes, reconciler.snapshot()) {
                        print_line(&summary(snapshot, &ReconcileOutcome::ResyncRequired(why)));
                    }
                }
                Ok(outcome @ (ReconcileOutcome::Replaced { .. } | ReconcileOutcome::Applied { .. })) => {
                    if let (false, Some(snapshot)) = (envelopes, reconciler.snapshot()) {
                        print_line(&summary(snapshot, &outcome));
                    }
                }
                Ok(ReconcileOutcome::Stale {
                    sequence,
                    last_applied,
                }) => tracing::debug!(sequence, last_applied, "stale envelope ignored"),
                Ok(ReconcileOutcome::Heartbeat { sequence }) => {
                    tracing::debug!(sequence, "heartbeat")
                }
                Err(err) => tracing::warn!(error = %err, "envelope not applied"),
            }
        };

        consumer.close().await;
        reconciler.mark_connected(false);
        let delay = backoff.next_delay();
        tracing::warn!(%reason, delay_ms = delay.as_millis() as u64, "stream disconnected; reconnecting");
        if !pause(delay, &shutdown).await {
            break 'session;
        }
    }

    tracing::info!(
        last_sequence = reconciler.last_sequence(),
        "watch stopped"
    );
    0
}
