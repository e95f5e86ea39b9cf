//! Client-side application of stream envelopes to a locally held snapshot.
//!
//! The reconciler is single-writer: callers hold it behind whatever exclusive
//! access their runtime provides and feed envelopes in arrival order. It never
//! refetches; when it cannot safely apply an envelope it says so and leaves the
//! local copy untouched so the owner can resync from `GET /snapshot`.

use crate::envelope::{EnvelopePayload, EventType, StreamEnvelope};
use crate::model::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// No base snapshot held yet; deltas have nothing to apply to.
    NoBaseSnapshot,
    /// Envelopes between `last_applied` and `received` were never seen.
    SequenceGap { last_applied: u64, received: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A `snapshot` envelope replaced the local copy.
    Replaced { sequence: u64 },
    /// A keyed upsert landed in one collection.
    Applied { sequence: u64, event_type: EventType },
    /// Heartbeat consistent with what has been applied.
    Heartbeat { sequence: u64 },
    /// Older than the last applied envelope; ignored.
    Stale { sequence: u64, last_applied: u64 },
    /// Nothing applied; refetch the full snapshot and [`Reconciler::reset`].
    ResyncRequired(ResyncReason),
}

#[derive(Debug, thiserror::Error)]
#[error("envelope {sequence} payload does not decode as {event_type}: {source}")]
pub struct ReconcileError {
    pub sequence: u64,
    pub event_type: EventType,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    snapshot: Option<Snapshot>,
    last_sequence: Option<u64>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let mut reconciler = Self::new();
        reconciler.reset(snapshot);
        reconciler
    }

    /// Install a freshly fetched snapshot as the new base.
    pub fn reset(&mut self, snapshot: Snapshot) {
        self.last_sequence = Some(snapshot.meta.sequence);
        self.snapshot = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Reflect stream health on the local copy.
    pub fn mark_connected(&mut self, connected: bool) {
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.meta.stream_connected = connected;
            snapshot.meta.stale = !connected;
        }
    }

    pub fn apply(&mut self, envelope: &StreamEnvelope) -> Result<ReconcileOutcome, ReconcileError> {
        let payload = envelope.decode().map_err(|source| ReconcileError {
            sequence: envelope.sequence,
            event_type: envelope.event_type,
            source,
        })?;

        if let EnvelopePayload::Snapshot(snapshot) = payload {
            let mut snapshot = *snapshot;
            let connected = self
                .snapshot
                .as_ref()
                .map(|s| s.meta.stream_connected)
                .unwrap_or(false);
            snapshot.meta.sequence = envelope.sequence;
            snapshot.meta.stream_connected = connected;
            snapshot.meta.stale = !connected;
            self.reset(snapshot);
            return Ok(ReconcileOutcome::Replaced {
                sequence: envelope.sequence,
            });
        }

        let (Some(snapshot), Some(last)) = (self.snapshot.as_mut(), self.last_sequence) else {
            return Ok(ReconcileOutcome::ResyncRequired(ResyncReason::NoBaseSnapshot));
        };

        if let EnvelopePayload::Heartbeat(_) = payload {
            // Heartbeats carry the server's current sequence without advancing it.
            if envelope.sequence > last {
                return Ok(ReconcileOutcome::ResyncRequired(ResyncReason::SequenceGap {
                    last_applied: last,
                    received: envelope.sequence,
                }));
            }
            return Ok(ReconcileOutcome::Heartbeat {
                sequence: envelope.sequence,
            });
        }

        if envelope.sequence < last {
            return Ok(ReconcileOutcome::Stale {
                sequence: envelope.sequence,
                last_applied: last,
            });
        }
        if envelope.sequence > last + 1 {
            return Ok(ReconcileOutcome::ResyncRequired(ResyncReason::SequenceGap {
                last_applied: last,
                received: envelope.sequence,
            }));
        }

        match payload {
            EnvelopePayload::Session(session) => {
                snapshot.upsert_session(session);
            }
            EnvelopePayload::Feed(entry) => snapshot.append_feed(entry),
            EnvelopePayload::Command(command) => snapshot.upsert_pending_command(command),
            EnvelopePayload::Handoff(handoff) => snapshot.upsert_qa_handoff(handoff),
            EnvelopePayload::Snapshot(_) | EnvelopePayload::Heartbeat(_) => {}
        }
        snapshot.meta.sequence = envelope.sequence;
        snapshot.meta.generated_at = envelope.occurred_at;
        self.last_sequence = Some(envelope.sequence);

        Ok(ReconcileOutcome::Applied {
            sequence: envelope.sequence,
            event_type: envelope.event_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::envelope::Heartbeat;
    use crate::model::fixtures::{command, feed, session};
    use crate::model::{AgentStatus, CommandStatus};

    fn envelope(sequence: u64, payload: EnvelopePayload) -> StreamEnvelope {
        StreamEnvelope::new(sequence, "test", &payload).expect("envelope builds")
    }

    fn base(sequence: u64) -> Snapshot {
        let mut snapshot = Snapshot::empty("server");
        snapshot.meta.sequence = sequence;
        snapshot
    }

    #[test]
    fn applying_same_session_envelope_twice_is_idempotent() {
        let mut reconciler = Reconciler::with_snapshot(base(10));
        let env = envelope(11, EnvelopePayload::Session(session("s1", AgentStatus::Busy, 0)));

        reconciler.apply(&env).expect("applies");
        let once = reconciler.snapshot().expect("snapshot held").sessions.clone();
        reconciler.apply(&env).expect("applies again");
        let twice = reconciler.snapshot().expect("snapshot held").sessions.clone();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
        assert_eq!(reconciler.last_sequence(), Some(11));
    }

    #[test]
    fn delta_touches_only_its_collection() {
        let mut initial = base(1);
        initial.append_feed(feed("f1"));
        initial.board.push(serde_json::json!({"id": "card-1"}));
        let mut reconciler = Reconciler::with_snapshot(initial.clone());

        let outcome = reconciler
            .apply(&envelope(2, EnvelopePayload::Command(command("c1", 0))))
            .expect("applies");
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                sequence: 2,
                event_type: EventType::CommandUpserted
            }
        );
        let local = reconciler.snapshot().expect("snapshot held");
        assert_eq!(local.feed, initial.feed);
        assert_eq!(local.board, initial.board);
        assert_eq!(local.pending_commands.len(), 1);
        assert_eq!(local.meta.sequence, 2);
    }

    #[test]
    fn upsert_replaces_record_by_key() {
        let mut reconciler = Reconciler::with_snapshot(base(0));
        reconciler
            .apply(&envelope(1, EnvelopePayload::Command(command("c1", 0))))
            .expect("applies");
        let mut decided = command("c1", 5);
        decided.status = CommandStatus::Rejected;
        reconciler
            .apply(&envelope(2, EnvelopePayload::Command(decided)))
            .expect("applies");
        let local = reconciler.snapshot().expect("snapshot held");
        assert_eq!(local.pending_commands.len(), 1);
        assert_eq!(local.pending_commands[0].status, CommandStatus::Rejected);
    }

    #[test]
    fn snapshot_envelope_replaces_everything() {
        let mut reconciler = Reconciler::with_snapshot(base(3));
        reconciler.mark_connected(true);
        let mut fresh = base(40);
        fresh.upsert_session(session("s9", AgentStatus::Idle, 0));
        let outcome = reconciler
            .apply(&envelope(40, EnvelopePayload::Snapshot(Box::new(fresh))))
            .expect("applies");
        assert_eq!(outcome, ReconcileOutcome::Replaced { sequence: 40 });
        let local = reconciler.snapshot().expect("snapshot held");
        assert_eq!(local.sessions.len(), 1);
        assert!(local.meta.stream_connected);
        assert_eq!(reconciler.last_sequence(), Some(40));
    }

    #[test]
    fn gap_requires_resync_and_leaves_copy_untouched() {
        let mut reconciler = Reconciler::with_snapshot(base(5));
        let outcome = reconciler
            .apply(&envelope(8, EnvelopePayload::Feed(feed("late"))))
            .expect("evaluates");
        assert_eq!(
            outcome,
            ReconcileOutcome::ResyncRequired(ResyncReason::SequenceGap {
                last_applied: 5,
                received: 8
            })
        );
        assert!(reconciler.snapshot().expect("snapshot held").feed.is_empty());
        assert_eq!(reconciler.last_sequence(), Some(5));
    }

    #[test]
    fn older_envelope_is_ignored() {
        let mut reconciler = Reconciler::with_snapshot(base(5));
        let outcome = reconciler
            .apply(&envelope(4, EnvelopePayload::Feed(feed("old"))))
            .expect("evaluates");
        assert_eq!(
            outcome,
            ReconcileOutcome::Stale {
                sequence: 4,
                last_applied: 5
            }
        );
    }

    #[test]
    fn heartbeat_ahead_of_local_sequence_signals_missed_updates() {
        let mut reconciler = Reconciler::with_snapshot(base(5));
        let hb = |sequence| {
            envelope(
                sequence,
                EnvelopePayload::Heartbeat(Heartbeat {
                    server_time: Utc::now(),
                    subscribers: 1,
                }),
            )
        };
        assert_eq!(
            reconciler.apply(&hb(5)).expect("evaluates"),
            ReconcileOutcome::Heartbeat { sequence: 5 }
        );
        assert!(matches!(
            reconciler.apply(&hb(6)).expect("evaluates"),
            ReconcileOutcome::ResyncRequired(ResyncReason::SequenceGap { .. })
        ));
    }

    #[test]
    fn delta_without_base_requires_resync() {
        let mut reconciler = Reconciler::new();
        let outcome = reconciler
            .apply(&envelope(1, EnvelopePayload::Feed(feed("f"))))
            .expect("evaluates");
        assert_eq!(
            outcome,
            ReconcileOutcome::ResyncRequired(ResyncReason::NoBaseSnapshot)
        );
    }

    #[test]
    fn mark_connected_toggles_stale_flag() {
        let mut reconciler = Reconciler::with_snapshot(base(0));
        reconciler.mark_connected(false);
        let meta = &reconciler.snapshot().expect("snapshot held").meta;
        assert!(meta.stale);
        assert!(!meta.stream_connected);
    }
}
