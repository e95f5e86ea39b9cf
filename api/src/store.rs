//! Authoritative in-memory snapshot and the only writer of the sequence.
//!
//! Every mutation takes the store lock, applies its change, draws the next
//! sequence number and hands the encoded envelope to the broadcaster before
//! releasing the lock. Subscribers therefore observe envelopes in sequence
//! order, and a new subscriber's initial `snapshot` envelope is taken under
//! the same lock, so no change can fall between it and the first delta.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opsdeck_core::envelope::{EnvelopePayload, Heartbeat, StreamEnvelope};
use opsdeck_core::model::{
    AgentFeedEntry, AgentPendingCommand, AgentSession, AgentStatus, CommandRisk, CommandStatus,
    Decision, FeedLevel, HandoffStatus, QaHandoff, Snapshot, qa_approve_command,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{EventBroadcaster, PreparedEvent, Subscription};

pub const SERVER_SOURCE: &str = "opsdeck-api";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to encode stream envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Who decided, and why. Shared by command and handoff decisions.
#[derive(Debug, Clone, Default)]
pub struct DecisionInput {
    pub decided_by: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandDecisionOutcome {
    /// `None` when the command id is unknown; the decision is still recorded
    /// on the feed.
    pub command: Option<AgentPendingCommand>,
    pub handoff: Option<QaHandoff>,
    pub feed_entry: AgentFeedEntry,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct HandoffDecisionOutcome {
    pub handoff: QaHandoff,
    pub command: Option<AgentPendingCommand>,
    pub feed_entry: AgentFeedEntry,
    pub sequence: u64,
}

/// Fields an operator or agent supplies when opening a QA handoff.
#[derive(Debug, Clone, Default)]
pub struct HandoffDraft {
    pub handoff_id: Option<String>,
    pub title: String,
    pub summary: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub pull_request_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HandoffCreated {
    pub handoff: QaHandoff,
    pub command: AgentPendingCommand,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct SessionRecorded {
    pub session: AgentSession,
    pub sequence: u64,
}

/// A session change together with the feed line that announces it.
#[derive(Debug, Clone)]
pub struct SessionActivity {
    pub session: AgentSession,
    pub feed_entry: AgentFeedEntry,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct FeedRecorded {
    pub entry: AgentFeedEntry,
    pub sequence: u64,
}

pub struct SnapshotStore {
    snapshot: Mutex<Snapshot>,
    broadcaster: Arc<EventBroadcaster>,
}

impl SnapshotStore {
    pub fn new(broadcaster: Arc<EventBroadcaster>) -> Self {
        Self::with_snapshot(Snapshot::empty(SERVER_SOURCE), broadcaster)
    }

    pub fn with_snapshot(snapshot: Snapshot, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            broadcaster,
        }
    }

    /// Deep copy of the current state; callers can never mutate the original.
    pub async fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().await.clone()
    }

    pub async fn session(&self, session_id: &str) -> Option<AgentSession> {
        self.snapshot.lock().await.session(session_id).cloned()
    }

    pub async fn sequence(&self) -> u64 {
        self.snapshot.lock().await.meta.sequence
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    /// Register a push-stream subscriber. Its first event is a `snapshot`
    /// envelope carrying the current sequence (not a new one).
    pub async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let snapshot = self.snapshot.lock().await;
        let envelope = StreamEnvelope::new(
            snapshot.meta.sequence,
            SERVER_SOURCE,
            &EnvelopePayload::Snapshot(Box::new(snapshot.clone())),
        )?;
        let initial = PreparedEvent::from_envelope(&envelope)?;
        Ok(self.broadcaster.subscribe(initial))
    }

    /// Liveness signal at the current sequence.
    pub async fn publish_heartbeat(&self) -> Result<StreamEnvelope, StoreError> {
        let snapshot = self.snapshot.lock().await;
        let envelope = StreamEnvelope::new(
            snapshot.meta.sequence,
            SERVER_SOURCE,
            &EnvelopePayload::Heartbeat(Heartbeat {
                server_time: Utc::now(),
                subscribers: self.broadcaster.subscriber_count(),
            }),
        )?;
        self.broadcaster
            .publish(PreparedEvent::from_envelope(&envelope)?);
        Ok(envelope)
    }

    pub async fn upsert_session(
        &self,
        session: AgentSession,
        source: &str,
    ) -> Result<SessionRecorded, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let stored = snapshot.upsert_session(session);
        let envelope = self.commit(&mut snapshot, source, EnvelopePayload::Session(stored.clone()))?;
        Ok(SessionRecorded {
            session: stored,
            sequence: envelope.sequence,
        })
    }

    pub async fn append_feed(
        &self,
        entry: AgentFeedEntry,
        source: &str,
    ) -> Result<StreamEnvelope, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.append_feed(entry.clone());
        self.commit(&mut snapshot, source, EnvelopePayload::Feed(entry))
    }

    pub async fn upsert_pending_command(
        &self,
        command: AgentPendingCommand,
        source: &str,
    ) -> Result<StreamEnvelope, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.upsert_pending_command(command.clone());
        self.commit(&mut snapshot, source, EnvelopePayload::Command(command))
    }

    pub async fn upsert_qa_handoff(
        &self,
        handoff: QaHandoff,
        source: &str,
    ) -> Result<StreamEnvelope, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.upsert_qa_handoff(handoff.clone());
        self.commit(&mut snapshot, source, EnvelopePayload::Handoff(handoff))
    }

    /// Swap in a whole snapshot. Its `meta.sequence` is overwritten with a
    /// freshly drawn number; the counter never goes backwards.
    pub async fn replace_snapshot(
        &self,
        mut replacement: Snapshot,
        source: &str,
    ) -> Result<StreamEnvelope, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        replacement.enforce_bounds();
        replacement.meta.sequence = snapshot.meta.sequence;
        replacement.meta.stream_connected = false;
        replacement.meta.stale = false;
        *snapshot = replacement;

        let sequence = self.next_sequence(&mut snapshot);
        let envelope = StreamEnvelope::new(
            sequence,
            source,
            &EnvelopePayload::Snapshot(Box::new(snapshot.clone())),
        )?;
        self.broadcaster
            .publish(PreparedEvent::from_envelope(&envelope)?);
        tracing::info!(sequence, source, "snapshot replaced");
        Ok(envelope)
    }

    /// Record a new session as waiting for work, plus a feed line.
    pub async fn dispatch_agent(
        &self,
        session: AgentSession,
        task: Option<&str>,
        source: &str,
    ) -> Result<SessionActivity, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let stored = snapshot.upsert_session(session);
        let message = match task {
            Some(task) => format!("Dispatched {}: {task}", stored.agent_id),
            None => format!("Dispatched {}", stored.agent_id),
        };
        let entry = AgentFeedEntry::new(FeedLevel::Info, message).for_session(&stored);
        snapshot.append_feed(entry.clone());
        self.commit(&mut snapshot, source, EnvelopePayload::Session(stored.clone()))?;
        let envelope = self.commit(&mut snapshot, source, EnvelopePayload::Feed(entry.clone()))?;
        Ok(SessionActivity {
            session: stored,
            feed_entry: entry,
            sequence: envelope.sequence,
        })
    }

    /// Append an operator/agent message, attributed to the session when known.
    pub async fn post_message(
        &self,
        mut entry: AgentFeedEntry,
        source: &str,
    ) -> Result<FeedRecorded, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let session = entry
            .session_id
            .as_deref()
            .and_then(|id| snapshot.session(id))
            .cloned();
        if let Some(session) = session {
            entry = entry.for_session(&session);
        }
        snapshot.append_feed(entry.clone());
        let envelope = self.commit(&mut snapshot, source, EnvelopePayload::Feed(entry.clone()))?;
        Ok(FeedRecorded {
            entry,
            sequence: envelope.sequence,
        })
    }

    /// Mark a known session offline. `None` when the session does not exist.
    pub async fn stop_session(
        &self,
        session_id: &str,
        reason: Option<&str>,
        source: &str,
    ) -> Result<Option<SessionActivity>, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let Some(mut session) = snapshot.session(session_id).cloned() else {
            return Ok(None);
        };
        let now = Utc::now();
        session.status = AgentStatus::Offline;
        session.updated_at = now;
        session.last_heartbeat = now;
        let stored = snapshot.upsert_session(session);

        let message = match reason {
            Some(reason) => format!("Stopped {}: {reason}", stored.agent_id),
            None => format!("Stopped {}", stored.agent_id),
        };
        let entry = AgentFeedEntry::new(FeedLevel::Warn, message).for_session(&stored);
        snapshot.append_feed(entry.clone());
        self.commit(&mut snapshot, source, EnvelopePayload::Session(stored.clone()))?;
        let envelope = self.commit(&mut snapshot, source, EnvelopePayload::Feed(entry.clone()))?;
        Ok(Some(SessionActivity {
            session: stored,
            feed_entry: entry,
            sequence: envelope.sequence,
        }))
    }

    /// Apply an operator decision to a pending command. When the command was
    /// synthesized for a QA handoff, the handoff follows it. Always appends a
    /// feed entry, even for unknown command ids.
    ///
    /// Publishes, in order: command, handoff, feed.
    pub async fn decide_command(
        &self,
        command_id: &str,
        decision: Decision,
        input: &DecisionInput,
        source: &str,
    ) -> Result<CommandDecisionOutcome, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let now = Utc::now();

        let command = snapshot
            .pending_command(command_id)
            .cloned()
            .map(|command| decided_command(command, decision, input, now));
        if let Some(command) = &command {
            snapshot.upsert_pending_command(command.clone());
        }

        let handoff = project_onto_handoff(&snapshot, command_id, command.as_ref(), decision, input, now);
        if let Some(handoff) = &handoff {
            snapshot.upsert_qa_handoff(handoff.clone());
        }

        let verb = decision.verb();
        let message = match (&handoff, &command) {
            (Some(h), _) => format!("QA handoff {} {verb} via command {command_id}", h.handoff_id),
            (None, Some(c)) => format!("Command {command_id} {verb}: {}", c.command),
            (None, None) => format!("Command {command_id} {verb} (command not found)"),
        };
        let mut entry = AgentFeedEntry::new(feed_level(decision), message);
        entry.session_id = command
            .as_ref()
            .and_then(|c| c.session_id.clone())
            .or_else(|| handoff.as_ref().and_then(|h| h.session_id.clone()));
        entry.agent_id = command
            .as_ref()
            .and_then(|c| c.agent_id.clone())
            .or_else(|| handoff.as_ref().and_then(|h| h.agent_id.clone()));
        snapshot.append_feed(entry.clone());

        if let Some(command) = &command {
            self.commit(&mut snapshot, source, EnvelopePayload::Command(command.clone()))?;
        }
        if let Some(handoff) = &handoff {
            self.commit(&mut snapshot, source, EnvelopePayload::Handoff(handoff.clone()))?;
        }
        let envelope = self.commit(&mut snapshot, source, EnvelopePayload::Feed(entry.clone()))?;

        tracing::info!(
            command_id,
            decision = verb,
            command_found = command.is_some(),
            handoff_id = handoff.as_ref().map(|h| h.handoff_id.as_str()),
            "command decision recorded"
        );

        Ok(CommandDecisionOutcome {
            command,
            handoff,
            feed_entry: entry,
            sequence: envelope.sequence,
        })
    }

    /// Open (or refresh) a QA handoff together with its synthesized
    /// `qa.approve <id>` command. Re-opening a known handoff reuses its
    /// command so there is never more than one per handoff.
    ///
    /// Publishes, in order: command, handoff, feed.
    pub async fn create_qa_handoff(
        &self,
        draft: HandoffDraft,
        source: &str,
    ) -> Result<HandoffCreated, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let now = Utc::now();
        let handoff_id = draft
            .handoff_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let existing = snapshot.qa_handoff(&handoff_id).cloned();
        let command_id = existing
            .as_ref()
            .map(|h| h.linked_command_id.clone())
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let created_at = existing.as_ref().map(|h| h.created_at).unwrap_or(now);

        let command = AgentPendingCommand {
            command_id: command_id.clone(),
            session_id: draft.session_id.clone(),
            agent_id: draft.agent_id.clone(),
            command: qa_approve_command(&handoff_id),
            summary: Some(draft.title.clone()),
            risk: CommandRisk::Medium,
            status: CommandStatus::Pending,
            created_at,
            updated_at: now,
            decided_at: None,
            decided_by: None,
            note: None,
            handoff_id: Some(handoff_id.clone()),
        };
        let handoff = QaHandoff {
            handoff_id: handoff_id.clone(),
            linked_command_id: command_id,
            title: draft.title.clone(),
            summary: draft.summary,
            session_id: draft.session_id,
            agent_id: draft.agent_id,
            repository: draft.repository,
            branch: draft.branch,
            pull_request_url: draft.pull_request_url,
            status: HandoffStatus::Pending,
            created_at,
            updated_at: now,
            decided_at: None,
            decided_by: None,
            note: None,
        };
        let mut entry = AgentFeedEntry::new(
            FeedLevel::Info,
            format!("QA handoff {handoff_id} ready for review: {}", handoff.title),
        );
        entry.session_id = handoff.session_id.clone();
        entry.agent_id = handoff.agent_id.clone();
        entry.repository = handoff.repository.clone();

        snapshot.upsert_pending_command(command.clone());
        snapshot.upsert_qa_handoff(handoff.clone());
        snapshot.append_feed(entry.clone());
        self.commit(&mut snapshot, source, EnvelopePayload::Command(command.clone()))?;
        self.commit(&mut snapshot, source, EnvelopePayload::Handoff(handoff.clone()))?;
        let envelope = self.commit(&mut snapshot, source, EnvelopePayload::Feed(entry))?;

        Ok(HandoffCreated {
            handoff,
            command,
            sequence: envelope.sequence,
        })
    }

    /// Decide a QA handoff directly; the linked command follows.
    /// `None` when the handoff does not exist.
    ///
    /// Publishes, in order: handoff, command, feed.
    pub async fn decide_qa_handoff(
        &self,
        handoff_id: &str,
        decision: Decision,
        input: &DecisionInput,
        source: &str,
    ) -> Result<Option<HandoffDecisionOutcome>, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let Some(handoff) = snapshot.qa_handoff(handoff_id).cloned() else {
            return Ok(None);
        };
        let now = Utc::now();
        let handoff = decided_handoff(handoff, decision, input, now);
        let command = snapshot
            .pending_command(&handoff.linked_command_id)
            .cloned()
            .map(|command| decided_command(command, decision, input, now));

        let mut entry = AgentFeedEntry::new(
            feed_level(decision),
            format!("QA handoff {handoff_id} {}: {}", decision.verb(), handoff.title),
        );
        entry.session_id = handoff.session_id.clone();
        entry.agent_id = handoff.agent_id.clone();
        entry.repository = handoff.repository.clone();

        snapshot.upsert_qa_handoff(handoff.clone());
        if let Some(command) = &command {
            snapshot.upsert_pending_command(command.clone());
        }
        snapshot.append_feed(entry.clone());
        self.commit(&mut snapshot, source, EnvelopePayload::Handoff(handoff.clone()))?;
        if let Some(command) = &command {
            self.commit(&mut snapshot, source, EnvelopePayload::Command(command.clone()))?;
        }
        let envelope = self.commit(&mut snapshot, source, EnvelopePayload::Feed(entry.clone()))?;

        tracing::info!(handoff_id, decision = decision.verb(), "handoff decision recorded");

        Ok(Some(HandoffDecisionOutcome {
            handoff,
            command,
            feed_entry: entry,
            sequence: envelope.sequence,
        }))
    }

    /// Publish a batch of changes atomically with respect to other writers.
    /// Sessions are stored first so the published copy keeps its original
    /// `started_at`.
    pub async fn record(
        &self,
        changes: Vec<EnvelopePayload>,
        source: &str,
    ) -> Result<Vec<StreamEnvelope>, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let mut envelopes = Vec::with_capacity(changes.len());
        for change in changes {
            let change = match change {
                EnvelopePayload::Session(session) => {
                    EnvelopePayload::Session(snapshot.upsert_session(session))
                }
                EnvelopePayload::Feed(entry) => {
                    snapshot.append_feed(entry.clone());
                    EnvelopePayload::Feed(entry)
                }
                EnvelopePayload::Command(command) => {
                    snapshot.upsert_pending_command(command.clone());
                    EnvelopePayload::Command(command)
                }
                EnvelopePayload::Handoff(handoff) => {
                    snapshot.upsert_qa_handoff(handoff.clone());
                    EnvelopePayload::Handoff(handoff)
                }
                EnvelopePayload::Snapshot(_) | EnvelopePayload::Heartbeat(_) => continue,
            };
            envelopes.push(self.commit(&mut snapshot, source, change)?);
        }
        Ok(envelopes)
    }

    fn next_sequence(&self, snapshot: &mut Snapshot) -> u64 {
        snapshot.meta.sequence += 1;
        snapshot.meta.generated_at = Utc::now();
        snapshot.meta.sequence
    }

    /// Draw a sequence number for an already-applied change and publish it.
    /// Must be called with the store lock held.
    fn commit(
        &self,
        snapshot: &mut Snapshot,
        source: &str,
        payload: EnvelopePayload,
    ) -> Result<StreamEnvelope, StoreError> {
        let sequence = self.next_sequence(snapshot);
        let envelope = StreamEnvelope::new(sequence, source, &payload)?;
        let delivered = self
            .broadcaster
            .publish(PreparedEvent::from_envelope(&envelope)?);
        tracing::debug!(
            sequence,
            event_type = %envelope.event_type,
            source,
            delivered,
            "envelope published"
        );
        Ok(envelope)
    }
}

fn feed_level(decision: Decision) -> FeedLevel {
    match decision {
        Decision::Approve => FeedLevel::Info,
        Decision::Reject => FeedLevel::Warn,
    }
}

fn decided_command(
    mut command: AgentPendingCommand,
    decision: Decision,
    input: &DecisionInput,
    now: DateTime<Utc>,
) -> AgentPendingCommand {
    command.status = decision.command_status();
    command.updated_at = now;
    command.decided_at = Some(now);
    command.decided_by = input.decided_by.clone();
    command.note = input.note.clone();
    command
}

fn decided_handoff(
    mut handoff: QaHandoff,
    decision: Decision,
    input: &DecisionInput,
    now: DateTime<Utc>,
) -> QaHandoff {
    handoff.status = decision.handoff_status();
    handoff.updated_at = now;
    handoff.decided_at = Some(now);
    handoff.decided_by = input.decided_by.clone();
    handoff.note = input.note.clone();
    handoff
}

/// The handoff a command decision should also update: the one linked to
/// `command_id`, or the one the command itself names.
fn project_onto_handoff(
    snapshot: &Snapshot,
    command_id: &str,
    command: Option<&AgentPendingCommand>,
    decision: Decision,
    input: &DecisionInput,
    now: DateTime<Utc>,
) -> Option<QaHandoff> {
    let handoff = snapshot.handoff_for_command(command_id).or_else(|| {
        command
            .and_then(|c| c.handoff_id.as_deref())
            .and_then(|id| snapshot.qa_handoff(id))
    })?;
    Some(decided_handoff(handoff.clone(), decision, input, now))
}

/// Emit a heartbeat every `every` until the task is aborted.
pub fn spawn_heartbeat(store: Arc<SnapshotStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = store.publish_heartbeat().await {
                tracing::warn!(error = %err, "heartbeat not published");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use opsdeck_core::envelope::EventType;
    use opsdeck_core::model::{AgentProfile, AgentTransport, FEED_CAPACITY};

    use super::*;
    use crate::broadcast::SUBSCRIBER_BUFFER;

    fn store() -> SnapshotStore {
        SnapshotStore::new(EventBroadcaster::new(SUBSCRIBER_BUFFER))
    }

    fn session(id: &str, status: AgentStatus) -> AgentSession {
        let now = Utc::now();
        AgentSession {
            session_id: id.to_string(),
            agent_id: "codex".to_string(),
            transport: AgentTransport::Cli,
            status,
            summary: String::new(),
            profile: AgentProfile::default(),
            workspace: None,
            repository: None,
            branch: None,
            started_at: now,
            last_heartbeat: now,
            updated_at: now,
        }
    }

    async fn next_envelope(subscription: &mut Subscription) -> StreamEnvelope {
        let event = subscription.next().await.expect("event delivered");
        serde_json::from_str(&event.data).expect("envelope json")
    }

    #[tokio::test]
    async fn each_mutation_draws_next_sequence_and_matches_meta() {
        let store = store();
        let mut subscription = store.subscribe().await.expect("subscribes");
        assert_eq!(next_envelope(&mut subscription).await.event_type, EventType::Snapshot);

        store
            .upsert_session(session("s1", AgentStatus::Busy), "test")
            .await
            .expect("upsert");
        store
            .append_feed(AgentFeedEntry::new(FeedLevel::Info, "hello"), "test")
            .await
            .expect("append");
        store
            .upsert_session(session("s1", AgentStatus::Idle), "test")
            .await
            .expect("upsert");

        let mut previous = 0;
        for _ in 0..3 {
            let envelope = next_envelope(&mut subscription).await;
            assert!(envelope.sequence > previous);
            previous = envelope.sequence;
        }
        assert_eq!(previous, 3);
        assert_eq!(store.snapshot().await.meta.sequence, 3);
    }

    #[tokio::test]
    async fn feed_stays_bounded_and_keeps_newest() {
        let store = store();
        for i in 0..=FEED_CAPACITY {
            let mut entry = AgentFeedEntry::new(FeedLevel::Info, format!("line {i}"));
            entry.entry_id = format!("e{i}");
            store.append_feed(entry, "test").await.expect("append");
        }
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.feed.len(), FEED_CAPACITY);
        assert_eq!(snapshot.feed[0].entry_id, "e1");
        assert_eq!(snapshot.feed[FEED_CAPACITY - 1].entry_id, format!("e{FEED_CAPACITY}"));
    }

    #[tokio::test]
    async fn snapshot_copy_is_independent() {
        let store = store();
        let mut copy = store.snapshot().await;
        copy.sessions.push(session("rogue", AgentStatus::Busy));
        assert!(store.snapshot().await.sessions.is_empty());
    }

    #[tokio::test]
    async fn rejecting_handoff_command_projects_onto_handoff() {
        let store = store();
        let created = store
            .create_qa_handoff(
                HandoffDraft {
                    handoff_id: Some("H".to_string()),
                    title: "Release 1.2".to_string(),
                    ..HandoffDraft::default()
                },
                "test",
            )
            .await
            .expect("creates");
        assert_eq!(created.command.command, "qa.approve H");
        assert_eq!(created.command.risk, CommandRisk::Medium);

        let outcome = store
            .decide_command(
                &created.command.command_id,
                Decision::Reject,
                &DecisionInput::default(),
                "test",
            )
            .await
            .expect("decides");
        assert_eq!(
            outcome.command.as_ref().map(|c| c.status),
            Some(CommandStatus::Rejected)
        );

        let snapshot = store.snapshot().await;
        let handoff = snapshot.qa_handoff("H").expect("handoff kept");
        assert_eq!(handoff.status, HandoffStatus::Rejected);
        let last = snapshot.feed.last().expect("feed entry");
        assert!(last.message.contains("H"));
        assert_eq!(last.entry_id, outcome.feed_entry.entry_id);
    }

    #[tokio::test]
    async fn command_decision_publishes_command_then_handoff_then_feed() {
        let store = store();
        let created = store
            .create_qa_handoff(
                HandoffDraft {
                    handoff_id: Some("H2".to_string()),
                    title: "Check login".to_string(),
                    ..HandoffDraft::default()
                },
                "test",
            )
            .await
            .expect("creates");
        let mut subscription = store.subscribe().await.expect("subscribes");
        next_envelope(&mut subscription).await;

        store
            .decide_command(
                &created.command.command_id,
                Decision::Approve,
                &DecisionInput::default(),
                "test",
            )
            .await
            .expect("decides");

        let kinds = [
            next_envelope(&mut subscription).await,
            next_envelope(&mut subscription).await,
            next_envelope(&mut subscription).await,
        ]
        .map(|e| e.event_type);
        assert_eq!(
            kinds,
            [
                EventType::CommandUpserted,
                EventType::HandoffUpserted,
                EventType::FeedAppended
            ]
        );
    }

    #[tokio::test]
    async fn repeated_decision_is_recorded_again() {
        let store = store();
        let created = store
            .create_qa_handoff(
                HandoffDraft {
                    title: "Flaky test".to_string(),
                    ..HandoffDraft::default()
                },
                "test",
            )
            .await
            .expect("creates");
        let id = created.command.command_id.clone();
        let first = store
            .decide_command(&id, Decision::Approve, &DecisionInput::default(), "test")
            .await
            .expect("first");
        let second = store
            .decide_command(&id, Decision::Reject, &DecisionInput::default(), "test")
            .await
            .expect("second");
        assert!(second.sequence > first.sequence);
        let snapshot = store.snapshot().await;
        assert_eq!(
            snapshot.pending_command(&id).map(|c| c.status),
            Some(CommandStatus::Rejected)
        );
    }

    #[tokio::test]
    async fn unknown_command_decision_still_appends_feed() {
        let store = store();
        let outcome = store
            .decide_command("missing", Decision::Approve, &DecisionInput::default(), "test")
            .await
            .expect("decides");
        assert!(outcome.command.is_none());
        assert!(outcome.handoff.is_none());
        assert!(outcome.feed_entry.message.contains("not found"));
        assert_eq!(store.snapshot().await.feed.len(), 1);
    }

    #[tokio::test]
    async fn recreating_handoff_reuses_its_command() {
        let store = store();
        let draft = HandoffDraft {
            handoff_id: Some("H3".to_string()),
            title: "first".to_string(),
            ..HandoffDraft::default()
        };
        let first = store.create_qa_handoff(draft.clone(), "test").await.expect("creates");
        let second = store
            .create_qa_handoff(
                HandoffDraft {
                    title: "second".to_string(),
                    ..draft
                },
                "test",
            )
            .await
            .expect("re-creates");
        assert_eq!(first.command.command_id, second.command.command_id);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.pending_commands.len(), 1);
        assert_eq!(snapshot.qa_handoffs[0].title, "second");
        assert_eq!(snapshot.qa_handoffs[0].created_at, first.handoff.created_at);
    }

    #[tokio::test]
    async fn handoff_decision_updates_linked_command() {
        let store = store();
        let created = store
            .create_qa_handoff(
                HandoffDraft {
                    handoff_id: Some("H4".to_string()),
                    title: "Deploy".to_string(),
                    ..HandoffDraft::default()
                },
                "test",
            )
            .await
            .expect("creates");
        let outcome = store
            .decide_qa_handoff(
                "H4",
                Decision::Approve,
                &DecisionInput {
                    decided_by: Some("ops".to_string()),
                    note: None,
                },
                "test",
            )
            .await
            .expect("decides")
            .expect("handoff exists");
        assert_eq!(outcome.handoff.status, HandoffStatus::Approved);
        let command = outcome.command.expect("linked command");
        assert_eq!(command.command_id, created.command.command_id);
        assert_eq!(command.status, CommandStatus::Approved);
        assert_eq!(command.decided_by.as_deref(), Some("ops"));

        assert!(
            store
                .decide_qa_handoff("nope", Decision::Approve, &DecisionInput::default(), "test")
                .await
                .expect("evaluates")
                .is_none()
        );
    }

    #[tokio::test]
    async fn replace_snapshot_draws_fresh_sequence() {
        let store = store();
        store
            .upsert_session(session("s1", AgentStatus::Busy), "test")
            .await
            .expect("upsert");
        let mut replacement = Snapshot::empty("importer");
        replacement.meta.sequence = 9_999;
        let envelope = store.replace_snapshot(replacement, "test").await.expect("replaces");
        assert_eq!(envelope.sequence, 2);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.meta.sequence, 2);
        assert_eq!(snapshot.meta.source, "importer");
        assert!(snapshot.sessions.is_empty());
    }

    #[tokio::test]
    async fn stop_marks_session_offline_or_reports_unknown() {
        let store = store();
        store
            .upsert_session(session("s1", AgentStatus::Busy), "test")
            .await
            .expect("upsert");
        let stopped = store
            .stop_session("s1", Some("operator request"), "test")
            .await
            .expect("stops")
            .expect("session exists");
        assert_eq!(stopped.session.status, AgentStatus::Offline);
        assert_eq!(stopped.feed_entry.session_id.as_deref(), Some("s1"));
        // Session then feed: the reported sequence is the feed envelope's.
        assert_eq!(stopped.sequence, 3);
        assert_eq!(store.sequence().await, stopped.sequence);
        assert!(
            store
                .stop_session("ghost", None, "test")
                .await
                .expect("evaluates")
                .is_none()
        );
    }

    #[tokio::test]
    async fn direct_command_and_handoff_upserts_are_sequenced() {
        let store = store();
        let now = Utc::now();
        let command = AgentPendingCommand {
            command_id: "c1".to_string(),
            session_id: None,
            agent_id: Some("codex".to_string()),
            command: "cargo publish".to_string(),
            summary: None,
            risk: CommandRisk::High,
            status: CommandStatus::Pending,
            created_at: now,
            updated_at: now,
            decided_at: None,
            decided_by: None,
            note: None,
            handoff_id: None,
        };
        let handoff = QaHandoff {
            handoff_id: "H9".to_string(),
            linked_command_id: "c1".to_string(),
            title: "Publish".to_string(),
            summary: None,
            session_id: None,
            agent_id: None,
            repository: None,
            branch: None,
            pull_request_url: None,
            status: HandoffStatus::Pending,
            created_at: now,
            updated_at: now,
            decided_at: None,
            decided_by: None,
            note: None,
        };
        let first = store.upsert_pending_command(command, "test").await.expect("command");
        let second = store.upsert_qa_handoff(handoff, "test").await.expect("handoff");
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert_eq!(first.event_type, EventType::CommandUpserted);
        assert_eq!(second.event_type, EventType::HandoffUpserted);

        // The handoff names c1 as its command, so deciding c1 moves it too.
        let outcome = store
            .decide_command("c1", Decision::Approve, &DecisionInput::default(), "test")
            .await
            .expect("decides");
        assert_eq!(
            outcome.handoff.map(|h| h.status),
            Some(HandoffStatus::Approved)
        );
    }

    #[tokio::test]
    async fn heartbeat_reuses_current_sequence() {
        let store = store();
        store
            .append_feed(AgentFeedEntry::new(FeedLevel::Info, "x"), "test")
            .await
            .expect("append");
        let heartbeat = store.publish_heartbeat().await.expect("heartbeat");
        assert_eq!(heartbeat.sequence, 1);
        assert_eq!(store.sequence().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_heartbeat_fires_on_interval_at_current_sequence() {
        let store = Arc::new(store());
        store
            .append_feed(AgentFeedEntry::new(FeedLevel::Info, "x"), "test")
            .await
            .expect("append");
        let mut subscription = store.subscribe().await.expect("subscribes");
        assert_eq!(next_envelope(&mut subscription).await.event_type, EventType::Snapshot);

        let started = tokio::time::Instant::now();
        let task = spawn_heartbeat(Arc::clone(&store), Duration::from_secs(15));
        let envelope = next_envelope(&mut subscription).await;
        task.abort();

        assert_eq!(envelope.event_type, EventType::Heartbeat);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(envelope.sequence, 1);
        assert_eq!(envelope.sequence, store.sequence().await);
    }

    #[tokio::test]
    async fn message_for_known_session_is_attributed() {
        let store = store();
        let mut s = session("s1", AgentStatus::Busy);
        s.repository = Some("acme/api".to_string());
        store.upsert_session(s, "test").await.expect("upsert");
        let mut entry = AgentFeedEntry::new(FeedLevel::Info, "ship it");
        entry.session_id = Some("s1".to_string());
        let posted = store.post_message(entry.clone(), "test").await.expect("posts");
        assert_eq!(posted.sequence, 2);
        let stored = posted.entry;
        assert_eq!(stored.entry_id, entry.entry_id);
        assert_eq!(stored.message, "ship it");
        assert_eq!(stored.agent_id.as_deref(), Some("codex"));
        assert_eq!(stored.repository.as_deref(), Some("acme/api"));
    }
}
