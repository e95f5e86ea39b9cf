use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::model::{AgentFeedEntry, AgentPendingCommand, AgentSession, QaHandoff, Snapshot};

/// Closed set of change types carried on the push stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum EventType {
    #[serde(rename = "snapshot")]
    Snapshot,
    #[serde(rename = "agents.session.upserted")]
    SessionUpserted,
    #[serde(rename = "agents.feed.appended")]
    FeedAppended,
    #[serde(rename = "agents.command.upserted")]
    CommandUpserted,
    #[serde(rename = "qa.handoff.upserted")]
    HandoffUpserted,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::Snapshot,
        EventType::SessionUpserted,
        EventType::FeedAppended,
        EventType::CommandUpserted,
        EventType::HandoffUpserted,
        EventType::Heartbeat,
    ];

    /// Wire name, also used as the push-stream `event:` field.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Snapshot => "snapshot",
            EventType::SessionUpserted => "agents.session.upserted",
            EventType::FeedAppended => "agents.feed.appended",
            EventType::CommandUpserted => "agents.command.upserted",
            EventType::HandoffUpserted => "qa.handoff.upserted",
            EventType::Heartbeat => "heartbeat",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `heartbeat` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub server_time: DateTime<Utc>,
    pub subscribers: usize,
}

/// Typed view of an envelope payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopePayload {
    Snapshot(Box<Snapshot>),
    Session(AgentSession),
    Feed(AgentFeedEntry),
    Command(AgentPendingCommand),
    Handoff(QaHandoff),
    Heartbeat(Heartbeat),
}

impl EnvelopePayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EnvelopePayload::Snapshot(_) => EventType::Snapshot,
            EnvelopePayload::Session(_) => EventType::SessionUpserted,
            EnvelopePayload::Feed(_) => EventType::FeedAppended,
            EnvelopePayload::Command(_) => EventType::CommandUpserted,
            EnvelopePayload::Handoff(_) => EventType::HandoffUpserted,
            EnvelopePayload::Heartbeat(_) => EventType::Heartbeat,
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EnvelopePayload::Snapshot(snapshot) => serde_json::to_value(snapshot),
            EnvelopePayload::Session(session) => serde_json::to_value(session),
            EnvelopePayload::Feed(entry) => serde_json::to_value(entry),
            EnvelopePayload::Command(command) => serde_json::to_value(command),
            EnvelopePayload::Handoff(handoff) => serde_json::to_value(handoff),
            EnvelopePayload::Heartbeat(heartbeat) => serde_json::to_value(heartbeat),
        }
    }
}

/// The sequenced unit of change broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnvelope {
    pub event_id: String,
    /// Drawn from the same counter as `Snapshot.meta.sequence`.
    pub sequence: u64,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    /// Free-text origin tag, diagnostics only.
    pub source: String,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

impl StreamEnvelope {
    pub fn new(
        sequence: u64,
        source: impl Into<String>,
        payload: &EnvelopePayload,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::now_v7().to_string(),
            sequence,
            event_type: payload.event_type(),
            occurred_at: Utc::now(),
            source: source.into(),
            payload: payload.to_value()?,
        })
    }

    /// Decode `payload` according to `event_type`.
    pub fn decode(&self) -> Result<EnvelopePayload, serde_json::Error> {
        let value = self.payload.clone();
        Ok(match self.event_type {
            EventType::Snapshot => EnvelopePayload::Snapshot(Box::new(serde_json::from_value(value)?)),
            EventType::SessionUpserted => EnvelopePayload::Session(serde_json::from_value(value)?),
            EventType::FeedAppended => EnvelopePayload::Feed(serde_json::from_value(value)?),
            EventType::CommandUpserted => EnvelopePayload::Command(serde_json::from_value(value)?),
            EventType::HandoffUpserted => EnvelopePayload::Handoff(serde_json::from_value(value)?),
            EventType::Heartbeat => EnvelopePayload::Heartbeat(serde_json::from_value(value)?),
        })
    }
}
