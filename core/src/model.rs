use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Feed is a FIFO ring: the oldest entries fall off first.
pub const FEED_CAPACITY: usize = 500;
/// Pending commands evict the record with the oldest `updatedAt`.
pub const PENDING_COMMAND_CAPACITY: usize = 300;
/// QA handoffs evict the record with the oldest `updatedAt`.
pub const QA_HANDOFF_CAPACITY: usize = 500;

/// How an agent session is attached to the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgentTransport {
    Cli,
    Local,
    Cloud,
    #[default]
    Unknown,
}

/// Session status. Any value may follow any other: the server projects what
/// collaborators report and never validates transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Busy,
    Idle,
    Waiting,
    Error,
    Offline,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Idle => "idle",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FeedLevel {
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CommandRisk {
    Low,
    #[default]
    Medium,
    High,
}

/// `pending` leads to one of the terminal states. Expiry is stamped by
/// collaborators; nothing here enforces it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// An operator verdict on a pending command or QA handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn from_approve(approve: bool) -> Self {
        if approve { Decision::Approve } else { Decision::Reject }
    }

    pub fn command_status(self) -> CommandStatus {
        match self {
            Decision::Approve => CommandStatus::Approved,
            Decision::Reject => CommandStatus::Rejected,
        }
    }

    pub fn handoff_status(self) -> HandoffStatus {
        match self {
            Decision::Approve => HandoffStatus::Approved,
            Decision::Reject => HandoffStatus::Rejected,
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            Decision::Approve => "approved",
            Decision::Reject => "rejected",
        }
    }
}

/// Optional runtime details an agent reports about itself. Shared by
/// sessions and feed entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_tools: Vec<String>,
}

/// One running coding agent, keyed by `session_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub session_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub transport: AgentTransport,
    pub status: AgentStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(flatten)]
    pub profile: AgentProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Fixed by the first upsert of this session; later upserts cannot move it.
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only feed line. `session_id` is a weak reference and may be absent
/// (operator messages, orchestration notices).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentFeedEntry {
    pub entry_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub level: FeedLevel,
    pub message: String,
    #[serde(flatten)]
    pub profile: AgentProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AgentFeedEntry {
    /// A fresh entry with a generated UUIDv7 id, not tied to any session.
    pub fn new(level: FeedLevel, message: impl Into<String>) -> Self {
        Self {
            entry_id: Uuid::now_v7().to_string(),
            session_id: None,
            agent_id: None,
            level,
            message: message.into(),
            profile: AgentProfile::default(),
            repository: None,
            workspace: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attribute the entry to `session`, copying its runtime details.
    pub fn for_session(mut self, session: &AgentSession) -> Self {
        self.session_id = Some(session.session_id.clone());
        self.agent_id = Some(session.agent_id.clone());
        self.profile = session.profile.clone();
        self.repository = session.repository.clone();
        self.workspace = session.workspace.clone();
        self
    }
}

/// A command an agent wants to run and an operator has to approve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentPendingCommand {
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub risk: CommandRisk,
    #[serde(default)]
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Set on commands synthesized for a QA handoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_id: Option<String>,
}

/// Operator approval gate on a proposed change, mirrored onto exactly one
/// synthesized pending command (`linked_command_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QaHandoff {
    pub handoff_id: String,
    pub linked_command_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
    #[serde(default)]
    pub status: HandoffStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The command text synthesized for a QA handoff.
pub fn qa_approve_command(handoff_id: &str) -> String {
    format!("qa.approve {handoff_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub generated_at: DateTime<Utc>,
    /// Process-wide monotonic counter; never reset while the server lives.
    pub sequence: u64,
    pub source: String,
    #[serde(default)]
    pub stream_connected: bool,
    #[serde(default)]
    pub stale: bool,
}

/// The aggregate the dashboard renders. The server owns the authoritative
/// copy; every viewer holds a reconciled clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Board items, passed through untouched.
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub board: Vec<serde_json::Value>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub ci_runs: Vec<serde_json::Value>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub ci_jobs: Vec<serde_json::Value>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub pull_requests: Vec<serde_json::Value>,
    #[serde(default)]
    pub sessions: Vec<AgentSession>,
    #[serde(default)]
    pub feed: Vec<AgentFeedEntry>,
    #[serde(default)]
    pub pending_commands: Vec<AgentPendingCommand>,
    #[serde(default)]
    pub qa_handoffs: Vec<QaHandoff>,
    pub meta: SnapshotMeta,
}

impl Snapshot {
    pub fn empty(source: impl Into<String>) -> Self {
        Self {
            board: Vec::new(),
            ci_runs: Vec::new(),
            ci_jobs: Vec::new(),
            pull_requests: Vec::new(),
            sessions: Vec::new(),
            feed: Vec::new(),
            pending_commands: Vec::new(),
            qa_handoffs: Vec::new(),
            meta: SnapshotMeta {
                generated_at: Utc::now(),
                sequence: 0,
                source: source.into(),
                stream_connected: false,
                stale: false,
            },
        }
    }

    pub fn session(&self, session_id: &str) -> Option<&AgentSession> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }

    pub fn pending_command(&self, command_id: &str) -> Option<&AgentPendingCommand> {
        self.pending_commands
            .iter()
            .find(|c| c.command_id == command_id)
    }

    pub fn qa_handoff(&self, handoff_id: &str) -> Option<&QaHandoff> {
        self.qa_handoffs.iter().find(|h| h.handoff_id == handoff_id)
    }

    /// The handoff whose synthesized command is `command_id`, if any.
    pub fn handoff_for_command(&self, command_id: &str) -> Option<&QaHandoff> {
        self.qa_handoffs
            .iter()
            .find(|h| h.linked_command_id == command_id)
    }

    /// Insert or replace by `session_id`. A replaced session keeps the
    /// `started_at` it was first seen with.
    pub fn upsert_session(&mut self, mut session: AgentSession) -> AgentSession {
        if let Some(existing) = self.session(&session.session_id) {
            session.started_at = existing.started_at;
        }
        upsert_by_key(&mut self.sessions, session.clone(), |s| &s.session_id);
        session
    }

    /// Append (or replace by `entry_id`) and trim the oldest entries past
    /// [`FEED_CAPACITY`]. Relative order of survivors is preserved.
    pub fn append_feed(&mut self, entry: AgentFeedEntry) {
        upsert_by_key(&mut self.feed, entry, |e| &e.entry_id);
        if self.feed.len() > FEED_CAPACITY {
            let overflow = self.feed.len() - FEED_CAPACITY;
            self.feed.drain(..overflow);
        }
    }

    pub fn upsert_pending_command(&mut self, command: AgentPendingCommand) {
        upsert_by_key(&mut self.pending_commands, command, |c| &c.command_id);
        evict_oldest_updated(&mut self.pending_commands, PENDING_COMMAND_CAPACITY, |c| {
            c.updated_at
        });
    }

    pub fn upsert_qa_handoff(&mut self, handoff: QaHandoff) {
        upsert_by_key(&mut self.qa_handoffs, handoff, |h| &h.handoff_id);
        evict_oldest_updated(&mut self.qa_handoffs, QA_HANDOFF_CAPACITY, |h| h.updated_at);
    }

    /// Apply every collection bound at once, e.g. after a bulk replace.
    pub fn enforce_bounds(&mut self) {
        if self.feed.len() > FEED_CAPACITY {
            let overflow = self.feed.len() - FEED_CAPACITY;
            self.feed.drain(..overflow);
        }
        evict_oldest_updated(&mut self.pending_commands, PENDING_COMMAND_CAPACITY, |c| {
            c.updated_at
        });
        evict_oldest_updated(&mut self.qa_handoffs, QA_HANDOFF_CAPACITY, |h| h.updated_at);
    }

    pub fn counts(&self) -> SnapshotCounts {
        let mut sessions_by_status = BTreeMap::new();
        for session in &self.sessions {
            *sessions_by_status.entry(session.status).or_insert(0) += 1;
        }
        SnapshotCounts {
            sessions: self.sessions.len(),
            sessions_by_status,
            pending_commands: self
                .pending_commands
                .iter()
                .filter(|c| c.status == CommandStatus::Pending)
                .count(),
            open_handoffs: self
                .qa_handoffs
                .iter()
                .filter(|h| h.status == HandoffStatus::Pending)
                .count(),
            feed_entries: self.feed.len(),
        }
    }
}

/// Aggregate counts used for status lines and the offline reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub sessions: usize,
    pub sessions_by_status: BTreeMap<AgentStatus, usize>,
    pub pending_commands: usize,
    pub open_handoffs: usize,
    pub feed_entries: usize,
}

impl SnapshotCounts {
    pub fn with_status(&self, status: AgentStatus) -> usize {
        self.sessions_by_status.get(&status).copied().unwrap_or(0)
    }
}

fn upsert_by_key<T, F>(items: &mut Vec<T>, item: T, key: F)
where
    F: Fn(&T) -> &String,
{
    match items.iter().position(|existing| key(existing) == key(&item)) {
        Some(index) => items[index] = item,
        None => items.push(item),
    }
}

fn evict_oldest_updated<T, F>(items: &mut Vec<T>, capacity: usize, updated_at: F)
where
    F: Fn(&T) -> DateTime<Utc>,
{
    while items.len() > capacity {
        let oldest = items
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| updated_at(item))
            .map(|(index, _)| index);
        match oldest {
            Some(index) => {
                items.remove(index);
            }
            None => break,
        }
    }
}
