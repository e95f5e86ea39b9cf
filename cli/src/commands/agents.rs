use clap::{Args, Subcommand, ValueEnum};
use opsdeck_core::model::{AgentStatus, CommandRisk, FeedLevel};
use serde_json::json;
use uuid::Uuid;

use crate::util::{api_request, put_opt};

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register or update an agent session
    Session {
        /// Session id (generated if omitted)
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        agent_id: String,
        #[arg(long, value_enum, default_value_t = StatusArg::Online)]
        status: StatusArg,
        #[arg(long, default_value = "")]
        summary: String,
        #[command(flatten)]
        place: Placement,
    },
    /// Start an agent on a task
    Dispatch {
        #[arg(long)]
        agent_id: String,
        #[arg(long)]
        session_id: Option<String>,
        /// Task description shown in the feed
        #[arg(long)]
        task: Option<String>,
        #[command(flatten)]
        place: Placement,
    },
    /// Post a message to the activity feed
    Message {
        message: String,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long, value_enum, default_value_t = LevelArg::Info)]
        level: LevelArg,
    },
    /// Propose a command that needs approval
    Command {
        /// Command text
        command: String,
        #[arg(long)]
        command_id: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long, value_enum, default_value_t = RiskArg::Medium)]
        risk: RiskArg,
    },
    /// Approve or reject a pending command
    Decide {
        command_id: String,
        #[command(flatten)]
        verdict: Verdict,
    },
    /// Mark an agent session offline
    Stop {
        session_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StatusArg {
    Online,
    Busy,
    Idle,
    Waiting,
    Error,
    Offline,
}

impl From<StatusArg> for AgentStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Online => AgentStatus::Online,
            StatusArg::Busy => AgentStatus::Busy,
            StatusArg::Idle => AgentStatus::Idle,
            StatusArg::Waiting => AgentStatus::Waiting,
            StatusArg::Error => AgentStatus::Error,
            StatusArg::Offline => AgentStatus::Offline,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum LevelArg {
    Info,
    Warn,
    Error,
}

impl From<LevelArg> for FeedLevel {
    fn from(arg: LevelArg) -> Self {
        match arg {
            LevelArg::Info => FeedLevel::Info,
            LevelArg::Warn => FeedLevel::Warn,
            LevelArg::Error => FeedLevel::Error,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RiskArg {
    Low,
    Medium,
    High,
}

impl From<RiskArg> for CommandRisk {
    fn from(arg: RiskArg) -> Self {
        match arg {
            RiskArg::Low => CommandRisk::Low,
            RiskArg::Medium => CommandRisk::Medium,
            RiskArg::High => CommandRisk::High,
        }
    }
}

#[derive(Args)]
pub struct Placement {
    #[arg(long)]
    pub workspace: Option<String>,
    #[arg(long)]
    pub repository: Option<String>,
    #[arg(long)]
    pub branch: Option<String>,
    /// Model the agent runs on
    #[arg(long)]
    pub model: Option<String>,
}

/// Shared by command and handoff decisions.
#[derive(Args)]
pub struct Verdict {
    /// Approve (default when neither flag is given)
    #[arg(long, conflicts_with = "reject")]
    pub approve: bool,
    #[arg(long)]
    pub reject: bool,
    #[arg(long)]
    pub decided_by: Option<String>,
    #[arg(long)]
    pub note: Option<String>,
}

impl Verdict {
    pub fn body(self, id_field: &str, id: String) -> serde_json::Value {
        let mut body = json!({ "approve": self.approve || !self.reject });
        body[id_field] = json!(id);
        put_opt(&mut body, "decidedBy", self.decided_by);
        put_opt(&mut body, "note", self.note);
        body
    }
}

fn placed(mut body: serde_json::Value, place: Placement) -> serde_json::Value {
    put_opt(&mut body, "workspace", place.workspace);
    put_opt(&mut body, "repository", place.repository);
    put_opt(&mut body, "branch", place.branch);
    put_opt(&mut body, "model", place.model);
    body
}

fn request(command: AgentCommands) -> (&'static str, serde_json::Value) {
    match command {
        AgentCommands::Session {
            session_id,
            agent_id,
            status,
            summary,
            place,
        } => {
            let session_id = session_id.unwrap_or_else(|| Uuid::now_v7().to_string());
            let body = json!({
                "sessionId": session_id,
                "agentId": agent_id,
                "status": AgentStatus::from(status),
                "summary": summary,
                "source": "cli",
            });
            ("/agents/session", placed(body, place))
        }
        AgentCommands::Dispatch {
            agent_id,
            session_id,
            task,
            place,
        } => {
            let mut body = json!({ "agentId": agent_id });
            put_opt(&mut body, "sessionId", session_id);
            put_opt(&mut body, "task", task);
            ("/agents/dispatch", placed(body, place))
        }
        AgentCommands::Message {
            message,
            session_id,
            agent_id,
            level,
        } => {
            let mut body = json!({ "message": message, "level": FeedLevel::from(level) });
            put_opt(&mut body, "sessionId", session_id);
            put_opt(&mut body, "agentId", agent_id);
            ("/agents/message", body)
        }
        AgentCommands::Command {
            command,
            command_id,
            session_id,
            agent_id,
            summary,
            risk,
        } => {
            let mut body = json!({
                "command": command,
                "risk": CommandRisk::from(risk),
                "source": "cli",
            });
            put_opt(&mut body, "commandId", command_id);
            put_opt(&mut body, "sessionId", session_id);
            put_opt(&mut body, "agentId", agent_id);
            put_opt(&mut body, "summary", summary);
            ("/agents/command", body)
        }
        AgentCommands::Decide {
            command_id,
            verdict,
        } => (
            "/agents/command/decision",
            verdict.body("commandId", command_id),
        ),
        AgentCommands::Stop { session_id, reason } => {
            let mut body = json!({ "sessionId": session_id });
            put_opt(&mut body, "reason", reason);
            ("/agents/stop", body)
        }
    }
}

pub async fn run(api_url: &str, token: Option<&str>, raw: bool, command: AgentCommands) -> i32 {
    let (path, body) = request(command);
    api_request(
        api_url,
        reqwest::Method::POST,
        path,
        token,
        Some(body),
        &[],
        raw,
    )
    .await
}
