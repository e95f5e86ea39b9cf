use clap::Subcommand;
use serde_json::json;

use super::agents::Verdict;
use crate::util::{api_request, put_opt};

#[derive(Subcommand)]
pub enum QaCommands {
    /// Open a QA handoff (also creates its approval command)
    Create {
        #[arg(long)]
        title: String,
        /// Handoff id (generated if omitted)
        #[arg(long)]
        handoff_id: Option<String>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        pull_request_url: Option<String>,
    },
    /// Approve or reject a handoff
    Decide {
        handoff_id: String,
        #[command(flatten)]
        verdict: Verdict,
    },
    /// List handoffs, newest first
    List {
        /// pending, approved or rejected
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one handoff with its linked command
    Get { handoff_id: String },
}

pub async fn run(api_url: &str, token: Option<&str>, raw: bool, command: QaCommands) -> i32 {
    match command {
        QaCommands::Create {
            title,
            handoff_id,
            summary,
            session_id,
            agent_id,
            repository,
            branch,
            pull_request_url,
        } => {
            let mut body = json!({ "title": title });
            put_opt(&mut body, "handoffId", handoff_id);
            put_opt(&mut body, "summary", summary);
            put_opt(&mut body, "sessionId", session_id);
            put_opt(&mut body, "agentId", agent_id);
            put_opt(&mut body, "repository", repository);
            put_opt(&mut body, "branch", branch);
            put_opt(&mut body, "pullRequestUrl", pull_request_url);
            api_request(
                api_url,
                reqwest::Method::POST,
                "/qa/handoff",
                token,
                Some(body),
                &[],
                raw,
            )
            .await
        }
        QaCommands::Decide {
            handoff_id,
            verdict,
        } => {
            api_request(
                api_url,
                reqwest::Method::POST,
                "/qa/handoff/decision",
                token,
                Some(verdict.body("handoffId", handoff_id)),
                &[],
                raw,
            )
            .await
        }
        QaCommands::List { status } => {
            let query: Vec<(String, String)> = status
                .into_iter()
                .map(|s| ("status".to_string(), s))
                .collect();
            api_request(
                api_url,
                reqwest::Method::GET,
                "/qa/handoffs",
                token,
                None,
                &query,
                raw,
            )
            .await
        }
        QaCommands::Get { handoff_id } => {
            api_request(
                api_url,
                reqwest::Method::GET,
                &format!("/qa/handoff/{handoff_id}"),
                token,
                None,
                &[],
                raw,
            )
            .await
        }
    }
}
