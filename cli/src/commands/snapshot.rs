use clap::Subcommand;

use crate::util::{api_request, exit_error, read_json_from_file};

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Print the current snapshot
    Get,
    /// Replace the whole snapshot from a JSON file
    Replace {
        /// Snapshot JSON (use '-' for stdin)
        #[arg(long, short = 'f')]
        file: String,
    },
}

pub async fn run(api_url: &str, token: Option<&str>, raw: bool, command: SnapshotCommands) -> i32 {
    match command {
        SnapshotCommands::Get => {
            api_request(api_url, reqwest::Method::GET, "/snapshot", token, None, &[], raw).await
        }
        SnapshotCommands::Replace { file } => {
            let body = match read_json_from_file(&file) {
                Ok(v) => v,
                Err(e) => exit_error(&e, Some("Provide a snapshot JSON file or use '-' for stdin")),
            };
            api_request(
                api_url,
                reqwest::Method::POST,
                "/snapshot/update",
                token,
                Some(body),
                &[],
                raw,
            )
            .await
        }
    }
}
