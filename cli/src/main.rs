use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod stream;
mod util;

use commands::agents::AgentCommands;
use commands::jarvis::JarvisCommands;
use commands::qa::QaCommands;
use commands::snapshot::SnapshotCommands;

#[derive(Parser)]
#[command(
    name = "opsdeck",
    version,
    about = "opsdeck CLI: watch the live agent board and drive it from the terminal"
)]
struct Cli {
    /// API base URL
    #[arg(long, env = "OPSDECK_API_URL", default_value = "http://127.0.0.1:7788")]
    api_url: String,

    /// Shared bearer token
    #[arg(long, env = "OPSDECK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Print compact JSON instead of pretty JSON
    #[arg(long, global = true)]
    raw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health and channel state
    Health,
    /// Read or replace the snapshot
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Follow the live stream until Ctrl-C
    Watch {
        /// Print every envelope instead of per-change summaries
        #[arg(long)]
        envelopes: bool,
    },
    /// Agent sessions, feed and pending commands
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// QA handoffs
    Qa {
        #[command(subcommand)]
        command: QaCommands,
    },
    /// Voice assistant
    Jarvis {
        #[command(subcommand)]
        command: JarvisCommands,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsdeck=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let api_url = cli.api_url.trim_end_matches('/').to_string();
    let token = cli.token.as_deref();

    let code = match cli.command {
        Commands::Health => commands::health::run(&api_url, cli.raw).await,
        Commands::Snapshot { command } => {
            commands::snapshot::run(&api_url, token, cli.raw, command).await
        }
        Commands::Watch { envelopes } => commands::watch::run(&api_url, token, envelopes).await,
        Commands::Agent { command } => commands::agents::run(&api_url, token, cli.raw, command).await,
        Commands::Qa { command } => commands::qa::run(&api_url, token, cli.raw, command).await,
        Commands::Jarvis { command } => {
            commands::jarvis::run(&api_url, token, cli.raw, command).await
        }
    };

    std::process::exit(code);
}
