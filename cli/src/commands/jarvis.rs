use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::Subcommand;
use serde_json::json;

use crate::util::{api_request, client, exit_error, put_opt};

#[derive(Subcommand)]
pub enum JarvisCommands {
    /// Ask the assistant about the current board
    Respond {
        prompt: String,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Synthesize speech for a line of text
    Speak {
        text: String,
        #[arg(long)]
        session_id: Option<String>,
        /// Write the returned MP3 here instead of printing the response
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
}

pub async fn run(api_url: &str, token: Option<&str>, raw: bool, command: JarvisCommands) -> i32 {
    match command {
        JarvisCommands::Respond { prompt, session_id } => {
            let mut body = json!({ "prompt": prompt });
            put_opt(&mut body, "sessionId", session_id);
            api_request(
                api_url,
                reqwest::Method::POST,
                "/jarvis/respond",
                token,
                Some(body),
                &[],
                raw,
            )
            .await
        }
        JarvisCommands::Speak {
            text,
            session_id,
            out,
        } => {
            let mut body = json!({ "text": text });
            put_opt(&mut body, "sessionId", session_id);
            match out {
                Some(path) => save_speech(api_url, token, body, &path).await,
                None => {
                    api_request(
                        api_url,
                        reqwest::Method::POST,
                        "/jarvis/speak",
                        token,
                        Some(body),
                        &[],
                        raw,
                    )
                    .await
                }
            }
        }
    }
}

async fn save_speech(
    api_url: &str,
    token: Option<&str>,
    body: serde_json::Value,
    path: &std::path::Path,
) -> i32 {
    let mut req = client().post(format!("{api_url}/jarvis/speak")).json(&body);
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }
    let response: serde_json::Value = match req.send().await.and_then(|r| r.error_for_status()) {
        Ok(r) => match r.json().await {
            Ok(v) => v,
            Err(e) => exit_error(&format!("Unreadable speech response: {e}"), None),
        },
        Err(e) => {
            eprintln!("{}", json!({"error": "request_failed", "message": e.to_string()}));
            return 3;
        }
    };

    let Some(audio) = decode_audio(&response) else {
        let reason = response["notice"]
            .as_str()
            .or_else(|| response["failureKind"].as_str())
            .unwrap_or("no audio returned");
        exit_error(&format!("Speech unavailable: {reason}"), None);
    };
    if let Err(e) = std::fs::write(path, &audio) {
        exit_error(&format!("Failed to write {}: {e}", path.display()), None);
    }
    println!(
        "{}",
        json!({
            "written": path.display().to_string(),
            "bytes": audio.len(),
            "provider": response["provider"],
        })
    );
    0
}

fn decode_audio(response: &serde_json::Value) -> Option<Vec<u8>> {
    let encoded = response["audioBase64"].as_str()?;
    STANDARD.decode(encoded).ok()
}
