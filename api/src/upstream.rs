//! Clients for the OpenAI-compatible text and speech endpoints.
//!
//! Every failure leaves here already classified as an [`UpstreamFailure`];
//! callers never see raw transport errors.

use std::time::Duration;

use async_trait::async_trait;
use opsdeck_core::failure::{FailureKind, UpstreamFailure};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use crate::config::{ChatProviderConfig, SpeechProviderConfig};

/// Upper bound for error bodies kept in failure details.
const MAX_DETAIL_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub timeout: Duration,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Text completion; returns the assistant message.
    async fn complete_chat(&self, request: &ChatRequest) -> Result<String, UpstreamFailure>;

    /// Text to speech; returns encoded audio bytes.
    async fn synthesize_speech(
        &self,
        provider: &SpeechProviderConfig,
        text: &str,
    ) -> Result<Vec<u8>, UpstreamFailure>;
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct SpeechBody<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'a str,
}

pub struct HttpUpstream {
    client: reqwest::Client,
    chat: ChatProviderConfig,
}

impl HttpUpstream {
    pub fn new(chat: ChatProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            chat,
        }
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: String,
        api_key: Option<&str>,
        body: &T,
        timeout: Duration,
    ) -> Result<reqwest::Response, UpstreamFailure> {
        let mut request = self.client.post(&url).json(body).timeout(timeout);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|err| classify_reqwest(&err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = retry_after_seconds(response.headers());
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(url = %url, status = %status, "upstream returned non-success status");
        Err(UpstreamFailure::http(
            status.as_u16(),
            truncate(&body, MAX_DETAIL_CHARS),
            retry_after,
        ))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn complete_chat(&self, request: &ChatRequest) -> Result<String, UpstreamFailure> {
        let body = ChatCompletionBody {
            model: &request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
        };
        let response = self
            .post_json(
                endpoint(&self.chat.base_url, "chat/completions"),
                self.chat.api_key.as_deref(),
                &body,
                request.timeout,
            )
            .await?;
        let parsed = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| classify_reqwest(&err))?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                UpstreamFailure::of_kind(FailureKind::Unknown, "completion had no message content")
            })
    }

    async fn synthesize_speech(
        &self,
        provider: &SpeechProviderConfig,
        text: &str,
    ) -> Result<Vec<u8>, UpstreamFailure> {
        let body = SpeechBody {
            model: &provider.model,
            voice: &provider.voice,
            input: text,
            response_format: "mp3",
        };
        let response = self
            .post_json(
                endpoint(&provider.base_url, "audio/speech"),
                provider.api_key.as_deref(),
                &body,
                provider.timeout,
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| classify_reqwest(&err))?;
        if bytes.is_empty() {
            return Err(UpstreamFailure::of_kind(
                FailureKind::Unknown,
                "speech response was empty",
            ));
        }
        Ok(bytes.to_vec())
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

/// Integer `retry-after` seconds. HTTP-date values are ignored.
fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn classify_reqwest(err: &reqwest::Error) -> UpstreamFailure {
    if err.is_timeout() {
        UpstreamFailure::of_kind(FailureKind::Timeout, err.to_string())
    } else if err.is_connect() || err.is_request() {
        UpstreamFailure::of_kind(FailureKind::Network, err.to_string())
    } else {
        UpstreamFailure::transport(err.to_string())
    }
}

/// Cut `text` after `max_chars` characters, marking the cut with `...`.
pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}
