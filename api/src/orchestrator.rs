//! Resilient calls to the text/speech upstream.
//!
//! Chat policy: a channel in cooldown is answered locally from snapshot
//! counts; otherwise the configured model is tried, with one retry on the
//! default model when the upstream rejects the model name and one retry on
//! timeout. Speech tries the preferred provider under its own timeout, then
//! the secondary when fallback is allowed, retrying the secondary once on
//! timeout. Terminal failures degrade the
//! channel; successes clear it. Nothing here returns an error to the caller.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::DateTime;
use opsdeck_core::cooldown::{Channel, CooldownSettings, CooldownSnapshot, CooldownTracker};
use opsdeck_core::failure::{FailureKind, UpstreamFailure};
use opsdeck_core::model::{AgentStatus, Snapshot};
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::{JarvisConfig, SpeechProviderConfig};
use crate::upstream::{ChatRequest, Upstream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReplyOrigin {
    Upstream,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JarvisReply {
    pub text: String,
    pub origin: ReplyOrigin,
    /// Model that produced `text`, when it came from the upstream.
    pub model: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Set once per cooldown window so the operator hears about it once.
    pub notice: Option<String>,
    pub channel: CooldownSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechOutcome {
    pub audio: Option<Vec<u8>>,
    pub provider: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub notice: Option<String>,
    pub channel: CooldownSnapshot,
}

pub struct RequestOrchestrator {
    upstream: Arc<dyn Upstream>,
    cooldowns: Mutex<CooldownTracker>,
    settings: CooldownSettings,
    config: JarvisConfig,
}

impl RequestOrchestrator {
    pub fn new(upstream: Arc<dyn Upstream>, config: JarvisConfig, settings: CooldownSettings) -> Self {
        Self {
            upstream,
            cooldowns: Mutex::new(CooldownTracker::new()),
            settings,
            config,
        }
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, CooldownTracker> {
        self.cooldowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channel_status(&self, channel: Channel) -> CooldownSnapshot {
        self.tracker().snapshot(channel)
    }

    pub async fn respond(&self, prompt: &str, snapshot: &Snapshot) -> JarvisReply {
        let status = self.channel_status(Channel::Chat);
        if status.degraded {
            tracing::debug!("chat channel in cooldown, answering locally");
            return self.fallback_reply(snapshot, status.failure_kind);
        }

        let request = ChatRequest {
            model: self.config.chat.model.clone(),
            system: system_prompt(snapshot),
            prompt: prompt.to_string(),
            timeout: self.config.chat.timeout,
        };
        match self.complete_with_retries(request).await {
            Ok((text, model)) => {
                self.tracker().clear(Channel::Chat);
                JarvisReply {
                    text,
                    origin: ReplyOrigin::Upstream,
                    model: Some(model),
                    failure_kind: None,
                    notice: None,
                    channel: self.channel_status(Channel::Chat),
                }
            }
            Err(failure) => {
                let cooldown = self
                    .tracker()
                    .note_failure(Channel::Chat, &failure, &self.settings);
                tracing::warn!(
                    failure = %failure,
                    until_ms = cooldown.until_ms,
                    "chat upstream failed, channel degraded"
                );
                self.fallback_reply(snapshot, Some(failure.kind))
            }
        }
    }

    async fn complete_with_retries(
        &self,
        mut request: ChatRequest,
    ) -> Result<(String, String), UpstreamFailure> {
        let default_model = &self.config.chat.default_model;
        let mut retried_model = false;
        let mut retried_timeout = false;
        loop {
            match self.upstream.complete_chat(&request).await {
                Ok(text) => return Ok((text, request.model)),
                Err(failure)
                    if !retried_model
                        && failure.mentions_unknown_model()
                        && request.model != *default_model =>
                {
                    tracing::info!(
                        model = %request.model,
                        default_model = %default_model,
                        "model rejected upstream, retrying with default"
                    );
                    retried_model = true;
                    request.model = default_model.clone();
                }
                Err(failure) if !retried_timeout && failure.kind == FailureKind::Timeout => {
                    tracing::info!(model = %request.model, "chat request timed out, retrying once");
                    retried_timeout = true;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    fn fallback_reply(&self, snapshot: &Snapshot, failure_kind: Option<FailureKind>) -> JarvisReply {
        let notice = self.take_notice(Channel::Chat);
        JarvisReply {
            text: local_summary(snapshot),
            origin: ReplyOrigin::Fallback,
            model: None,
            failure_kind,
            notice,
            channel: self.channel_status(Channel::Chat),
        }
    }

    pub async fn speak(&self, text: &str) -> SpeechOutcome {
        let status = self.channel_status(Channel::Speech);
        if status.degraded {
            return SpeechOutcome {
                audio: None,
                provider: None,
                failure_kind: status.failure_kind,
                notice: self.take_notice(Channel::Speech),
                channel: status,
            };
        }

        let preferred = self.config.speech_preferred.as_ref();
        let secondary = self.config.speech_secondary.as_ref();
        if preferred.is_none() && secondary.is_none() {
            return SpeechOutcome {
                audio: None,
                provider: None,
                failure_kind: None,
                notice: Some("No speech provider is configured.".to_string()),
                channel: status,
            };
        }

        let mut last_failure = None;
        if let Some(provider) = preferred {
            match self.synthesize_bounded(provider, text).await {
                Ok(audio) => return self.speech_success(provider, audio),
                Err(failure) => {
                    tracing::warn!(provider = %provider.name, failure = %failure, "preferred speech provider failed");
                    last_failure = Some(failure);
                }
            }
        }

        let try_secondary = preferred.is_none() || self.config.allow_speech_fallback;
        if let Some(provider) = secondary.filter(|_| try_secondary) {
            match self.synthesize_secondary(provider, text).await {
                Ok(audio) => return self.speech_success(provider, audio),
                Err(failure) => {
                    tracing::warn!(provider = %provider.name, failure = %failure, "secondary speech provider failed");
                    last_failure = Some(failure);
                }
            }
        }

        let failure = last_failure.unwrap_or_else(|| {
            UpstreamFailure::of_kind(FailureKind::Unknown, "no speech provider attempted")
        });
        let channel = self
            .tracker()
            .note_failure(Channel::Speech, &failure, &self.settings);
        SpeechOutcome {
            audio: None,
            provider: None,
            failure_kind: Some(failure.kind),
            notice: self.take_notice(Channel::Speech),
            channel,
        }
    }

    /// Last provider in line: a timeout earns one more attempt.
    async fn synthesize_secondary(
        &self,
        provider: &SpeechProviderConfig,
        text: &str,
    ) -> Result<Vec<u8>, UpstreamFailure> {
        match self.upstream.synthesize_speech(provider, text).await {
            Err(failure) if failure.kind == FailureKind::Timeout => {
                tracing::info!(provider = %provider.name, "speech request timed out, retrying once");
                self.upstream.synthesize_speech(provider, text).await
            }
            result => result,
        }
    }

    /// The preferred provider runs under its own deadline, independent of
    /// the client's request timeout.
    async fn synthesize_bounded(
        &self,
        provider: &SpeechProviderConfig,
        text: &str,
    ) -> Result<Vec<u8>, UpstreamFailure> {
        match tokio::time::timeout(provider.timeout, self.upstream.synthesize_speech(provider, text))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(UpstreamFailure::of_kind(
                FailureKind::Timeout,
                format!("{} did not answer within {:?}", provider.name, provider.timeout),
            )),
        }
    }

    fn speech_success(&self, provider: &SpeechProviderConfig, audio: Vec<u8>) -> SpeechOutcome {
        self.tracker().clear(Channel::Speech);
        SpeechOutcome {
            audio: Some(audio),
            provider: Some(provider.name.clone()),
            failure_kind: None,
            notice: None,
            channel: self.channel_status(Channel::Speech),
        }
    }

    fn take_notice(&self, channel: Channel) -> Option<String> {
        let mut tracker = self.tracker();
        if !tracker.should_warn(channel) {
            return None;
        }
        tracker.mark_warned(channel);
        let status = tracker.snapshot(channel);
        let kind = status
            .failure_kind
            .map(|k| k.as_str())
            .unwrap_or("unknown");
        let until = DateTime::from_timestamp_millis(status.until_ms)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| status.until_ms.to_string());
        Some(format!(
            "The {} upstream is unavailable ({kind}); using local fallback until {until}.",
            channel.as_str()
        ))
    }
}

fn system_prompt(snapshot: &Snapshot) -> String {
    let counts = snapshot.counts();
    let mut prompt = String::from(
        "You are Jarvis, the operations assistant for a coding-agent dashboard. \
         Answer briefly and only from the state below.\n",
    );
    prompt.push_str(&format!(
        "Sessions: {} ({} busy, {} waiting, {} error, {} offline). \
         Pending commands: {}. Open QA handoffs: {}.\n",
        counts.sessions,
        counts.with_status(AgentStatus::Busy),
        counts.with_status(AgentStatus::Waiting),
        counts.with_status(AgentStatus::Error),
        counts.with_status(AgentStatus::Offline),
        counts.pending_commands,
        counts.open_handoffs,
    ));
    for session in snapshot.sessions.iter().take(20) {
        prompt.push_str(&format!(
            "- {} ({}) {}: {}\n",
            session.agent_id,
            session.session_id,
            session.status.as_str(),
            session.summary
        ));
    }
    prompt
}

/// Offline reply built only from counts, so it cannot state anything the
/// snapshot does not hold.
pub fn local_summary(snapshot: &Snapshot) -> String {
    let counts = snapshot.counts();
    let mut by_status: Vec<String> = counts
        .sessions_by_status
        .iter()
        .map(|(status, n)| format!("{n} {}", status.as_str()))
        .collect();
    if by_status.is_empty() {
        by_status.push("none active".to_string());
    }
    format!(
        "I can't reach the language model right now. From local state: {} session(s) ({}), \
         {} pending command(s), {} open QA handoff(s).",
        counts.sessions,
        by_status.join(", "),
        counts.pending_commands,
        counts.open_handoffs,
    )
}
