//! Process configuration, read once from `OPSDECK_*` environment variables.
//!
//! Malformed numbers never stop the server: they are logged and replaced by
//! the default.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use opsdeck_core::auth::hash_token;
use opsdeck_core::cooldown::CooldownSettings;

const DEFAULT_PORT: u16 = 7788;
const DEFAULT_HEARTBEAT_SECONDS: u64 = 15;
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000";
const DEFAULT_CHAT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_CHAT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_SPEECH_MODEL: &str = "tts-1";
const DEFAULT_SPEECH_VOICE: &str = "alloy";
const DEFAULT_SPEECH_TIMEOUT_SECONDS: u64 = 20;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// SHA-256 of the shared bearer token. `None` disables auth.
    pub token_hash: Option<String>,
    pub heartbeat_interval: Duration,
    pub cooldown: CooldownSettings,
    pub cors_origins: Vec<String>,
    pub jarvis: JarvisConfig,
}

#[derive(Debug, Clone)]
pub struct JarvisConfig {
    pub chat: ChatProviderConfig,
    pub speech_preferred: Option<SpeechProviderConfig>,
    pub speech_secondary: Option<SpeechProviderConfig>,
    pub allow_speech_fallback: bool,
}

/// OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct ChatProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Used for the single retry when the upstream rejects `model`.
    pub default_model: String,
    pub timeout: Duration,
}

/// OpenAI-compatible `/audio/speech` endpoint.
#[derive(Debug, Clone)]
pub struct SpeechProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let cooldown_defaults = CooldownSettings::default();
        let cooldown = CooldownSettings {
            hard_cooldown_seconds: parse_or(
                &lookup,
                "OPSDECK_HARD_COOLDOWN_SECONDS",
                cooldown_defaults.hard_cooldown_seconds,
            ),
            soft_cooldown_seconds: parse_or(
                &lookup,
                "OPSDECK_SOFT_COOLDOWN_SECONDS",
                cooldown_defaults.soft_cooldown_seconds,
            ),
        };

        let heartbeat_seconds = parse_or(
            &lookup,
            "OPSDECK_HEARTBEAT_SECONDS",
            DEFAULT_HEARTBEAT_SECONDS,
        )
        .max(1);

        let cors_origins = text("OPSDECK_CORS_ORIGINS")
            .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let chat_model = text("OPSDECK_CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string());
        let chat = ChatProviderConfig {
            base_url: text("OPSDECK_CHAT_BASE_URL")
                .unwrap_or_else(|| DEFAULT_CHAT_BASE_URL.to_string()),
            api_key: text("OPSDECK_CHAT_API_KEY"),
            default_model: text("OPSDECK_CHAT_DEFAULT_MODEL")
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            model: chat_model,
            timeout: Duration::from_secs(parse_or(
                &lookup,
                "OPSDECK_CHAT_TIMEOUT_SECONDS",
                DEFAULT_CHAT_TIMEOUT_SECONDS,
            )),
        };

        let speech_preferred = text("OPSDECK_SPEECH_PREFERRED_BASE_URL").map(|base_url| {
            speech_provider(&lookup, "PREFERRED", "preferred", base_url, None)
        });
        let speech_secondary = Some(speech_provider(
            &lookup,
            "SECONDARY",
            "secondary",
            text("OPSDECK_SPEECH_SECONDARY_BASE_URL").unwrap_or_else(|| chat.base_url.clone()),
            chat.api_key.clone(),
        ));

        Self {
            host: parse_or(&lookup, "OPSDECK_HOST", IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: parse_or(&lookup, "OPSDECK_PORT", DEFAULT_PORT),
            token_hash: text("OPSDECK_TOKEN").map(|token| hash_token(&token)),
            heartbeat_interval: Duration::from_secs(heartbeat_seconds),
            cooldown,
            cors_origins,
            jarvis: JarvisConfig {
                chat,
                speech_preferred,
                speech_secondary,
                allow_speech_fallback: parse_flag(&lookup, "OPSDECK_SPEECH_ALLOW_FALLBACK", true),
            },
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn auth_enabled(&self) -> bool {
        self.token_hash.is_some()
    }
}

fn speech_provider(
    lookup: &impl Fn(&str) -> Option<String>,
    slot: &str,
    default_name: &str,
    base_url: String,
    fallback_api_key: Option<String>,
) -> SpeechProviderConfig {
    let text = |suffix: &str| {
        lookup(&format!("OPSDECK_SPEECH_{slot}_{suffix}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    SpeechProviderConfig {
        name: text("NAME").unwrap_or_else(|| default_name.to_string()),
        base_url,
        api_key: text("API_KEY").or(fallback_api_key),
        model: text("MODEL").unwrap_or_else(|| DEFAULT_SPEECH_MODEL.to_string()),
        voice: text("VOICE").unwrap_or_else(|| DEFAULT_SPEECH_VOICE.to_string()),
        timeout: Duration::from_secs(parse_or(
            lookup,
            &format!("OPSDECK_SPEECH_{slot}_TIMEOUT_SECONDS"),
            DEFAULT_SPEECH_TIMEOUT_SECONDS,
        )),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return default;
    }
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = raw, %default, "invalid configuration value, using default");
            default
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") => default,
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        Some(other) => {
            tracing::warn!(key, value = other, default, "invalid boolean flag, using default");
            default
        }
    }
}
