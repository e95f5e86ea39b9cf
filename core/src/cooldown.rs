//! Per-channel circuit breaker for the upstream text/speech API.
//!
//! Cooldowns only ever extend within a tracker's lifetime; a success clears
//! them outright. Expired cooldowns are pruned lazily on read.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::failure::{FailureKind, UpstreamFailure};

/// Upper bound for any single cooldown, hinted or configured.
pub const MAX_COOLDOWN_SECONDS: u64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Chat,
    Speech,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Chat => "chat",
            Channel::Speech => "speech",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownSettings {
    pub hard_cooldown_seconds: u64,
    pub soft_cooldown_seconds: u64,
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            hard_cooldown_seconds: 900,
            soft_cooldown_seconds: 120,
        }
    }
}

/// How long a failure should suppress the channel.
pub fn cooldown_seconds(failure: &UpstreamFailure, settings: &CooldownSettings) -> u64 {
    let seconds = match failure.retry_after_seconds {
        Some(hint) if hint > 0 => hint,
        _ if failure.kind.is_hard() => settings.hard_cooldown_seconds,
        _ => settings.soft_cooldown_seconds,
    };
    seconds.min(MAX_COOLDOWN_SECONDS)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CooldownState {
    /// Epoch millis; 0 means not degraded.
    pub until_ms: i64,
    pub failure_kind: Option<FailureKind>,
    /// `until_ms` value the operator was last warned about.
    pub warned_until_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CooldownSnapshot {
    pub degraded: bool,
    pub failure_kind: Option<FailureKind>,
    pub until_ms: i64,
}

#[derive(Debug, Default)]
pub struct CooldownTracker {
    chat: CooldownState,
    speech: CooldownState,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mut(&mut self, channel: Channel) -> &mut CooldownState {
        match channel {
            Channel::Chat => &mut self.chat,
            Channel::Speech => &mut self.speech,
        }
    }

    pub fn note_failure(
        &mut self,
        channel: Channel,
        failure: &UpstreamFailure,
        settings: &CooldownSettings,
    ) -> CooldownSnapshot {
        self.note_failure_at(channel, failure, settings, now_ms())
    }

    pub fn note_failure_at(
        &mut self,
        channel: Channel,
        failure: &UpstreamFailure,
        settings: &CooldownSettings,
        now_ms: i64,
    ) -> CooldownSnapshot {
        let seconds = cooldown_seconds(failure, settings);
        let target = now_ms + (seconds as i64) * 1000;
        let state = self.state_mut(channel);
        state.until_ms = state.until_ms.max(target);
        state.failure_kind = Some(failure.kind);
        self.snapshot_at(channel, now_ms)
    }

    /// Reset the channel after an observed success.
    pub fn clear(&mut self, channel: Channel) {
        *self.state_mut(channel) = CooldownState::default();
    }

    pub fn snapshot(&mut self, channel: Channel) -> CooldownSnapshot {
        self.snapshot_at(channel, now_ms())
    }

    pub fn snapshot_at(&mut self, channel: Channel, now_ms: i64) -> CooldownSnapshot {
        let state = self.state_mut(channel);
        if state.until_ms != 0 && state.until_ms <= now_ms {
            *state = CooldownState::default();
        }
        CooldownSnapshot {
            degraded: state.until_ms > now_ms,
            failure_kind: state.failure_kind,
            until_ms: state.until_ms,
        }
    }

    pub fn is_degraded(&mut self, channel: Channel) -> bool {
        self.snapshot(channel).degraded
    }

    /// True when the current cooldown window has not been announced yet,
    /// including when a new failure pushed `until_ms` past the warned value.
    pub fn should_warn(&mut self, channel: Channel) -> bool {
        self.should_warn_at(channel, now_ms())
    }

    pub fn should_warn_at(&mut self, channel: Channel, now_ms: i64) -> bool {
        let snapshot = self.snapshot_at(channel, now_ms);
        snapshot.degraded && snapshot.until_ms > self.state_mut(channel).warned_until_ms
    }

    pub fn mark_warned(&mut self, channel: Channel) {
        let state = self.state_mut(channel);
        state.warned_until_ms = state.until_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_750_000_000_000;

    fn settings() -> CooldownSettings {
        CooldownSettings {
            hard_cooldown_seconds: 600,
            soft_cooldown_seconds: 60,
        }
    }

    fn rate_limited(retry_after: u64) -> UpstreamFailure {
        UpstreamFailure::http(429, "too many requests", Some(retry_after))
    }

    #[test]
    fn cooldown_never_shortens() {
        let mut tracker = CooldownTracker::new();
        let first = tracker.note_failure_at(Channel::Chat, &rate_limited(10), &settings(), T0);
        assert_eq!(first.until_ms, T0 + 10_000);

        let second =
            tracker.note_failure_at(Channel::Chat, &rate_limited(5), &settings(), T0 + 1_000);
        assert_eq!(second.until_ms, T0 + 10_000);
        assert!(second.degraded);
    }

    #[test]
    fn clear_ends_degradation() {
        let mut tracker = CooldownTracker::new();
        tracker.note_failure_at(
            Channel::Speech,
            &UpstreamFailure::http(401, "bad key", None),
            &settings(),
            T0,
        );
        assert!(tracker.snapshot_at(Channel::Speech, T0 + 1).degraded);
        tracker.clear(Channel::Speech);
        let snapshot = tracker.snapshot_at(Channel::Speech, T0 + 1);
        assert!(!snapshot.degraded);
        assert_eq!(snapshot.failure_kind, None);
        assert_eq!(snapshot.until_ms, 0);
    }

    #[test]
    fn channels_are_independent() {
        let mut tracker = CooldownTracker::new();
        tracker.note_failure_at(Channel::Chat, &rate_limited(30), &settings(), T0);
        assert!(tracker.snapshot_at(Channel::Chat, T0).degraded);
        assert!(!tracker.snapshot_at(Channel::Speech, T0).degraded);
    }

    #[test]
    fn cooldown_length_follows_kind_and_caps() {
        let s = settings();
        assert_eq!(
            cooldown_seconds(&UpstreamFailure::http(403, "", None), &s),
            600
        );
        assert_eq!(
            cooldown_seconds(&UpstreamFailure::http(502, "", None), &s),
            60
        );
        assert_eq!(
            cooldown_seconds(&UpstreamFailure::transport("timed out"), &s),
            60
        );
        assert_eq!(cooldown_seconds(&rate_limited(99_999), &s), MAX_COOLDOWN_SECONDS);
        let generous = CooldownSettings {
            hard_cooldown_seconds: 7200,
            soft_cooldown_seconds: 10,
        };
        assert_eq!(
            cooldown_seconds(&UpstreamFailure::http(401, "", None), &generous),
            MAX_COOLDOWN_SECONDS
        );
    }

    #[test]
    fn expired_cooldown_is_pruned_on_read() {
        let mut tracker = CooldownTracker::new();
        tracker.note_failure_at(Channel::Chat, &rate_limited(10), &settings(), T0);
        let snapshot = tracker.snapshot_at(Channel::Chat, T0 + 10_000);
        assert!(!snapshot.degraded);
        assert_eq!(snapshot.failure_kind, None);
        assert_eq!(snapshot.until_ms, 0);
    }

    #[test]
    fn warning_fires_once_per_window_and_rearms_on_extension() {
        let mut tracker = CooldownTracker::new();
        assert!(!tracker.should_warn_at(Channel::Chat, T0));

        tracker.note_failure_at(Channel::Chat, &rate_limited(10), &settings(), T0);
        assert!(tracker.should_warn_at(Channel::Chat, T0));
        tracker.mark_warned(Channel::Chat);
        assert!(!tracker.should_warn_at(Channel::Chat, T0 + 500));

        // Same window, shorter hint: no extension, no new warning.
        tracker.note_failure_at(Channel::Chat, &rate_limited(2), &settings(), T0 + 1_000);
        assert!(!tracker.should_warn_at(Channel::Chat, T0 + 1_000));

        // Extension past the warned value re-arms.
        tracker.note_failure_at(Channel::Chat, &rate_limited(30), &settings(), T0 + 2_000);
        assert!(tracker.should_warn_at(Channel::Chat, T0 + 2_000));
    }
}
