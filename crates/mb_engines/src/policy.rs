#![forbid(unsafe_code)]

use std::env;

pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;
pub const MINUTE_MS: u64 = 60 * 1000;

/// Timing knobs shared by every context taking part in attribution recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributionPolicy {
    /// Landing and background-held attribution older than this is discarded.
    pub retention_ms: u64,
    /// An install intent corroborates a fingerprint match only while younger than this.
    pub install_intent_window_ms: u64,
    /// Upper bound on a cross-context request/response exchange.
    pub message_timeout_ms: u64,
}

impl AttributionPolicy {
    pub fn mvp_v1() -> Self {
        Self {
            retention_ms: 30 * DAY_MS,
            install_intent_window_ms: 30 * MINUTE_MS,
            message_timeout_ms: 1_000,
        }
    }

    /// Reads overrides from the environment; out-of-range or unparsable values keep the
    /// `mvp_v1` default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::mvp_v1();
        let bounded = |key: &str, min: u64, max: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| (min..=max).contains(v))
        };
        Self {
            retention_ms: bounded("MB_ATTRIBUTION_RETENTION_DAYS", 1, 365)
                .map(|days| days * DAY_MS)
                .unwrap_or(defaults.retention_ms),
            install_intent_window_ms: bounded("MB_INSTALL_INTENT_WINDOW_MINUTES", 1, 1_440)
                .map(|minutes| minutes * MINUTE_MS)
                .unwrap_or(defaults.install_intent_window_ms),
            message_timeout_ms: bounded("MB_CONTEXT_MESSAGE_TIMEOUT_MS", 50, 10_000)
                .unwrap_or(defaults.message_timeout_ms),
        }
    }
}

impl Default for AttributionPolicy {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_policy_01_defaults_match_mvp_windows() {
        let policy = AttributionPolicy::mvp_v1();
        assert_eq!(policy.retention_ms, 2_592_000_000);
        assert_eq!(policy.install_intent_window_ms, 1_800_000);
        assert_eq!(policy.message_timeout_ms, 1_000);
        assert_eq!(AttributionPolicy::from_lookup(|_| None), policy);
    }

    #[test]
    fn at_policy_02_overrides_apply_within_bounds_only() {
        let policy = AttributionPolicy::from_lookup(|key| match key {
            "MB_ATTRIBUTION_RETENTION_DAYS" => Some("7".to_string()),
            "MB_INSTALL_INTENT_WINDOW_MINUTES" => Some("99999".to_string()),
            "MB_CONTEXT_MESSAGE_TIMEOUT_MS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(policy.retention_ms, 7 * DAY_MS);
        assert_eq!(policy.install_intent_window_ms, 30 * MINUTE_MS);
        assert_eq!(policy.message_timeout_ms, 1_000);
    }
}
