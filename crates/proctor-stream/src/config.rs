use std::str::FromStr;
use std::time::Duration;

use crate::error::StreamError;
use crate::reconnect::ReconnectPolicy;

/// Public STUN servers used when none are configured. No TURN relay is used.
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub signaling_url: String,
    pub stun_urls: Vec<String>,
    /// Upper bound on time spent negotiating (or disconnected) before a link fails.
    pub negotiation_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8090/ws".to_string(),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|url| url.to_string()).collect(),
            negotiation_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Result<Self, StreamError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, StreamError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("PROCTOR_SIGNALING_URL") {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(StreamError::Config(format!(
                    "PROCTOR_SIGNALING_URL must be a ws:// or wss:// URL, got `{url}`"
                )));
            }
            config.signaling_url = url;
        }
        if let Some(urls) = lookup("PROCTOR_STUN_URLS") {
            config.stun_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = parse::<u64>(&lookup, "PROCTOR_NEGOTIATION_TIMEOUT_SECS")? {
            config.negotiation_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "PROCTOR_RECONNECT_INITIAL_MS")? {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "PROCTOR_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = parse::<f64>(&lookup, "PROCTOR_RECONNECT_MULTIPLIER")? {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(StreamError::Config(
                    "PROCTOR_RECONNECT_MULTIPLIER must be at least 1.0".to_string(),
                ));
            }
            config.reconnect.multiplier = multiplier;
        }
        if let Some(attempts) = parse::<u32>(&lookup, "PROCTOR_RECONNECT_DEGRADED_AFTER")? {
            config.reconnect.degraded_after = attempts;
        }
        if let Some(secs) = parse::<u64>(&lookup, "PROCTOR_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        if config.reconnect.max_delay < config.reconnect.initial_delay {
            return Err(StreamError::Config(
                "reconnect ceiling is below the initial delay".to_string(),
            ));
        }
        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, StreamError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| StreamError::Config(format!("{key}: {err}"))),
    }
}
