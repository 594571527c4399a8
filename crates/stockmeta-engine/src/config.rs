use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use stockmeta_contracts::target::{WorkflowPatterns, DEFAULT_NEXT_PATTERN, DEFAULT_START_PATTERN};

use crate::bridge::PollPolicy;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1500);
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Runtime knobs of the engine. Persisted user settings live in
/// `stockmeta_contracts::settings`; these are deployment defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base: String,
    pub request_timeout: Duration,
    pub fetch_timeout: Duration,
    pub settle_delay: Duration,
    pub poll: PollPolicy,
    pub reply_timeout: Duration,
    pub patterns: WorkflowPatterns,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            poll: PollPolicy::default(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            patterns: WorkflowPatterns::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(non_empty_env)
    }

    /// Reads `GEMINI_API_BASE`, `STOCKMETA_START_PATTERN` and
    /// `STOCKMETA_NEXT_PATTERN` through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(api_base) = lookup("GEMINI_API_BASE") {
            config.api_base = normalize_api_base(&api_base);
        }
        let start = lookup("STOCKMETA_START_PATTERN");
        let next = lookup("STOCKMETA_NEXT_PATTERN");
        if start.is_some() || next.is_some() {
            let start = start.as_deref().unwrap_or(DEFAULT_START_PATTERN);
            let next = next.as_deref().unwrap_or(DEFAULT_NEXT_PATTERN);
            config.patterns = WorkflowPatterns::new(start, next)
                .with_context(|| format!("invalid workflow pattern ({start} / {next})"))?;
        }
        Ok(config)
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll.timeout = timeout;
        self
    }
}

fn normalize_api_base(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use stockmeta_contracts::target::Locator;

    use super::{EngineConfig, DEFAULT_API_BASE};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() -> anyhow::Result<()> {
        let config = EngineConfig::from_lookup(lookup(&[]))?;
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.settle_delay, Duration::from_millis(1500));
        assert_eq!(config.poll.max_attempts(), 10);
        Ok(())
    }

    #[test]
    fn api_base_override_drops_trailing_slash() -> anyhow::Result<()> {
        let config =
            EngineConfig::from_lookup(lookup(&[("GEMINI_API_BASE", "http://127.0.0.1:9/v1/")]))?;
        assert_eq!(config.api_base, "http://127.0.0.1:9/v1");
        Ok(())
    }

    #[test]
    fn pattern_override_keeps_other_default() -> anyhow::Result<()> {
        let config = EngineConfig::from_lookup(lookup(&[(
            "STOCKMETA_START_PATTERN",
            r"^https://stock\.test/upload",
        )]))?;
        assert!(config
            .patterns
            .is_start(&Locator::new("https://stock.test/upload")));
        assert!(config
            .patterns
            .is_next(&Locator::new("https://www.dreamstime.com/upload/edit2")));
        Ok(())
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let result = EngineConfig::from_lookup(lookup(&[("STOCKMETA_NEXT_PATTERN", "(")]));
        assert!(result.is_err());
    }
}
