use std::env;
use std::time::Duration;

/// Default base URL of the study service.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";

/// Connection settings for the remote study service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            token: None,
        }
    }
}

impl ApiConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            token: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.trim().is_empty() {
            None
        } else {
            Some(token)
        };
        self
    }

    /// Read `READER_API_BASE_URL` and `READER_API_TOKEN` from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base_url = lookup("READER_API_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let config = Self::new(base_url);
        match lookup("READER_API_TOKEN") {
            Some(token) => config.with_token(token),
            None => config,
        }
    }

    /// Join an `/api/...` path onto the base URL.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// Per-session tunables for scheduling, polling and caching.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub block_size: u32,
    pub human_ai_probability: f64,
    pub poll_interval: Duration,
    pub cache_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_size: 10,
            human_ai_probability: 0.5,
            poll_interval: Duration::from_secs(6),
            cache_key: "caseProgress".to_string(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_human_ai_probability(mut self, probability: f64) -> Self {
        self.human_ai_probability = probability.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = key.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ApiConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ApiConfig::default());
        assert_eq!(config.url("/api/game/next"), "http://localhost:8000/api/game/next");
    }

    #[test]
    fn strips_trailing_slash_and_blank_token() {
        let config = ApiConfig::from_lookup(lookup(&[
            ("READER_API_BASE_URL", "https://study.example.org/"),
            ("READER_API_TOKEN", "  "),
        ]));
        assert_eq!(config.base_url, "https://study.example.org");
        assert_eq!(config.token, None);
    }

    #[test]
    fn keeps_token() {
        let config = ApiConfig::from_lookup(lookup(&[("READER_API_TOKEN", "abc")]));
        assert_eq!(config.token.as_deref(), Some("abc"));
    }

    #[test]
    fn session_defaults_and_overrides() {
        let config = SessionConfig::default();
        assert_eq!(config.block_size, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(6));
        assert_eq!(config.cache_key, "caseProgress");

        let tuned = config
            .with_block_size(4)
            .with_human_ai_probability(1.7)
            .with_cache_key("reader-2");
        assert_eq!(tuned.block_size, 4);
        assert!((tuned.human_ai_probability - 1.0).abs() < f64::EPSILON);
        assert_eq!(tuned.cache_key, "reader-2");
    }
}
