//! Client configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Runtime settings shared by the HTTP client, cache and coordinator.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL all endpoint paths are joined onto (includes the `/api` prefix).
    pub api_base_url: String,
    /// Per-request timeout enforced by the HTTP client.
    pub request_timeout: Duration,
    /// Directory for persisted credentials. `None` uses the platform config dir.
    pub config_dir: Option<PathBuf>,
    pub query_retry: RetryPolicy,
    pub mutation_retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            config_dir: None,
            query_retry: RetryPolicy::query(),
            mutation_retry: RetryPolicy::mutation(),
        }
    }
}

impl ClientConfig {
    /// Read configuration from the environment.
    ///
    /// Environment variables:
    /// - `EVENTSUB_API_URL`: API base URL (default: "http://localhost:8080/api")
    /// - `EVENTSUB_TIMEOUT_SECS`: request timeout in seconds (default: 30)
    /// - `EVENTSUB_CONFIG_DIR`: credential directory (default: platform config dir)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let api_base_url = lookup("EVENTSUB_API_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.api_base_url);

        let request_timeout = match lookup("EVENTSUB_TIMEOUT_SECS").map(|v| v.trim().parse::<u64>()) {
            Some(Ok(secs)) if secs > 0 => Duration::from_secs(secs),
            Some(_) => {
                tracing::warn!("ignoring invalid EVENTSUB_TIMEOUT_SECS, using default");
                defaults.request_timeout
            }
            None => defaults.request_timeout,
        };

        let config_dir = lookup("EVENTSUB_CONFIG_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self {
            api_base_url,
            request_timeout,
            config_dir,
            ..defaults
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = base_url.into();
        self
    }
}
