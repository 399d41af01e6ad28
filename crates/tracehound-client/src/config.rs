//! Client configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for [`TraceClient`](crate::TraceClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Gateway WebSocket URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Stamped on events that carry no project name.
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Queue capacity; beyond it the oldest events are evicted.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Attempts that use exponential backoff before falling back to the fixed interval.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_fallback_retry_interval_ms")]
    pub fallback_retry_interval_ms: u64,
}

fn default_url() -> String {
    "ws://127.0.0.1:4319/ingest".to_string()
}

fn default_project_name() -> String {
    "default".to_string()
}

fn default_batch_interval_ms() -> u64 {
    100
}

fn default_max_batch_size() -> usize {
    50
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

fn default_fallback_retry_interval_ms() -> u64 {
    30_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            project_name: default_project_name(),
            batch_interval_ms: default_batch_interval_ms(),
            max_batch_size: default_max_batch_size(),
            max_queue_size: default_max_queue_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            fallback_retry_interval_ms: default_fallback_retry_interval_ms(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by any `TRACEHOUND_*` variables that are set and parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("TRACEHOUND_URL") {
            config.url = url;
        }
        if let Ok(project) = env::var("TRACEHOUND_PROJECT") {
            config.project_name = project;
        }
        override_from_env(&mut config.batch_interval_ms, "TRACEHOUND_BATCH_INTERVAL_MS");
        override_from_env(&mut config.max_batch_size, "TRACEHOUND_MAX_BATCH_SIZE");
        override_from_env(&mut config.max_queue_size, "TRACEHOUND_MAX_QUEUE_SIZE");
        override_from_env(&mut config.connect_timeout_ms, "TRACEHOUND_CONNECT_TIMEOUT_MS");
        override_from_env(&mut config.max_reconnect_attempts, "TRACEHOUND_MAX_RECONNECT_ATTEMPTS");
        override_from_env(&mut config.reconnect_base_delay_ms, "TRACEHOUND_RECONNECT_BASE_DELAY_MS");
        override_from_env(&mut config.reconnect_max_delay_ms, "TRACEHOUND_RECONNECT_MAX_DELAY_MS");
        override_from_env(&mut config.fallback_retry_interval_ms, "TRACEHOUND_FALLBACK_RETRY_INTERVAL_MS");
        config
    }

    pub fn with_project_name(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = project_name.into();
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_base_delay_ms = base_delay.as_millis() as u64;
        self.reconnect_max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    pub fn with_fallback_retry_interval(mut self, interval: Duration) -> Self {
        self.fallback_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms.max(1))
    }

    /// Events per flushed batch; never zero.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn override_from_env<T: FromStr>(field: &mut T, key: &str) {
    if let Some(value) = env::var(key).ok().and_then(|v| v.parse().ok()) {
        *field = value;
    }
}
