//! Engine configuration: YAML file first, then environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use threadline_core::DEFAULT_THREAD_PATH_PREFIX;
use threadline_transport::{BackoffPolicy, HttpClientConfig};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "threadline.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub endpoints: EndpointsConfig,
    pub batch: BatchConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub thread_sync: ThreadSyncConfig,
    pub http: HttpConfig,
    pub snapshots: SnapshotConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub batch_url: String,
    pub thread_sync_url: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            batch_url: "http://localhost:8787/api/ingest/batch".to_string(),
            thread_sync_url: "http://localhost:8787/api/threads/sync".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub debounce_ms: u64,
    pub max_field_chars: usize,
    pub allowed_fields: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            debounce_ms: 5_000,
            max_field_chars: 5_000,
            allowed_fields: [
                "key",
                "profile_id",
                "profile_url",
                "name",
                "headline",
                "location",
                "company",
                "title",
                "about",
                "experience",
                "education",
                "skills",
                "connection_degree",
                "source",
                "captured_at",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl BatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub limit: usize,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub threshold: usize,
    pub window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadSyncConfig {
    pub debounce_ms: u64,
    pub throttle_ms: u64,
    pub retry_delay_ms: u64,
    pub thread_path_prefix: String,
}

impl Default for ThreadSyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_200,
            throttle_ms: 10_000,
            retry_delay_ms: 2_000,
            thread_path_prefix: DEFAULT_THREAD_PATH_PREFIX.to_string(),
        }
    }
}

impl ThreadSyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            user_agent: "threadline/0.1".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub threads_dir: PathBuf,
    pub profiles_dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            threads_dir: PathBuf::from("./fixtures/threads"),
            profiles_dir: PathBuf::from("./fixtures/profiles"),
        }
    }
}

impl SyncConfig {
    /// Load `THREADLINE_CONFIG` (or `threadline.yaml` when present), then apply
    /// environment overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("THREADLINE_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            });
        Self::load(path.as_deref())
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("THREADLINE_BATCH_URL") {
            self.endpoints.batch_url = url;
        }
        if let Some(url) = lookup("THREADLINE_THREAD_SYNC_URL") {
            self.endpoints.thread_sync_url = url;
        }
        if let Some(secs) = lookup("THREADLINE_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http.timeout_secs = secs;
        }
        if let Some(agent) = lookup("THREADLINE_USER_AGENT") {
            self.http.user_agent = agent;
        }
        if let Some(dir) = lookup("THREADLINE_SNAPSHOT_DIR") {
            let root = PathBuf::from(dir);
            self.snapshots.threads_dir = root.join("threads");
            self.snapshots.profiles_dir = root.join("profiles");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch.max_batch_size", self.batch.max_batch_size as u64),
            ("batch.max_field_chars", self.batch.max_field_chars as u64),
            ("rate_limit.limit", self.rate_limit.limit as u64),
            ("rate_limit.window_ms", self.rate_limit.window_ms),
            ("breaker.threshold", self.breaker.threshold as u64),
            ("breaker.window_ms", self.breaker.window_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        for (field, url) in [
            ("endpoints.batch_url", &self.endpoints.batch_url),
            ("endpoints.thread_sync_url", &self.endpoints.thread_sync_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("`{url}` is not an http(s) URL"),
                });
            }
        }
        if !self.thread_sync.thread_path_prefix.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "thread_sync.thread_path_prefix",
                reason: "must start with `/`".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.batch.max_batch_size, 10);
        assert_eq!(config.batch.debounce(), Duration::from_secs(5));
        assert_eq!(config.rate_limit.limit, 60);
        assert_eq!(config.breaker.threshold, 5);
        assert_eq!(config.retry.policy(), BackoffPolicy::default());
        assert_eq!(config.thread_sync.debounce(), Duration::from_millis(1200));
        assert_eq!(config.thread_sync.throttle(), Duration::from_secs(10));
        assert_eq!(config.thread_sync.retry_delay(), Duration::from_secs(2));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("threadline.yaml");
        std::fs::write(
            &path,
            "batch:\n  max_batch_size: 25\nthread_sync:\n  throttle_ms: 500\n",
        )
        .unwrap();

        let config = SyncConfig::from_yaml_file(&path).expect("parse");
        assert_eq!(config.batch.max_batch_size, 25);
        assert_eq!(config.batch.debounce_ms, 5_000);
        assert_eq!(config.thread_sync.throttle_ms, 500);
        assert_eq!(config.thread_sync.debounce_ms, 1_200);
    }

    #[test]
    fn env_overrides_apply_after_file() {
        let env: HashMap<&str, &str> = [
            ("THREADLINE_BATCH_URL", "https://api.example.test/batch"),
            ("THREADLINE_HTTP_TIMEOUT_SECS", "7"),
            ("THREADLINE_SNAPSHOT_DIR", "/data/captures"),
        ]
        .into_iter()
        .collect();
        let mut config = SyncConfig::default();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.endpoints.batch_url, "https://api.example.test/batch");
        assert_eq!(config.http.timeout_secs, 7);
        assert_eq!(
            config.snapshots.threads_dir,
            PathBuf::from("/data/captures/threads")
        );
        assert_eq!(
            config.endpoints.thread_sync_url,
            EndpointsConfig::default().thread_sync_url
        );
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = SyncConfig::default();
        config.rate_limit.limit = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limit.limit"));

        let mut config = SyncConfig::default();
        config.endpoints.batch_url = "ftp://nope".into();
        assert!(config.validate().is_err());
    }
}
