//! Configuration types for clock-updater

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Directory (under the root) holding the feed and index caches
pub const CACHE_DIR: &str = "cache";
/// Published data feed file name
pub const FEED_FILE: &str = "clock.json";
/// Last fetched pack index file name
pub const INDEX_FILE: &str = "packs.json";

/// Retry and recheck timing for the update cycle
///
/// All durations are measured against the monotonic clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first attempt after boot (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Delay before retrying after a failed cycle (default: 15 seconds)
    #[serde(default = "default_failure_interval", with = "duration_serde")]
    pub failure_interval: Duration,

    /// Delay before rechecking after a successful cycle (default: 1 hour)
    #[serde(default = "default_success_interval", with = "duration_serde")]
    pub success_interval: Duration,

    /// Growth factor applied per consecutive failure (default: 1.0 = fixed interval)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for the grown failure delay (default: 15 minutes)
    #[serde(default = "default_max_failure_interval", with = "duration_serde")]
    pub max_failure_interval: Duration,

    /// Add random jitter to failure delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            failure_interval: default_failure_interval(),
            success_interval: default_success_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            max_failure_interval: default_max_failure_interval(),
            jitter: false,
        }
    }
}

/// Network transfer settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Abandon a transfer when no bytes arrive for this long (default: 30 seconds)
    #[serde(default = "default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,

    /// Abandon a connection attempt after this long (default: 15 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Largest chunk handed out by a single read (default: 4096 bytes)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks buffered between the transport and the reader (default: 4)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            connect_timeout: default_connect_timeout(),
            chunk_size: default_chunk_size(),
            channel_capacity: default_channel_capacity(),
            user_agent: default_user_agent(),
        }
    }
}

/// Main configuration for the update pipeline
///
/// Injected into [`UpdatePipeline`](crate::pipeline::UpdatePipeline) at
/// construction; the pipeline never reads process-wide preferences.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the clock data feed; telemetry is appended as query parameters
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// URL of the pack index document
    #[serde(default = "default_update_url")]
    pub update_url: String,

    /// Filesystem root holding `cache/` and the pack directories (default: "/")
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// No update work is done before this wall-clock time
    #[serde(default)]
    pub updates_paused_until: Option<DateTime<Utc>>,

    /// Retry and recheck timing
    #[serde(default)]
    pub retry: RetryConfig,

    /// Network transfer settings
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            update_url: default_update_url(),
            root_dir: default_root_dir(),
            updates_paused_until: None,
            retry: RetryConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file; absent fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read config '{}': {}", path.display(), e),
            ))
        })?;
        let config: Config = serde_json::from_slice(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings the pipeline cannot run without
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [("api_url", &self.api_url), ("update_url", &self.update_url)] {
            url::Url::parse(value).map_err(|e| Error::Config {
                message: format!("{key} is not a valid URL: {e}"),
                key: Some(key.to_string()),
            })?;
        }
        if self.fetch.chunk_size == 0 {
            return Err(Error::Config {
                message: "chunk_size must be greater than zero".to_string(),
                key: Some("fetch.chunk_size".to_string()),
            });
        }
        if self.fetch.channel_capacity == 0 {
            return Err(Error::Config {
                message: "channel_capacity must be greater than zero".to_string(),
                key: Some("fetch.channel_capacity".to_string()),
            });
        }
        Ok(())
    }

    /// Cache directory (`<root>/cache`)
    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir.join(CACHE_DIR)
    }

    /// Published data feed (`<root>/cache/clock.json`)
    pub fn feed_path(&self) -> PathBuf {
        self.cache_dir().join(FEED_FILE)
    }

    /// Last fetched pack index (`<root>/cache/packs.json`)
    pub fn index_path(&self) -> PathBuf {
        self.cache_dir().join(INDEX_FILE)
    }
}

// Default value functions
fn default_api_url() -> String {
    "https://api.climateclock.world/v1/clock".to_string()
}

fn default_update_url() -> String {
    "https://zestyping.github.io/cclock/packs.json".to_string()
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/")
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_failure_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_success_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_max_failure_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_chunk_size() -> usize {
    4096
}

fn default_channel_capacity() -> usize {
    4
}

fn default_user_agent() -> String {
    concat!("clock-updater/", env!("CARGO_PKG_VERSION")).to_string()
}

// Duration serialization helper (milliseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_reference_intervals() {
        let config = Config::default();
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry.failure_interval, Duration::from_secs(15));
        assert_eq!(config.retry.success_interval, Duration::from_secs(3600));
        assert!(!config.retry.jitter);
        assert!(config.updates_paused_until.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths_resolve_against_root() {
        let config = Config {
            root_dir: PathBuf::from("/mnt/flash"),
            ..Default::default()
        };
        assert_eq!(config.feed_path(), PathBuf::from("/mnt/flash/cache/clock.json"));
        assert_eq!(config.index_path(), PathBuf::from("/mnt/flash/cache/packs.json"));
    }

    #[test]
    fn test_from_file_partial_document() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "update_url": "http://updates.local/packs.json",
                "updates_paused_until": "2030-01-01T00:00:00Z",
                "retry": { "failure_interval": 2000 }
            }"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.update_url, "http://updates.local/packs.json");
        assert_eq!(config.retry.failure_interval, Duration::from_secs(2));
        assert_eq!(config.retry.success_interval, Duration::from_secs(3600));
        assert_eq!(
            config.updates_paused_until.unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_from_file_rejects_bad_url() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{ "api_url": "not a url" }"#).unwrap();

        match Config::from_file(&path) {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("api_url")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_from_file_missing() {
        let temp_dir = TempDir::new().unwrap();
        let result = Config::from_file(&temp_dir.path().join("absent.json"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_serialization_round_trip_keeps_millis() {
        let config = Config::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["retry"]["failure_interval"], 15_000);
        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
