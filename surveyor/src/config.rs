//! Configuration for a discovery run.
//!
//! All sections have serde defaults so a partial TOML file (or none at
//! all) yields a usable configuration. Validation failures are
//! `FatalConfig`: a bad config aborts the session before any query runs.

use crate::errors::{DiscoveryError, DiscoveryResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyorConfig {
    pub limiter: LimiterConfig,
    pub retry: RetryConfig,
    pub progress: ProgressConfig,
    pub executor: ExecutorConfig,
}

/// Admission control over calls into the remote API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Hard cap on task starts in any 60-second window. Also the token
    /// bucket capacity.
    pub queries_per_minute: u32,
    /// Maximum tasks in flight at once.
    pub max_concurrent: usize,
    /// How often the dispatch loop emits advisory stats.
    pub stats_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            queries_per_minute: 60,
            max_concurrent: 4,
            stats_interval_secs: 10,
        }
    }
}

/// Per-query retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Degraded resubmissions allowed after the initial attempt before a
    /// timed-out query is abandoned.
    pub max_retries: u32,
    /// Unchanged resubmissions allowed for transient failures.
    pub transient_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            transient_retries: 3,
        }
    }
}

/// Checkpointing and snapshot behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Directory holding checkpoint.json, its backups and snapshots/.
    pub dir: PathBuf,
    /// Checkpoints older than this are discarded on load.
    pub staleness_ceiling_hours: u64,
    /// Timestamped backups retained after each save.
    pub max_backups: usize,
    /// An autosave happens at least this often even without changes.
    pub checkpoint_interval_secs: u64,
    /// Autosave poll granularity cap.
    pub poll_cap_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".surveyor"),
            staleness_ceiling_hours: 24,
            max_backups: 3,
            checkpoint_interval_secs: 300,
            poll_cap_secs: 30,
        }
    }
}

/// Remote query executor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub endpoint: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Per-query timeout handed to the HTTP client.
    pub query_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key_env: "SURVEYOR_API_KEY".to_string(),
            query_timeout_secs: 30,
        }
    }
}

impl SurveyorConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> DiscoveryResult<Self> {
        let config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    DiscoveryError::FatalConfig(format!(
                        "failed to read config file '{}': {}",
                        p.display(),
                        e
                    ))
                })?;
                toml::from_str(&content).map_err(|e| {
                    DiscoveryError::FatalConfig(format!(
                        "failed to parse config file '{}': {}",
                        p.display(),
                        e
                    ))
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DiscoveryResult<()> {
        if self.limiter.queries_per_minute == 0 {
            return Err(DiscoveryError::FatalConfig(
                "limiter.queries_per_minute must be at least 1".to_string(),
            ));
        }
        if self.limiter.max_concurrent == 0 {
            return Err(DiscoveryError::FatalConfig(
                "limiter.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.progress.checkpoint_interval_secs == 0 {
            return Err(DiscoveryError::FatalConfig(
                "progress.checkpoint_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl LimiterConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl ProgressConfig {
    pub fn staleness_ceiling(&self) -> chrono::Duration {
        chrono::Duration::hours(self.staleness_ceiling_hours as i64)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs.min(self.poll_cap_secs).max(1))
    }
}

impl ExecutorConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SurveyorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limiter.queries_per_minute, 60);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.progress.max_backups, 3);
        assert_eq!(config.progress.staleness_ceiling_hours, 24);
    }

    #[test]
    fn test_zero_rate_rejected() {
        let mut config = SurveyorConfig::default();
        config.limiter.queries_per_minute = 0;
        assert!(matches!(
            config.validate(),
            Err(DiscoveryError::FatalConfig(_))
        ));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: SurveyorConfig =
            toml::from_str("[limiter]\nqueries_per_minute = 10\n").unwrap();
        assert_eq!(parsed.limiter.queries_per_minute, 10);
        assert_eq!(parsed.limiter.max_concurrent, 4);
        assert_eq!(parsed.retry.max_retries, 5);
    }

    #[test]
    fn test_poll_interval_is_capped() {
        let progress = ProgressConfig {
            checkpoint_interval_secs: 300,
            poll_cap_secs: 30,
            ..ProgressConfig::default()
        };
        assert_eq!(progress.poll_interval(), Duration::from_secs(30));

        let short = ProgressConfig {
            checkpoint_interval_secs: 5,
            poll_cap_secs: 30,
            ..ProgressConfig::default()
        };
        assert_eq!(short.poll_interval(), Duration::from_secs(5));
    }
}
