//! Configuration management for Tollgate.
//!
//! A configuration names the store backend and a list of rate limit
//! policies:
//!
//! ```yaml
//! store:
//!   type: redis
//!   url: redis://127.0.0.1:6379
//! decision_deadline_ms: 500
//! policies:
//!   - name: api
//!     algorithm:
//!       type: sliding_window_counter
//!       limit: 100
//!       window_secs: 60
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::Algorithm;

/// Prefix for environment overrides, e.g. `TOLLGATE__STORE__URL`.
const ENV_PREFIX: &str = "TOLLGATE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Storage backend shared by all policies
    #[serde(default)]
    pub store: StoreConfig,

    /// Upper bound on a single admission decision, in milliseconds
    #[serde(default)]
    pub decision_deadline_ms: Option<u64>,

    /// Rate limit policies
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// Storage backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// State kept in this process only.
    Memory {
        /// Seconds between idle-key sweeps
        #[serde(default = "default_sweep_interval")]
        sweep_interval_secs: u64,
        /// Sweeps a key may sit idle before it is evicted
        #[serde(default = "default_idle_cycles")]
        idle_cycles: u32,
    },
    /// State shared through Redis.
    Redis {
        /// Connection URL
        url: String,
        /// Per-command timeout in milliseconds
        #[serde(default = "default_command_timeout")]
        command_timeout_ms: u64,
        /// Expiry of leaky bucket queues in seconds
        #[serde(default = "default_idle_ttl")]
        idle_ttl_secs: u64,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            sweep_interval_secs: default_sweep_interval(),
            idle_cycles: default_idle_cycles(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_idle_cycles() -> u32 {
    3
}

fn default_command_timeout() -> u64 {
    250
}

fn default_idle_ttl() -> u64 {
    3600
}

/// A named rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy name; also namespaces the policy's keys in the store
    pub name: String,
    /// Algorithm and parameters
    pub algorithm: AlgorithmConfig,
}

/// Algorithm parameters as written in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    FixedWindow { limit: u64, window_secs: u64 },
    TokenBucket { rate: f64, burst: u64 },
    SlidingWindowLog { limit: u64, window_secs: u64 },
    SlidingWindowCounter { limit: u64, window_secs: u64 },
    LeakyBucket { rate: f64, burst: u64 },
}

impl From<AlgorithmConfig> for Algorithm {
    fn from(config: AlgorithmConfig) -> Self {
        match config {
            AlgorithmConfig::FixedWindow { limit, window_secs } => Algorithm::FixedWindow {
                limit,
                window: Duration::from_secs(window_secs),
            },
            AlgorithmConfig::TokenBucket { rate, burst } => Algorithm::TokenBucket { rate, burst },
            AlgorithmConfig::SlidingWindowLog { limit, window_secs } => {
                Algorithm::SlidingWindowLog {
                    limit,
                    window: Duration::from_secs(window_secs),
                }
            }
            AlgorithmConfig::SlidingWindowCounter { limit, window_secs } => {
                Algorithm::SlidingWindowCounter {
                    limit,
                    window: Duration::from_secs(window_secs),
                }
            }
            AlgorithmConfig::LeakyBucket { rate, burst } => Algorithm::LeakyBucket { rate, burst },
        }
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load configuration from an optional YAML file, then apply
    /// `TOLLGATE__*` environment overrides, then validate.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration");
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check store settings and every policy.
    pub fn validate(&self) -> Result<()> {
        match &self.store {
            StoreConfig::Memory {
                sweep_interval_secs,
                idle_cycles,
            } => {
                if *sweep_interval_secs == 0 || *idle_cycles == 0 {
                    return Err(TollgateError::Config(
                        "memory store sweep interval and idle cycles must be positive".into(),
                    ));
                }
            }
            StoreConfig::Redis {
                url,
                command_timeout_ms,
                ..
            } => {
                if url.is_empty() {
                    return Err(TollgateError::Config("redis url must not be empty".into()));
                }
                if *command_timeout_ms == 0 {
                    return Err(TollgateError::Config(
                        "redis command timeout must be positive".into(),
                    ));
                }
            }
        }

        let mut seen = HashSet::new();
        for policy in &self.policies {
            if !seen.insert(policy.name.as_str()) {
                return Err(TollgateError::Config(format!(
                    "duplicate policy name: {}",
                    policy.name
                )));
            }
            Algorithm::from(policy.algorithm.clone()).validate()?;
        }
        Ok(())
    }

    /// The decision deadline, if configured.
    pub fn decision_deadline(&self) -> Option<Duration> {
        self.decision_deadline_ms.map(Duration::from_millis)
    }

    /// Look up a policy by name.
    pub fn policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TollgateConfig::default();
        assert_eq!(
            config.store,
            StoreConfig::Memory {
                sweep_interval_secs: 60,
                idle_cycles: 3
            }
        );
        assert!(config.policies.is_empty());
        assert!(config.decision_deadline().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  type: redis
  url: redis://cache:6379
decision_deadline_ms: 300
policies:
  - name: login
    algorithm:
      type: fixed_window
      limit: 5
      window_secs: 60
  - name: api
    algorithm:
      type: token_bucket
      rate: 2.5
      burst: 10
  - name: search
    algorithm:
      type: leaky_bucket
      rate: 1
      burst: 4
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(
            config.store,
            StoreConfig::Redis {
                url: "redis://cache:6379".into(),
                command_timeout_ms: 250,
                idle_ttl_secs: 3600,
            }
        );
        assert_eq!(config.decision_deadline(), Some(Duration::from_millis(300)));
        assert_eq!(config.policies.len(), 3);
        assert_eq!(
            config.policy("api").unwrap().algorithm,
            AlgorithmConfig::TokenBucket {
                rate: 2.5,
                burst: 10
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_algorithm_conversion() {
        let algorithm: Algorithm = AlgorithmConfig::SlidingWindowCounter {
            limit: 50,
            window_secs: 600,
        }
        .into();
        assert_eq!(
            algorithm,
            Algorithm::SlidingWindowCounter {
                limit: 50,
                window: Duration::from_secs(600)
            }
        );
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let yaml = r#"
policies:
  - name: api
    algorithm:
      type: gcra
      limit: 5
"#;
        assert!(matches!(
            TollgateConfig::from_yaml(yaml),
            Err(TollgateError::Config(_))
        ));
    }

    #[test]
    fn test_validate_duplicate_policies() {
        let yaml = r#"
policies:
  - name: api
    algorithm: { type: fixed_window, limit: 5, window_secs: 1 }
  - name: api
    algorithm: { type: fixed_window, limit: 6, window_secs: 1 }
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert!(matches!(config.validate(), Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_validate_invalid_algorithm() {
        let yaml = r#"
policies:
  - name: api
    algorithm: { type: sliding_window_log, limit: 5, window_secs: 0 }
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert!(matches!(config.validate(), Err(TollgateError::Limiter(_))));
    }

    #[test]
    fn test_validate_memory_store_settings() {
        let config = TollgateConfig {
            store: StoreConfig::Memory {
                sweep_interval_secs: 0,
                idle_cycles: 3,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
store:
  type: memory
  idle_cycles: 5
policies:
  - name: search
    algorithm: { type: leaky_bucket, rate: 0.5, burst: 3 }
"#,
        )
        .unwrap();

        let config = TollgateConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            config.store,
            StoreConfig::Memory {
                sweep_interval_secs: 60,
                idle_cycles: 5
            }
        );
        assert_eq!(
            config.policy("search").unwrap().algorithm,
            AlgorithmConfig::LeakyBucket {
                rate: 0.5,
                burst: 3
            }
        );
    }

    #[test]
    fn test_from_missing_file() {
        let result = TollgateConfig::from_file("/nonexistent/tollgate.yaml");
        assert!(matches!(result, Err(TollgateError::Io(_))));
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("tollgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
decision_deadline_ms: 100
policies:
  - name: api
    algorithm: { type: token_bucket, rate: 1, burst: 1 }
"#,
        )
        .unwrap();

        std::env::set_var("TOLLGATE__DECISION_DEADLINE_MS", "750");
        let config = TollgateConfig::load(path.to_str()).unwrap();
        std::env::remove_var("TOLLGATE__DECISION_DEADLINE_MS");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.decision_deadline(), Some(Duration::from_millis(750)));
        assert_eq!(config.policies.len(), 1);
        assert!(matches!(config.store, StoreConfig::Memory { .. }));
    }
}
