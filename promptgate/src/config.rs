//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `promptgate.yaml` and can be set via
//! the `-f` flag or the `PROMPTGATE_CONFIG` environment variable.
//!
//! Sources are merged in order, later ones winning:
//!
//! 1. YAML config file (base)
//! 2. Environment variables prefixed with `PROMPTGATE_`
//!
//! Nested values use double underscores in environment variables, e.g.
//! `PROMPTGATE_RATE__MAX_PER_HOUR=500` sets `rate.max_per_hour`.
//!
//! Durations are written in humantime form (`300s`, `5m`, `1h`).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::executor::RetryPolicy;
use crate::queue::WorkerConfig;

/// Simple CLI args - just for specifying the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(
        short = 'f',
        long,
        env = "PROMPTGATE_CONFIG",
        default_value = "promptgate.yaml"
    )]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Rate limiting and ledger settings
    pub rate: RateConfig,
    /// Response cache settings
    pub cache: CacheConfig,
    /// External tool invocation settings
    pub tool: ToolConfig,
    /// Retry policy for transient tool failures
    pub retry: RetryConfig,
    /// Job queue and worker pool settings
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            rate: RateConfig::default(),
            cache: CacheConfig::default(),
            tool: ToolConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Rate limiting and usage ledger settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateConfig {
    /// Path to the SQLite usage ledger database.
    pub ledger_path: PathBuf,
    /// Admission limit for the trailing window. Keep this below the upstream
    /// provider's hard cap so calls made outside this process have headroom.
    pub max_per_hour: u64,
    /// Length of the trailing window.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How often expired ledger records are pruned.
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("usage_ledger.db"),
            // 950 against an upstream cap of 1000.
            max_per_hour: 950,
            window: Duration::from_secs(3600),
            prune_interval: Duration::from_secs(300),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Time-to-live for cached responses.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
        }
    }
}

/// External tool invocation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    /// Program to invoke.
    pub program: String,
    /// Flags passed on every invocation, before per-request options.
    pub base_flags: Vec<String>,
    /// Timeout for a single tool attempt.
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: "gemini".to_string(),
            base_flags: vec!["--yolo".to_string(), "--checkpointing".to_string()],
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

/// Retry policy settings for transient tool failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Additional attempts allowed after the first failure.
    pub max_retries: u32,
    /// Base backoff before the first retry.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    /// Factor by which the backoff grows with each retry.
    pub backoff_factor: u32,
    /// Ceiling on any single backoff delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(1),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.backoff,
            backoff_factor: config.backoff_factor,
            max_backoff: config.max_backoff,
        }
    }
}

/// Job queue and worker pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Maximum number of jobs executing concurrently.
    pub workers: usize,
    /// Maximum number of jobs claimed per drain iteration.
    pub claim_batch_size: usize,
    /// How long the pool sleeps when the queue has nothing runnable.
    #[serde(with = "humantime_serde")]
    pub claim_interval: Duration,
    /// Admission requeues allowed before a job fails as rate-limited.
    pub max_admission_requeues: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            claim_batch_size: 16,
            claim_interval: Duration::from_millis(500),
            max_admission_requeues: 10,
        }
    }
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            workers: config.workers,
            claim_batch_size: config.claim_batch_size,
            claim_interval: config.claim_interval,
            max_admission_requeues: config.max_admission_requeues,
        }
    }
}

impl Config {
    /// Load configuration from the file named in `args` plus environment
    /// overrides. A missing file falls back to defaults; a malformed file or
    /// unknown key is an error.
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        Self::figment(args).extract()
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("PROMPTGATE_").split("__"))
    }
}
