//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use fatman_client::ClientOptions;
use fatman_core::{RetryPolicy, WorkerId};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting is out of range or inconsistent with another.
    #[error("{0}")]
    Invalid(String),

    /// The data directory cannot be used.
    #[error("data directory '{path}': {source}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// FATMAN Calculation Runner Daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "fdaemon", about = "FATMAN calculation runner daemon", version)]
pub struct DaemonArgs {
    /// The URL where FATMAN is running
    #[arg(long, env = "FATMAN_URL", default_value = "https://tctdb.chem.uzh.ch/fatman")]
    pub url: String,

    /// Override hostname-detection for the worker identity
    #[arg(long, env = "FDAEMON_HOSTNAME")]
    pub hostname: Option<String>,

    /// Time to sleep (seconds) if no new tasks are available
    #[arg(long, default_value_t = 300)]
    pub nap_time: u64,

    /// Data directory, task working scopes are created below it
    #[arg(long, default_value = "./fdaemon-data")]
    pub data_dir: PathBuf,

    /// Number of tasks to run concurrently
    #[arg(short = 'j', long, default_value_t = 1)]
    pub workers: usize,

    /// Lease duration (seconds) the server grants a claim
    #[arg(long, default_value_t = 120)]
    pub lease_secs: u64,

    /// Heartbeat interval (seconds), must be shorter than the lease
    #[arg(long, default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Wall-clock limit (seconds) for a single task
    #[arg(long, default_value_t = 24 * 60 * 60)]
    pub task_timeout_secs: u64,

    /// How long (seconds) to wait for in-flight tasks on shutdown
    #[arg(long, default_value_t = 60)]
    pub grace_secs: u64,

    /// Retries for a failing server call before giving up
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,

    /// Delay (milliseconds) before the first retry, doubled on every further one
    #[arg(long, default_value_t = 1000)]
    pub retry_base_ms: u64,

    /// Upper bound (seconds) for a single retry delay
    #[arg(long, default_value_t = 60)]
    pub retry_max_secs: u64,

    /// Timeout (seconds) for a single HTTP request
    #[arg(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Bearer token for the FATMAN API
    #[arg(long, env = "FATMAN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Do not verify the server's SSL certificate
    #[arg(long)]
    pub no_ssl_verify: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Validated daemon configuration, shared read-only by all slots.
#[derive(Debug, Clone)]
pub struct Config {
    /// Service URL.
    pub url: String,

    /// Worker ID.
    pub worker_id: WorkerId,

    /// Root of the per-task working scopes.
    pub data_dir: PathBuf,

    /// Number of concurrent slots.
    pub pool_size: usize,

    /// Sleep between claims when no work is available.
    pub poll_interval: Duration,

    /// Lease duration granted by the server.
    pub lease_duration: Duration,

    /// Heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Per-task wall-clock limit.
    pub task_timeout: Duration,

    /// Shutdown grace period.
    pub grace_period: Duration,

    /// Backoff for failing server calls.
    pub retry: RetryPolicy,

    /// HTTP client options.
    pub client: ClientOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "https://tctdb.chem.uzh.ch/fatman".to_string(),
            worker_id: WorkerId::from_host(),
            data_dir: PathBuf::from("./fdaemon-data"),
            pool_size: 1,
            poll_interval: Duration::from_secs(300),
            lease_duration: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            task_timeout: Duration::from_secs(24 * 60 * 60),
            grace_period: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            client: ClientOptions::default(),
        }
    }
}

impl Config {
    /// Build and validate the configuration from command line arguments.
    ///
    /// Creates the data directory if it does not exist yet.
    pub fn from_args(args: DaemonArgs) -> Result<Self, ConfigError> {
        let worker_id = match args.hostname {
            Some(name) if !name.trim().is_empty() => WorkerId::new(name.trim()),
            _ => WorkerId::from_host(),
        };

        std::fs::create_dir_all(&args.data_dir).map_err(|source| ConfigError::DataDir {
            path: args.data_dir.display().to_string(),
            source,
        })?;
        let data_dir = args
            .data_dir
            .canonicalize()
            .map_err(|source| ConfigError::DataDir {
                path: args.data_dir.display().to_string(),
                source,
            })?;

        let config = Self {
            url: args.url,
            worker_id,
            data_dir,
            pool_size: args.workers,
            poll_interval: Duration::from_secs(args.nap_time),
            lease_duration: Duration::from_secs(args.lease_secs),
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            task_timeout: Duration::from_secs(args.task_timeout_secs),
            grace_period: Duration::from_secs(args.grace_secs),
            retry: RetryPolicy::new(
                args.max_retries,
                Duration::from_millis(args.retry_base_ms),
                Duration::from_secs(args.retry_max_secs),
            ),
            client: ClientOptions {
                token: args.token,
                verify_tls: !args.no_ssl_verify,
                timeout: Duration::from_secs(args.request_timeout_secs),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("--workers must be at least 1".to_string()));
        }
        if self.lease_duration.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "lease and heartbeat interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.lease_duration {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval ({}s) must be shorter than the lease ({}s)",
                self.heartbeat_interval.as_secs(),
                self.lease_duration.as_secs()
            )));
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::Invalid("task timeout must be positive".to_string()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "retry base delay exceeds the maximum delay".to_string(),
            ));
        }
        Ok(())
    }
}
