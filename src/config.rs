//! Orchestrator configuration module
//!
//! Handles loading configuration from environment variables. Settings with no
//! environment form (executor overrides, retry policy) are set on the struct
//! directly.

use crate::controller::discovery::DEFAULT_API_BASE;
use crate::controller::{RetryPolicy, ADMISSION_INTERVAL};
use crate::error::GatewayError;
use crate::pool::PoolOverrides;
use crate::shard::DisposePolicy;
use std::env;
use std::time::Duration;

/// Lower bound for the reconnect backoff ceiling
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(32);

/// How the shard total is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardTotal {
    /// Use the gateway's recommended shard count
    #[default]
    Auto,
    Fixed(u32),
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Discord bot token
    pub token: String,

    /// Total number of shards across the fleet
    pub shard_total: ShardTotal,

    /// Subset of shard ids this process runs (all when `None`)
    pub shard_ids: Option<Vec<u32>>,

    /// REST base URL used for gateway discovery
    pub api_base: String,

    /// Minimum spacing between handshakes of one bucket
    pub admission_interval: Duration,

    /// Discovery retry ceiling and backoff
    pub discovery_retry: RetryPolicy,

    /// Ceiling for a session's reconnect backoff (at least 32s)
    pub max_reconnect_delay: Duration,

    /// Guild member threshold passed through to sessions (50..=250)
    pub large_threshold: u32,

    /// Install a SIGINT/SIGTERM hook that shuts the fleet down
    pub shutdown_hook: bool,

    /// How sessions are torn down on restart and shutdown
    pub dispose_policy: DisposePolicy,

    /// Per-pool executor overrides
    pub pools: PoolOverrides,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl OrchestratorConfig {
    /// Defaults for everything but the token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            shard_total: ShardTotal::Auto,
            shard_ids: None,
            api_base: DEFAULT_API_BASE.to_string(),
            admission_interval: ADMISSION_INTERVAL,
            discovery_retry: RetryPolicy::default(),
            max_reconnect_delay: Duration::from_secs(900),
            large_threshold: 250,
            shutdown_hook: true,
            dispose_policy: DisposePolicy::Graceful,
            pools: PoolOverrides::default(),
            http_port: 9090,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map_err(|_| GatewayError::Config(
                "DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string(),
            ))?;

        let mut config = Self::new(token);

        config.shard_total = parse_shard_total(
            &env::var("TOTAL_SHARDS").unwrap_or_else(|_| "auto".to_string()),
        )?;

        if let Ok(raw) = env::var("SHARD_IDS") {
            config.shard_ids = Some(parse_shard_ids(&raw)?);
        }

        if let Ok(base) = env::var("API_BASE") {
            config.api_base = base;
        }

        if let Ok(raw) = env::var("MAX_RECONNECT_DELAY") {
            let secs: u64 = raw.parse().map_err(|e| {
                GatewayError::Config(format!("MAX_RECONNECT_DELAY must be a number of seconds: {e}"))
            })?;
            config.max_reconnect_delay = Duration::from_secs(secs);
        }
        config.max_reconnect_delay = config.max_reconnect_delay.max(MIN_RECONNECT_DELAY);

        if let Ok(raw) = env::var("LARGE_THRESHOLD") {
            config.large_threshold = raw
                .parse()
                .map_err(|e| GatewayError::Config(format!("LARGE_THRESHOLD must be a valid number: {e}")))?;
        }

        if let Ok(raw) = env::var("SHUTDOWN_HOOK") {
            config.shutdown_hook = parse_bool("SHUTDOWN_HOOK", &raw)?;
        }

        if let Ok(raw) = env::var("DISPOSE_POLICY") {
            config.dispose_policy = raw.parse()?;
        }

        config.http_port = env::var("HTTP_PORT")
            .or_else(|_| env::var("METRICS_PORT")) // Backwards compat
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        config.log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on settings that can never work
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.token.trim().is_empty() {
            return Err(GatewayError::Config("bot token must not be empty".to_string()));
        }
        if self.shard_total == ShardTotal::Fixed(0) {
            return Err(GatewayError::Config("TOTAL_SHARDS must be at least 1".to_string()));
        }
        if !(50..=250).contains(&self.large_threshold) {
            return Err(GatewayError::Config(format!(
                "LARGE_THRESHOLD must be within 50..=250, got {}",
                self.large_threshold
            )));
        }
        if self.admission_interval.is_zero() {
            return Err(GatewayError::Config("admission interval must be positive".to_string()));
        }
        if self.discovery_retry.max_attempts == 0 {
            return Err(GatewayError::Config("discovery needs at least one attempt".to_string()));
        }
        if let (ShardTotal::Fixed(total), Some(ids)) = (self.shard_total, &self.shard_ids) {
            if let Some(&shard_id) = ids.iter().find(|&&id| id >= total) {
                return Err(GatewayError::InvalidShardId { shard_id, total });
            }
        }
        Ok(())
    }
}

fn parse_shard_total(raw: &str) -> Result<ShardTotal, GatewayError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("auto") || raw == "-1" {
        return Ok(ShardTotal::Auto);
    }
    raw.parse()
        .map(ShardTotal::Fixed)
        .map_err(|e| GatewayError::Config(format!("TOTAL_SHARDS must be 'auto' or a valid number: {e}")))
}

/// `"0,2,5"` or `"4..8"` (end exclusive)
fn parse_shard_ids(raw: &str) -> Result<Vec<u32>, GatewayError> {
    let invalid = |e: std::num::ParseIntError| GatewayError::Config(format!("SHARD_IDS is invalid: {e}"));

    let mut ids: Vec<u32> = if let Some((start, end)) = raw.split_once("..") {
        let start: u32 = start.trim().parse().map_err(invalid)?;
        let end: u32 = end.trim().parse().map_err(invalid)?;
        (start..end).collect()
    } else {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<u32>().map_err(invalid))
            .collect::<Result<_, _>>()?
    };

    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Err(GatewayError::Config("SHARD_IDS selects no shards".to_string()));
    }
    Ok(ids)
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, GatewayError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GatewayError::Config(format!("{name} must be a boolean, got '{other}'"))),
    }
}
