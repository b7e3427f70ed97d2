//! Domain error types for the shard orchestrator
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, GatewayError>.
//!
//! Admission control never inspects error messages or source types to decide
//! between retrying and giving up. Every variant maps onto a closed
//! [`ErrorKind`], and callers match on that exhaustively.

use std::time::Duration;
use thiserror::Error;

/// Closed classification used by the bucket workers and the shard manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The bot credential was rejected. Retrying never helps.
    Auth,
    /// Invalid shard range, concurrency level or other configuration.
    Config,
    /// Handshake, DNS or generic I/O failure.
    TransientNetwork,
    /// HTTP 429 or a 5xx answer from the REST API.
    RateLimited,
    /// Operator requested cancellation.
    Interrupted,
    /// Anything else.
    Other,
}

/// Orchestrator domain errors
///
/// Every variant carries structured context fields for diagnostics.
///
/// Example log output:
/// ```text
/// GatewayError::InvalidShardId { shard_id: 10, total: 5 }
/// → "shard id 10 is outside 0..5"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The REST API answered 401 or the session layer rejected the token
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Shard id outside the configured shard total
    #[error("shard id {shard_id} is outside 0..{total}")]
    InvalidShardId { shard_id: u32, total: u32 },

    /// Concurrency level must be at least one
    #[error("invalid concurrency level {0}: must be a positive integer")]
    InvalidConcurrency(u32),

    /// Concurrency is fixed once configured
    #[error("concurrency level is fixed at {current}, refusing to change it to {requested}")]
    ConcurrencyChanged { current: u32, requested: u32 },

    /// Handshake, DNS resolution or I/O failure
    #[error("transient network failure during {context}")]
    TransientNetwork {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Non-success HTTP answer that will not be retried (any more)
    #[error("HTTP {status} after {attempts} attempt(s): {body}")]
    Http {
        status: u16,
        attempts: u32,
        body: String,
    },

    /// The gateway discovery answer could not be decoded
    #[error("invalid gateway discovery response")]
    InvalidResponse(#[source] serde_json::Error),

    /// Shard reconnection failed (fatal for the current connection)
    #[error("shard {shard_id} reconnection failed")]
    ShardReconnectFailed {
        shard_id: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Shard exceeded consecutive error threshold (circuit breaker tripped)
    #[error("shard {shard_id} exceeded consecutive error threshold ({count}/{max})")]
    ShardCircuitBroken { shard_id: u32, count: u32, max: u32 },

    /// Operation cancelled by shutdown
    #[error("operation interrupted")]
    Interrupted,

    /// Try-then-timed-wait lock acquisition gave up
    #[error("could not acquire {lock} lock within {waited:?}")]
    LockTimeout { lock: &'static str, waited: Duration },

    /// A dedicated executor could not be started
    #[error("failed to start executor '{name}'")]
    Executor {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation attempted after fleet shutdown
    #[error("shard manager is shut down")]
    ShutDown,

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Auth,
            Self::Config(_)
            | Self::InvalidShardId { .. }
            | Self::InvalidConcurrency(_)
            | Self::ConcurrencyChanged { .. } => ErrorKind::Config,
            Self::TransientNetwork { .. }
            | Self::ShardReconnectFailed { .. }
            | Self::ShardCircuitBroken { .. } => ErrorKind::TransientNetwork,
            Self::Http { status, .. } if is_retryable_status(*status) => ErrorKind::RateLimited,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Http { .. }
            | Self::InvalidResponse(_)
            | Self::LockTimeout { .. }
            | Self::Executor { .. }
            | Self::ShutDown
            | Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total` counter,
    /// enabling per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Config(_) => "config",
            Self::InvalidShardId { .. } => "invalid_shard_id",
            Self::InvalidConcurrency(_) => "invalid_concurrency",
            Self::ConcurrencyChanged { .. } => "concurrency_changed",
            Self::TransientNetwork { .. } => "transient_network",
            Self::Http { .. } => "http",
            Self::InvalidResponse(_) => "invalid_response",
            Self::ShardReconnectFailed { .. } => "reconnect_failed",
            Self::ShardCircuitBroken { .. } => "circuit_broken",
            Self::Interrupted => "interrupted",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Executor { .. } => "executor",
            Self::ShutDown => "shut_down",
            Self::Other(_) => "other",
        }
    }

    /// Wrap an I/O style failure as a transient network error.
    pub fn transient(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::TransientNetwork {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// 429 and every 5xx are retried by discovery.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_error() -> Box<dyn std::error::Error + Send + Sync> {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, "test"))
    }

    fn every_variant() -> Vec<GatewayError> {
        vec![
            GatewayError::Authentication("bad token".to_string()),
            GatewayError::Config("test".to_string()),
            GatewayError::InvalidShardId { shard_id: 10, total: 5 },
            GatewayError::InvalidConcurrency(0),
            GatewayError::ConcurrencyChanged { current: 1, requested: 16 },
            GatewayError::transient("handshake", test_error()),
            GatewayError::Http { status: 403, attempts: 1, body: String::new() },
            GatewayError::InvalidResponse(serde_json::from_str::<()>("invalid").unwrap_err()),
            GatewayError::ShardReconnectFailed { shard_id: 0, source: test_error() },
            GatewayError::ShardCircuitBroken { shard_id: 3, count: 10, max: 10 },
            GatewayError::Interrupted,
            GatewayError::LockTimeout { lock: "shards", waited: Duration::from_secs(10) },
            GatewayError::Executor {
                name: "callback".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "no threads"),
            },
            GatewayError::ShutDown,
            GatewayError::Other("test".to_string()),
        ]
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels: Vec<_> = every_variant().iter().map(|e| e.error_type_label()).collect();

        let mut unique = labels.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "Duplicate error_type_label found");
    }

    #[test]
    fn http_kind_depends_on_status() {
        let kind = |status| GatewayError::Http { status, attempts: 5, body: String::new() }.kind();
        assert_eq!(kind(429), ErrorKind::RateLimited);
        assert_eq!(kind(500), ErrorKind::RateLimited);
        assert_eq!(kind(503), ErrorKind::RateLimited);
        assert_eq!(kind(400), ErrorKind::Other);
        assert_eq!(kind(404), ErrorKind::Other);
    }

    #[test]
    fn configuration_failures_share_a_kind() {
        assert_eq!(GatewayError::InvalidShardId { shard_id: 9, total: 2 }.kind(), ErrorKind::Config);
        assert_eq!(GatewayError::InvalidConcurrency(0).kind(), ErrorKind::Config);
        assert_eq!(
            GatewayError::ConcurrencyChanged { current: 1, requested: 2 }.kind(),
            ErrorKind::Config
        );
        assert_eq!(GatewayError::Authentication(String::new()).kind(), ErrorKind::Auth);
        assert_eq!(GatewayError::Interrupted.kind(), ErrorKind::Interrupted);
    }

    #[test]
    fn error_messages_contain_context() {
        let err = GatewayError::InvalidShardId { shard_id: 10, total: 5 };
        assert_eq!(err.to_string(), "shard id 10 is outside 0..5");

        let err = GatewayError::Http { status: 500, attempts: 5, body: "oops".to_string() };
        let msg = err.to_string();
        assert!(msg.contains("500"));
        assert!(msg.contains("oops"));
        assert!(msg.contains('5'));

        let err = GatewayError::ShardCircuitBroken { shard_id: 3, count: 10, max: 10 };
        assert!(err.to_string().contains("10/10"));
    }

    #[test]
    fn config_error_preserves_message() {
        let err = GatewayError::Config("DISCORD_TOKEN must be set".to_string());
        assert_eq!(err.to_string(), "configuration error: DISCORD_TOKEN must be set");
    }
}
