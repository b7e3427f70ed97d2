//! Session layer contract
//!
//! The shard manager never touches the wire protocol. It asks a
//! [`SessionBuilder`] for a session per shard and disposes it later; the
//! session itself asks the [`SessionController`] for admission through
//! connect nodes.

use crate::controller::SessionController;
use crate::error::GatewayError;
use crate::pool::ShardExecutors;
use crate::shard::state::ShardState;
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;

/// How a session is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisposePolicy {
    /// Close the connection cleanly and wait briefly for the close frame
    #[default]
    Graceful,
    /// Drop the connection immediately
    Immediate,
}

impl FromStr for DisposePolicy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "graceful" => Ok(Self::Graceful),
            "immediate" | "now" => Ok(Self::Immediate),
            other => Err(GatewayError::Config(format!(
                "DISPOSE_POLICY must be 'graceful' or 'immediate', got '{other}'"
            ))),
        }
    }
}

/// Everything a session needs from the orchestrator
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub shard_id: u32,
    pub shard_total: u32,
    pub gateway_url: String,
    pub controller: SessionController,
    pub executors: ShardExecutors,
    pub state: ShardState,
    pub max_reconnect_delay: Duration,
    pub large_threshold: u32,
}

/// A live (or starting) session for one shard
#[async_trait]
pub trait Session: Send + Sync + 'static {
    fn shard_id(&self) -> u32;

    /// Tear the session down and cancel any pending connect node.
    async fn dispose(&self, policy: DisposePolicy);
}

/// Constructs sessions for the shard manager
#[async_trait]
pub trait SessionBuilder: Send + Sync + 'static {
    type Session: Session;

    /// Build the session for `context.shard_id`.
    ///
    /// Called outside every manager lock. Returning an error of kind
    /// [`ErrorKind::Auth`](crate::error::ErrorKind::Auth) shuts the whole
    /// manager down.
    async fn build(&self, context: SessionContext) -> Result<Self::Session, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispose_policy_parses() {
        assert_eq!("graceful".parse::<DisposePolicy>().unwrap(), DisposePolicy::Graceful);
        assert_eq!(" Immediate ".parse::<DisposePolicy>().unwrap(), DisposePolicy::Immediate);
        assert!("later".parse::<DisposePolicy>().is_err());
    }
}
