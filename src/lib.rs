//! Arrakis Orchestrator - shard orchestration for the Discord gateway
//!
//! - Discovers the gateway and the recommended shard layout
//! - Admits session handshakes per concurrency bucket, one per interval
//! - Builds, restarts and disposes shard sessions through [`ShardManager`]
//! - Shares sized executors between every shard of the fleet

pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod shard;
mod sync;

pub use config::{OrchestratorConfig, ShardTotal};
pub use controller::{ConnectNode, GatewayApi, GatewayInfo, SessionController};
pub use error::{ErrorKind, GatewayError};
pub use shard::{DisposePolicy, Session, SessionBuilder, SessionContext, ShardManager};
