//! Executor providers
//!
//! A provider hands out the executor a shard's session should use and knows
//! whether the orchestrator owns it.

use crate::error::GatewayError;
use crate::pool::executor::Executor;
use crate::pool::PoolKind;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Builds an executor sized for a shard total
pub type ExecutorFactory = Arc<dyn Fn(u32) -> Result<Executor, GatewayError> + Send + Sync>;

/// Source of one logical pool
pub trait ExecutorProvider: Send + Sync {
    /// Size and start the executor. Called once the shard total is known;
    /// repeated calls are no-ops.
    fn init(&self, shard_total: u32) -> Result<(), GatewayError>;

    /// Executor for `shard_id`, or `None` before [`init`](Self::init).
    fn provide(&self, shard_id: u32) -> Option<Arc<Executor>>;

    /// Whether the orchestrator disposes this executor on fleet shutdown.
    fn auto_shutdown(&self) -> bool;

    /// Per-session ownership hook, queried once per constructed session.
    fn should_auto_shutdown(&self, _shard_id: u32) -> bool {
        self.auto_shutdown()
    }

    /// Dispose the executor.
    fn shutdown(&self);
}

enum PoolState {
    Uninitialized,
    Ready(Arc<Executor>),
}

/// Executor created on first `init` and shared by every shard
pub struct LazySharedPool {
    kind: PoolKind,
    factory: ExecutorFactory,
    auto_shutdown: bool,
    state: Mutex<PoolState>,
}

impl LazySharedPool {
    pub fn new(kind: PoolKind, factory: ExecutorFactory, auto_shutdown: bool) -> Self {
        Self {
            kind,
            factory,
            auto_shutdown,
            state: Mutex::new(PoolState::Uninitialized),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.state.lock(), PoolState::Ready(_))
    }
}

impl ExecutorProvider for LazySharedPool {
    fn init(&self, shard_total: u32) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if let PoolState::Ready(_) = *state {
            return Ok(());
        }

        let executor = (self.factory)(shard_total)?;
        info!(
            pool = self.kind.name(),
            threads = executor.threads(),
            shard_total,
            "Provisioned shared executor"
        );
        *state = PoolState::Ready(Arc::new(executor));
        Ok(())
    }

    fn provide(&self, _shard_id: u32) -> Option<Arc<Executor>> {
        match &*self.state.lock() {
            PoolState::Ready(executor) => Some(Arc::clone(executor)),
            PoolState::Uninitialized => None,
        }
    }

    fn auto_shutdown(&self) -> bool {
        self.auto_shutdown
    }

    fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), PoolState::Uninitialized);
        if let PoolState::Ready(executor) = previous {
            executor.shutdown();
        }
    }
}

impl fmt::Debug for LazySharedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazySharedPool")
            .field("kind", &self.kind)
            .field("auto_shutdown", &self.auto_shutdown)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Executor supplied ready-made by the integrator
#[derive(Debug)]
pub struct FixedExecutor {
    executor: Arc<Executor>,
    auto_shutdown: bool,
}

impl FixedExecutor {
    /// The caller keeps ownership unless `auto_shutdown` is set.
    pub fn new(executor: Arc<Executor>, auto_shutdown: bool) -> Self {
        Self {
            executor,
            auto_shutdown,
        }
    }
}

impl ExecutorProvider for FixedExecutor {
    fn init(&self, _shard_total: u32) -> Result<(), GatewayError> {
        Ok(())
    }

    fn provide(&self, _shard_id: u32) -> Option<Arc<Executor>> {
        Some(Arc::clone(&self.executor))
    }

    fn auto_shutdown(&self) -> bool {
        self.auto_shutdown
    }

    fn shutdown(&self) {
        self.executor.shutdown();
    }
}
