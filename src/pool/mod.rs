//! Shared executor provisioning
//!
//! Six logical pools are shared by every shard. Their sizes scale with the
//! logarithm of the shard total so a single-shard bot and a fleet of tens of
//! thousands of shards both get a sensible thread count. Pools are created
//! lazily, once, after the shard total is known.

mod executor;
mod provider;

pub use executor::Executor;
pub use provider::{ExecutorFactory, ExecutorProvider, FixedExecutor, LazySharedPool};

use crate::error::GatewayError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// The logical pools provisioned for sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolKind {
    /// Timer-like backoff waits of the REST rate limiter
    RateLimitScheduler,
    /// Blocking REST calls
    RateLimitElastic,
    /// Gateway write pumps (session event loops)
    GatewayWriter,
    /// Callback completion and session teardown
    Callback,
    /// Event dispatch
    EventDispatch,
    /// Voice keep-alive
    AudioKeepAlive,
}

impl PoolKind {
    pub const ALL: [PoolKind; 6] = [
        PoolKind::RateLimitScheduler,
        PoolKind::RateLimitElastic,
        PoolKind::GatewayWriter,
        PoolKind::Callback,
        PoolKind::EventDispatch,
        PoolKind::AudioKeepAlive,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PoolKind::RateLimitScheduler => "rate-limit-scheduler",
            PoolKind::RateLimitElastic => "rate-limit-elastic",
            PoolKind::GatewayWriter => "gateway-writer",
            PoolKind::Callback => "callback",
            PoolKind::EventDispatch => "event-dispatch",
            PoolKind::AudioKeepAlive => "audio-keepalive",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Default worker count for a fleet of `shard_total` shards.
    pub fn default_threads(self, shard_total: u32) -> usize {
        match self {
            PoolKind::RateLimitScheduler | PoolKind::GatewayWriter | PoolKind::EventDispatch => {
                scaled_threads(shard_total, 2.0, 2)
            }
            PoolKind::RateLimitElastic => scaled_threads(shard_total, 2.0, 4),
            PoolKind::Callback | PoolKind::AudioKeepAlive => scaled_threads(shard_total, 1.0, 1),
        }
    }

    /// Factory used when the integrator does not override this pool.
    pub fn default_factory(self) -> ExecutorFactory {
        Arc::new(move |shard_total| Executor::build(self.name(), self.default_threads(shard_total)))
    }
}

/// `max(floor, ceil(factor * ln(shard_total)))`
pub fn scaled_threads(shard_total: u32, factor: f64, floor: usize) -> usize {
    let total = f64::from(shard_total.max(1));
    let scaled = (factor * total.ln()).ceil() as usize;
    scaled.max(floor)
}

/// Integrator override for one pool
#[derive(Clone, Default)]
pub enum PoolSource {
    /// Lazily created, log-scaled, disposed on shutdown
    #[default]
    Default,
    /// Lazily created from a custom factory
    Provider {
        factory: ExecutorFactory,
        auto_shutdown: bool,
    },
    /// Ready-made executor; the caller keeps ownership unless told otherwise
    Executor {
        executor: Arc<Executor>,
        auto_shutdown: bool,
    },
}

impl PoolSource {
    pub fn provider(factory: ExecutorFactory) -> Self {
        Self::Provider {
            factory,
            auto_shutdown: true,
        }
    }

    pub fn executor(executor: Arc<Executor>) -> Self {
        Self::Executor {
            executor,
            auto_shutdown: false,
        }
    }

    /// Override the ownership flag.
    pub fn with_auto_shutdown(self, flag: bool) -> Self {
        match self {
            Self::Default => Self::Default,
            Self::Provider { factory, .. } => Self::Provider {
                factory,
                auto_shutdown: flag,
            },
            Self::Executor { executor, .. } => Self::Executor {
                executor,
                auto_shutdown: flag,
            },
        }
    }
}

impl fmt::Debug for PoolSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Provider { auto_shutdown, .. } => f
                .debug_struct("Provider")
                .field("auto_shutdown", auto_shutdown)
                .finish_non_exhaustive(),
            Self::Executor {
                executor,
                auto_shutdown,
            } => f
                .debug_struct("Executor")
                .field("name", &executor.name())
                .field("auto_shutdown", auto_shutdown)
                .finish(),
        }
    }
}

/// Per-pool overrides
#[derive(Debug, Clone, Default)]
pub struct PoolOverrides {
    sources: HashMap<PoolKind, PoolSource>,
}

impl PoolOverrides {
    pub fn set(&mut self, kind: PoolKind, source: PoolSource) -> &mut Self {
        self.sources.insert(kind, source);
        self
    }

    pub fn get(&self, kind: PoolKind) -> PoolSource {
        self.sources.get(&kind).cloned().unwrap_or_default()
    }
}

/// Executors handed to one session
#[derive(Debug, Clone)]
pub struct ShardExecutors {
    handles: [Option<Handle>; 6],
    auto_shutdown: [bool; 6],
}

impl ShardExecutors {
    /// Handle for `kind`, absent while pools are still being sized.
    pub fn handle(&self, kind: PoolKind) -> Option<&Handle> {
        self.handles[kind.index()].as_ref()
    }

    /// Handle for `kind`, falling back to the caller's runtime.
    pub fn handle_or_current(&self, kind: PoolKind) -> Handle {
        self.handle(kind).cloned().unwrap_or_else(Handle::current)
    }

    /// Whether the orchestrator owns the executor behind `kind`.
    pub fn auto_shutdown(&self, kind: PoolKind) -> bool {
        self.auto_shutdown[kind.index()]
    }
}

/// The six providers, owned by one shard manager
#[derive(Clone)]
pub struct SharedPools {
    providers: Arc<[Arc<dyn ExecutorProvider>; 6]>,
}

impl SharedPools {
    pub fn new(overrides: &PoolOverrides) -> Self {
        let providers = PoolKind::ALL.map(|kind| -> Arc<dyn ExecutorProvider> {
            match overrides.get(kind) {
                PoolSource::Default => Arc::new(LazySharedPool::new(kind, kind.default_factory(), true)),
                PoolSource::Provider {
                    factory,
                    auto_shutdown,
                } => Arc::new(LazySharedPool::new(kind, factory, auto_shutdown)),
                PoolSource::Executor {
                    executor,
                    auto_shutdown,
                } => Arc::new(FixedExecutor::new(executor, auto_shutdown)),
            }
        });
        Self {
            providers: Arc::new(providers),
        }
    }

    pub fn provider(&self, kind: PoolKind) -> &Arc<dyn ExecutorProvider> {
        &self.providers[kind.index()]
    }

    /// Size every pool for `shard_total`.
    pub fn init(&self, shard_total: u32) -> Result<(), GatewayError> {
        for provider in self.providers.iter() {
            provider.init(shard_total)?;
        }
        Ok(())
    }

    pub fn executors_for(&self, shard_id: u32) -> ShardExecutors {
        ShardExecutors {
            handles: PoolKind::ALL.map(|kind| {
                self.provider(kind)
                    .provide(shard_id)
                    .map(|executor| executor.handle().clone())
            }),
            auto_shutdown: PoolKind::ALL.map(|kind| self.provider(kind).should_auto_shutdown(shard_id)),
        }
    }

    /// Dispose every pool the orchestrator owns.
    pub fn shutdown(&self) {
        for provider in self.providers.iter() {
            if provider.auto_shutdown() {
                provider.shutdown();
            }
        }
    }
}

impl fmt::Debug for SharedPools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPools").finish_non_exhaustive()
    }
}
