//! Session admission control
//!
//! Sessions are admitted per concurrency bucket (`shard_id % concurrency`),
//! one handshake per bucket per admission interval. Buckets run in parallel
//! and never coordinate with each other.

mod bucket;
pub mod discovery;
mod node;

pub use discovery::{
    fetch_gateway_info, ApiResponse, GatewayApi, GatewayInfo, HttpGatewayApi, RetryPolicy,
};
pub use node::ConnectNode;

use crate::error::GatewayError;
use crate::pool::{Executor, ExecutorProvider};
use bucket::BucketQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Minimum spacing between two handshakes of the same bucket
pub const ADMISSION_INTERVAL: Duration = Duration::from_secs(5);

/// Routes connect nodes into buckets and runs their workers
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

pub(crate) struct ControllerInner {
    pub(crate) admission_interval: Duration,
    pub(crate) state: Mutex<ControllerState>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    api: Arc<dyn GatewayApi>,
    retry: RetryPolicy,
    fallback: Handle,
    scheduler: Mutex<Option<Arc<dyn ExecutorProvider>>>,
    elastic: Mutex<Option<Arc<dyn ExecutorProvider>>>,
}

#[derive(Default)]
pub(crate) struct ControllerState {
    concurrency: Option<NonZeroU32>,
    pub(crate) buckets: HashMap<u32, BucketQueue>,
    pub(crate) shut_down: bool,
}

impl SessionController {
    /// Create a controller whose workers run on `fallback` until a scheduler
    /// pool is attached.
    pub fn new(
        api: Arc<dyn GatewayApi>,
        admission_interval: Duration,
        retry: RetryPolicy,
        fallback: Handle,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControllerInner {
                admission_interval,
                state: Mutex::new(ControllerState::default()),
                shutdown_tx,
                api,
                retry,
                fallback,
                scheduler: Mutex::new(None),
                elastic: Mutex::new(None),
            }),
        }
    }

    /// Spawn bucket workers on the rate-limit scheduler pool.
    pub fn attach_scheduler(&self, provider: Arc<dyn ExecutorProvider>) {
        *self.inner.scheduler.lock() = Some(provider);
    }

    /// Run discovery calls on the rate-limit elastic pool.
    pub fn attach_elastic(&self, provider: Arc<dyn ExecutorProvider>) {
        *self.inner.elastic.lock() = Some(provider);
    }

    pub fn admission_interval(&self) -> Duration {
        self.inner.admission_interval
    }

    /// Fix the number of buckets.
    ///
    /// Setting the same value again is accepted; any other value after the
    /// first is an error.
    pub fn set_concurrency(&self, level: u32) -> Result<(), GatewayError> {
        let level = NonZeroU32::new(level).ok_or(GatewayError::InvalidConcurrency(level))?;
        let mut state = self.inner.state.lock();
        match state.concurrency {
            None => {
                info!(concurrency = level.get(), "Session concurrency configured");
                state.concurrency = Some(level);
                Ok(())
            }
            Some(current) if current == level => Ok(()),
            Some(current) => Err(GatewayError::ConcurrencyChanged {
                current: current.get(),
                requested: level.get(),
            }),
        }
    }

    pub fn concurrency(&self) -> Option<u32> {
        self.inner.state.lock().concurrency.map(NonZeroU32::get)
    }

    /// Bucket a shard is admitted in
    pub fn bucket_for(&self, shard_id: u32) -> u32 {
        let level = self.inner.state.lock().concurrency.map_or(1, NonZeroU32::get);
        shard_id % level
    }

    /// Queue `node` for admission, replacing any pending node for its shard.
    ///
    /// Never blocks. Falls back to a concurrency of 1 when none was set.
    pub fn append_session(&self, node: Arc<dyn ConnectNode>) {
        let shard_id = node.shard_id();
        let spawn_bucket = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                debug!(shard_id, "Controller shut down, ignoring connect node");
                return;
            }
            let level = match state.concurrency {
                Some(level) => level,
                None => {
                    warn!("Session concurrency not configured, defaulting to 1");
                    let level = NonZeroU32::MIN;
                    state.concurrency = Some(level);
                    level
                }
            };
            let bucket = shard_id % level.get();
            let queue = state.buckets.entry(bucket).or_default();
            queue.push(node);
            debug!(shard_id, bucket, queued = queue.nodes.len(), "Connect node queued");

            if queue.worker_active {
                None
            } else {
                queue.worker_active = true;
                Some(bucket)
            }
        };

        if let Some(bucket) = spawn_bucket {
            self.spawn_worker(bucket);
        }
    }

    /// Cancel a node that has not started running. Returns true if it was
    /// still queued.
    pub fn remove_session(&self, node: &Arc<dyn ConnectNode>) -> bool {
        let mut state = self.inner.state.lock();
        let removed = state
            .buckets
            .values_mut()
            .any(|queue| queue.remove(node));
        if removed {
            debug!(shard_id = node.shard_id(), "Connect node cancelled");
        }
        removed
    }

    /// Shard ids queued in `bucket`, in admission order
    pub fn queued(&self, bucket: u32) -> Vec<u32> {
        self.inner
            .state
            .lock()
            .buckets
            .get(&bucket)
            .map(|queue| queue.nodes.iter().map(|node| node.shard_id()).collect())
            .unwrap_or_default()
    }

    /// Total nodes waiting across all buckets
    pub fn pending(&self) -> usize {
        self.inner
            .state
            .lock()
            .buckets
            .values()
            .map(|queue| queue.nodes.len())
            .sum()
    }

    /// Whether `bucket` currently has a worker
    pub fn is_worker_active(&self, bucket: u32) -> bool {
        self.inner
            .state
            .lock()
            .buckets
            .get(&bucket)
            .is_some_and(|queue| queue.worker_active)
    }

    /// Discover gateway URL, recommended shard total and concurrency.
    ///
    /// Runs on the elastic pool when attached, otherwise on a temporary
    /// one-thread executor that is disposed afterwards regardless of outcome.
    pub async fn discover_gateway(&self) -> Result<GatewayInfo, GatewayError> {
        let pooled = self
            .inner
            .elastic
            .lock()
            .as_ref()
            .and_then(|provider| provider.provide(0));
        let (executor, temporary) = match pooled {
            Some(executor) => (executor, false),
            None => (Arc::new(Executor::build("gateway-discovery", 1)?), true),
        };

        run_discovery(
            &executor,
            temporary,
            Arc::clone(&self.inner.api),
            self.inner.retry,
        )
        .await
    }

    /// Stop every worker that is between admissions and drop queued nodes.
    ///
    /// A node that is already running finishes its handshake.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let dropped: usize = state.buckets.values().map(|queue| queue.nodes.len()).sum();
            state.buckets.clear();
            debug!(dropped, "Session controller shut down");
        }
        self.inner.shutdown_tx.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }

    fn spawn_worker(&self, bucket: u32) {
        let handle = self
            .inner
            .scheduler
            .lock()
            .as_ref()
            .and_then(|provider| provider.provide(bucket))
            .map(|executor| executor.handle().clone())
            .unwrap_or_else(|| self.inner.fallback.clone());
        handle.spawn(bucket::drain_bucket(Arc::clone(&self.inner), bucket));
    }
}

/// Run discovery on `executor`, shutting it down afterwards when `dispose`
/// is set.
async fn run_discovery(
    executor: &Executor,
    dispose: bool,
    api: Arc<dyn GatewayApi>,
    retry: RetryPolicy,
) -> Result<GatewayInfo, GatewayError> {
    let task = executor
        .handle()
        .spawn(async move { fetch_gateway_info(api.as_ref(), retry).await });

    let result = match task.await {
        Ok(result) => result,
        Err(join) if join.is_cancelled() => Err(GatewayError::Interrupted),
        Err(join) => Err(GatewayError::Other(format!("gateway discovery panicked: {join}"))),
    };

    if dispose {
        executor.shutdown();
    }
    result
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SessionController")
            .field("admission_interval", &self.inner.admission_interval)
            .field("concurrency", &state.concurrency)
            .field("buckets", &state.buckets.len())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}
