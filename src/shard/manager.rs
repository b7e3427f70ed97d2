//! Shard manager
//!
//! Owns the fleet: the pending queue of shard ids, the map of live sessions,
//! the single scheduling worker that builds sessions one at a time, and the
//! shared executors. Admission pacing happens downstream in the
//! [`SessionController`]; the manager only decides which sessions exist.
//!
//! Lock order is always shard map, then pending queue.

use crate::config::{OrchestratorConfig, ShardTotal};
use crate::controller::{GatewayApi, HttpGatewayApi, SessionController};
use crate::error::{ErrorKind, GatewayError};
use crate::metrics;
use crate::pool::{PoolKind, SharedPools};
use crate::shard::session::{DisposePolicy, Session, SessionBuilder, SessionContext};
use crate::shard::state::{ShardHealth, ShardSnapshot, ShardState};
use crate::sync::{read_within, write_within, LOCK_TIMEOUT};

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Gateway facts fixed for the manager's lifetime
#[derive(Debug, Clone)]
struct Resolved {
    gateway_url: String,
    shard_total: u32,
}

#[derive(Debug, Default)]
struct PendingQueue {
    ids: VecDeque<u32>,
    /// Id whose session is being built right now
    building: Option<u32>,
    worker_running: bool,
}

struct ManagerInner<B: SessionBuilder> {
    config: OrchestratorConfig,
    builder: B,
    controller: SessionController,
    pools: SharedPools,
    state: ShardState,
    resolved: OnceCell<Resolved>,
    shards: RwLock<BTreeMap<u32, B::Session>>,
    queue: Mutex<PendingQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
    teardown: Mutex<Option<JoinHandle<()>>>,
    logged_in: AtomicBool,
    shut_down: AtomicBool,
    stopped: watch::Sender<bool>,
}

/// Top-level owner of every shard session
pub struct ShardManager<B: SessionBuilder> {
    inner: Arc<ManagerInner<B>>,
}

impl<B: SessionBuilder> Clone for ShardManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: SessionBuilder> ShardManager<B> {
    /// Create a manager. Must be called inside a tokio runtime.
    pub fn new(
        config: OrchestratorConfig,
        builder: B,
        api: Arc<dyn GatewayApi>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let fallback = Handle::try_current().map_err(|e| {
            GatewayError::Config(format!("shard manager must be created inside a tokio runtime: {e}"))
        })?;

        let pools = SharedPools::new(&config.pools);
        let controller = SessionController::new(
            api,
            config.admission_interval,
            config.discovery_retry,
            fallback,
        );
        controller.attach_scheduler(Arc::clone(pools.provider(PoolKind::RateLimitScheduler)));
        controller.attach_elastic(Arc::clone(pools.provider(PoolKind::RateLimitElastic)));

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                builder,
                controller,
                pools,
                state: ShardState::new(),
                resolved: OnceCell::new(),
                shards: RwLock::new(BTreeMap::new()),
                queue: Mutex::new(PendingQueue::default()),
                worker: Mutex::new(None),
                teardown: Mutex::new(None),
                logged_in: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                stopped: watch::channel(false).0,
            }),
        })
    }

    /// Create a manager that discovers the gateway over HTTPS.
    pub fn with_http(config: OrchestratorConfig, builder: B) -> Result<Self, GatewayError> {
        let api = HttpGatewayApi::new(config.api_base.clone(), config.token.clone())?;
        Self::new(config, builder, Arc::new(api))
    }

    pub fn controller(&self) -> &SessionController {
        &self.inner.controller
    }

    pub fn pools(&self) -> &SharedPools {
        &self.inner.pools
    }

    /// Shared status table (for health checks)
    pub fn state(&self) -> ShardState {
        self.inner.state.clone()
    }

    /// Shard total, once configured or discovered
    pub fn shards_total(&self) -> Option<u32> {
        match self.inner.config.shard_total {
            ShardTotal::Fixed(total) => Some(total),
            ShardTotal::Auto => self.inner.resolved.get().map(|r| r.shard_total),
        }
    }

    /// Gateway URL, once discovered
    pub fn gateway_url(&self) -> Option<String> {
        self.inner.resolved.get().map(|r| r.gateway_url.clone())
    }

    pub fn status(&self, shard_id: u32) -> Option<ShardHealth> {
        self.inner.state.get_health(shard_id)
    }

    pub fn statuses(&self) -> Vec<ShardSnapshot> {
        self.inner.state.snapshot()
    }

    /// Shard ids waiting for a session, in build order
    pub fn pending(&self) -> Vec<u32> {
        self.inner.queue.lock().ids.iter().copied().collect()
    }

    /// Shard ids with a live session, ascending
    pub async fn active_ids(&self) -> Result<Vec<u32>, GatewayError> {
        let shards = read_within(&self.inner.shards, "shards", LOCK_TIMEOUT).await?;
        Ok(shards.keys().copied().collect())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Resolves once [`shutdown`](Self::shutdown) has started, whether a
    /// caller asked for it or an authentication failure triggered it.
    pub async fn stopped(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        while !*stopped.borrow_and_update() {
            if stopped.changed().await.is_err() {
                return;
            }
        }
    }

    /// Discover the gateway, queue every shard, build the first one on the
    /// caller's task and hand the rest to the scheduling worker.
    ///
    /// When a worker started by an earlier [`start`](Self::start) is still
    /// running, it keeps ownership of the queue and builds every shard.
    ///
    /// Configuration and authentication failures surface here; the manager
    /// is shut down when login fails.
    pub async fn login(&self) -> Result<(), GatewayError> {
        self.ensure_running()?;
        if self.inner.logged_in.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Config("login() was already called".to_string()));
        }

        match self.login_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(error = %err, "Login failed, shutting down");
                metrics::record_error(err.error_type_label());
                self.shutdown().await;
                Err(err)
            }
        }
    }

    async fn login_inner(&self) -> Result<(), GatewayError> {
        let resolved = self.resolve().await?;
        let total = resolved.shard_total;

        let ids: Vec<u32> = match &self.inner.config.shard_ids {
            Some(ids) => ids.clone(),
            None => (0..total).collect(),
        };
        if let Some(&shard_id) = ids.iter().find(|&&id| id >= total) {
            return Err(GatewayError::InvalidShardId { shard_id, total });
        }

        info!(
            shard_total = total,
            shards = ids.len(),
            concurrency = self.inner.controller.concurrency(),
            "Logging in shard fleet"
        );

        let first = {
            let mut queue = self.inner.queue.lock();
            for id in ids {
                if !queue.ids.contains(&id) {
                    queue.ids.push_back(id);
                    self.inner.state.set_health(id, ShardHealth::Queued);
                }
            }
            metrics::set_pending_shards(queue.ids.len());
            if claim_worker(&mut queue) {
                Some(self.claim_front(&mut queue))
            } else {
                None
            }
        };

        let Some(first) = first else {
            debug!("Scheduling worker already running, leaving the queue to it");
            return Ok(());
        };

        if let Some(shard_id) = first {
            let built = self.build_shard(shard_id).await;
            let mut queue = self.inner.queue.lock();
            queue.building = None;
            if built.is_err() {
                queue.worker_running = false;
            }
            built?;
        }

        self.spawn_worker();
        Ok(())
    }

    /// Queue `shard_id` for a session. No-op when it is already queued or
    /// active.
    pub async fn start(&self, shard_id: u32) -> Result<(), GatewayError> {
        self.validate_shard_id(shard_id)?;
        self.ensure_running()?;

        let spawn = {
            let shards = read_within(&self.inner.shards, "shards", LOCK_TIMEOUT).await?;
            if shards.contains_key(&shard_id) {
                debug!(shard_id, "Shard already active, not queueing");
                return Ok(());
            }
            let mut queue = self.inner.queue.lock();
            if !queue.ids.contains(&shard_id) {
                queue.ids.push_back(shard_id);
                self.inner.state.set_health(shard_id, ShardHealth::Queued);
                debug!(shard_id, pending = queue.ids.len(), "Shard queued");
            }
            metrics::set_pending_shards(queue.ids.len());
            claim_worker(&mut queue)
        };

        if spawn {
            self.spawn_worker();
        }
        Ok(())
    }

    /// Dispose the session for `shard_id` (if any) and queue it again.
    pub async fn restart(&self, shard_id: u32) -> Result<(), GatewayError> {
        self.validate_shard_id(shard_id)?;
        self.ensure_running()?;

        let removed = {
            let mut shards = write_within(&self.inner.shards, "shards", LOCK_TIMEOUT).await?;
            let removed = shards.remove(&shard_id);
            metrics::set_active_shards(shards.len());
            removed
        };

        if let Some(session) = removed {
            info!(shard_id, "Restarting shard");
            self.dispatch_dispose(vec![(shard_id, session)], self.callback_handle());
        }

        self.start(shard_id).await
    }

    /// Restart every active shard in ascending id order.
    pub async fn restart_all(&self) -> Result<(), GatewayError> {
        let ids = self.active_ids().await?;
        info!(shards = ids.len(), "Restarting all shards");
        for shard_id in ids {
            self.restart(shard_id).await?;
        }
        Ok(())
    }

    /// Dispose the session for `shard_id` only. The pending queue and the
    /// other shards are untouched.
    pub async fn shutdown_shard(&self, shard_id: u32) -> Result<(), GatewayError> {
        let removed = {
            let mut shards = write_within(&self.inner.shards, "shards", LOCK_TIMEOUT).await?;
            let removed = shards.remove(&shard_id);
            metrics::set_active_shards(shards.len());
            removed
        };

        if let Some(session) = removed {
            info!(shard_id, "Shutting down shard");
            self.inner.state.set_health(shard_id, ShardHealth::Shutdown);
            self.dispatch_dispose(vec![(shard_id, session)], self.callback_handle());
        }
        Ok(())
    }

    /// Shut the whole fleet down.
    ///
    /// Idempotent. Clears the pending queue, stops admission and hands
    /// session teardown to a background task, then returns without waiting
    /// for it. The scheduling worker stops after the build it is running. See [`await_termination`](Self::await_termination).
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down shard manager");
        self.inner.stopped.send_replace(true);

        // A build in flight finishes on the worker and disposes its own
        // session once it sees the flag.
        let worker = self.inner.worker.lock().take();

        let dropped = {
            let mut queue = self.inner.queue.lock();
            queue.worker_running = false;
            for &shard_id in &queue.ids {
                self.inner.state.set_health(shard_id, ShardHealth::Shutdown);
            }
            if let Some(shard_id) = queue.building.take() {
                self.inner.state.set_health(shard_id, ShardHealth::Shutdown);
            }
            let dropped = queue.ids.len();
            queue.ids.clear();
            dropped
        };
        metrics::set_pending_shards(0);

        self.inner.controller.shutdown();

        let sessions: Vec<(u32, B::Session)> =
            match write_within(&self.inner.shards, "shards", LOCK_TIMEOUT).await {
                Ok(mut shards) => std::mem::take(&mut *shards).into_iter().collect(),
                Err(err) => {
                    error!(error = %err, "Could not drain shard map during shutdown");
                    Vec::new()
                }
            };
        metrics::set_active_shards(0);

        for (shard_id, _) in &sessions {
            self.inner.state.set_health(*shard_id, ShardHealth::Shutdown);
        }
        debug!(sessions = sessions.len(), dropped, "Dispatching fleet teardown");

        let disposal = self.dispatch_dispose(sessions, Handle::current());
        let pools = self.inner.pools.clone();
        let teardown = tokio::spawn(async move {
            if let Some(worker) = worker {
                if let Err(e) = worker.await {
                    warn!(error = %e, "Scheduling worker failed");
                }
            }
            let _ = disposal.await;
            pools.shutdown();
            info!("Shard manager shutdown complete");
        });
        *self.inner.teardown.lock() = Some(teardown);
    }

    /// Wait for the teardown started by [`shutdown`](Self::shutdown).
    pub async fn await_termination(&self) {
        let teardown = self.inner.teardown.lock().take();
        if let Some(teardown) = teardown {
            if let Err(e) = teardown.await {
                warn!(error = %e, "Teardown task failed");
            }
        }
    }

    async fn resolve(&self) -> Result<Resolved, GatewayError> {
        let resolved = self
            .inner
            .resolved
            .get_or_try_init(|| async {
                let info = self.inner.controller.discover_gateway().await?;
                self.inner.controller.set_concurrency(info.max_concurrency())?;

                let shard_total = match self.inner.config.shard_total {
                    ShardTotal::Fixed(total) => total,
                    ShardTotal::Auto => info.shards,
                };
                self.inner.pools.init(shard_total)?;

                info!(
                    shard_total,
                    recommended = info.shards,
                    gateway = %info.url,
                    "Shard layout resolved"
                );
                Ok::<_, GatewayError>(Resolved {
                    gateway_url: info.url,
                    shard_total,
                })
            })
            .await?;
        Ok(resolved.clone())
    }

    /// Build, then insert under the map lock, then dequeue under the queue
    /// lock. The caller has already claimed `shard_id` as in flight.
    async fn build_shard(&self, shard_id: u32) -> Result<(), GatewayError> {
        let resolved = match self.resolve().await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.mark_dead(shard_id);
                return Err(err);
            }
        };

        let context = SessionContext {
            shard_id,
            shard_total: resolved.shard_total,
            gateway_url: resolved.gateway_url,
            controller: self.inner.controller.clone(),
            executors: self.inner.pools.executors_for(shard_id),
            state: self.inner.state.clone(),
            max_reconnect_delay: self.inner.config.max_reconnect_delay,
            large_threshold: self.inner.config.large_threshold,
        };

        let session = match self.inner.builder.build(context).await {
            Ok(session) => session,
            Err(err) => {
                self.mark_dead(shard_id);
                return Err(err);
            }
        };

        let mut shards = match write_within(&self.inner.shards, "shards", LOCK_TIMEOUT).await {
            Ok(shards) => shards,
            Err(err) => {
                session.dispose(DisposePolicy::Immediate).await;
                return Err(err);
            }
        };
        if self.is_shut_down() {
            drop(shards);
            debug!(shard_id, "Manager shut down mid-build, disposing new session");
            session.dispose(self.inner.config.dispose_policy).await;
            return Err(GatewayError::ShutDown);
        }

        let replaced = shards.insert(shard_id, session);
        metrics::set_active_shards(shards.len());
        {
            let mut queue = self.inner.queue.lock();
            queue.ids.retain(|&id| id != shard_id);
            metrics::set_pending_shards(queue.ids.len());
        }
        drop(shards);

        self.inner
            .state
            .transition(shard_id, ShardHealth::Building, ShardHealth::Connecting);
        if let Some(previous) = replaced {
            warn!(shard_id, "Replaced an existing session");
            self.dispatch_dispose(vec![(shard_id, previous)], self.callback_handle());
        }
        debug!(shard_id, "Shard session built");
        Ok(())
    }

    /// Shutdown may already have marked the shard.
    fn mark_dead(&self, shard_id: u32) {
        self.inner
            .state
            .transition(shard_id, ShardHealth::Building, ShardHealth::Dead);
    }

    /// Record the queue front as in flight. Must hold the queue lock.
    fn claim_front(&self, queue: &mut PendingQueue) -> Option<u32> {
        let next = queue.ids.front().copied();
        queue.building = next;
        if let Some(shard_id) = next {
            self.inner.state.set_health(shard_id, ShardHealth::Building);
        }
        next
    }

    fn spawn_worker(&self) {
        let manager = self.clone();
        let worker = tokio::spawn(async move { manager.process_queue().await });
        *self.inner.worker.lock() = Some(worker);
    }

    /// Single scheduling worker: builds queued shards one at a time.
    async fn process_queue(self) {
        debug!("Scheduling worker started");
        loop {
            let next = {
                let mut queue = self.inner.queue.lock();
                let next = if self.is_shut_down() {
                    None
                } else {
                    self.claim_front(&mut queue)
                };
                if next.is_none() {
                    queue.worker_running = false;
                }
                next
            };

            let Some(shard_id) = next else {
                debug!("Scheduling worker idle, exiting");
                return;
            };

            let built = self.build_shard(shard_id).await;
            self.inner.queue.lock().building = None;
            let Err(err) = built else {
                continue;
            };

            if self.is_shut_down() {
                debug!(shard_id, "Scheduling worker stopping after shutdown");
                return;
            }

            metrics::record_error(err.error_type_label());
            match err.kind() {
                ErrorKind::Auth => {
                    error!(shard_id, error = %err, "Authentication failed, shutting down all shards");
                    self.inner.queue.lock().worker_running = false;
                    let manager = self.clone();
                    tokio::spawn(async move { manager.shutdown().await });
                    return;
                }
                ErrorKind::Config
                | ErrorKind::TransientNetwork
                | ErrorKind::RateLimited
                | ErrorKind::Interrupted
                | ErrorKind::Other => {
                    error!(shard_id, error = %err, "Failed to build shard session, dropping it from this pass");
                    let mut queue = self.inner.queue.lock();
                    queue.ids.retain(|&id| id != shard_id);
                    metrics::set_pending_shards(queue.ids.len());
                }
            }
        }
    }

    fn dispatch_dispose(&self, sessions: Vec<(u32, B::Session)>, handle: Handle) -> JoinHandle<()> {
        let policy = self.inner.config.dispose_policy;
        handle.spawn(async move {
            let tasks: Vec<_> = sessions
                .into_iter()
                .map(|(shard_id, session)| {
                    tokio::spawn(async move {
                        session.dispose(policy).await;
                        debug!(shard_id, ?policy, "Session disposed");
                    })
                })
                .collect();
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Session disposal failed");
                }
            }
        })
    }

    fn callback_handle(&self) -> Handle {
        self.inner
            .pools
            .provider(PoolKind::Callback)
            .provide(0)
            .map(|executor| executor.handle().clone())
            .unwrap_or_else(Handle::current)
    }

    fn validate_shard_id(&self, shard_id: u32) -> Result<u32, GatewayError> {
        let total = self.shards_total().ok_or_else(|| {
            GatewayError::Config("shard total is unknown until login() completes".to_string())
        })?;
        if shard_id >= total {
            return Err(GatewayError::InvalidShardId { shard_id, total });
        }
        Ok(total)
    }

    fn ensure_running(&self) -> Result<(), GatewayError> {
        if self.is_shut_down() {
            return Err(GatewayError::ShutDown);
        }
        Ok(())
    }
}

/// Mark the worker as running; returns true if the caller must spawn it.
fn claim_worker(queue: &mut PendingQueue) -> bool {
    if queue.worker_running {
        false
    } else {
        queue.worker_running = true;
        true
    }
}
