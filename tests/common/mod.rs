//! Test doubles shared by the integration tests
#![allow(dead_code)]

use arrakis_orchestrator::controller::{ApiResponse, GatewayApi, RetryPolicy};
use arrakis_orchestrator::{
    ConnectNode, DisposePolicy, GatewayError, OrchestratorConfig, Session, SessionBuilder,
    SessionContext, ShardTotal,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const SCENARIO_B_BODY: &str =
    r#"{"url":"wss://example","shards":8,"session_start_limit":{"max_concurrency":1}}"#;

/// Discovery transport that plays back a script, then repeats a fallback
pub struct ScriptedApi {
    script: Mutex<VecDeque<Result<ApiResponse, GatewayError>>>,
    fallback: ApiResponse,
    calls: AtomicU32,
    latency: Duration,
}

impl ScriptedApi {
    pub fn always(status: u16, body: &str) -> Self {
        Self::script(Vec::new(), status, body)
    }

    pub fn script(
        script: Vec<Result<ApiResponse, GatewayError>>,
        status: u16,
        body: &str,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: response(status, body),
            calls: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Answer every request after `latency`
    pub fn slow(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayApi for ScriptedApi {
    async fn get_gateway_bot(&self) -> Result<ApiResponse, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

pub fn response(status: u16, body: &str) -> ApiResponse {
    ApiResponse {
        status,
        body: body.to_string(),
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(1),
    }
}

/// One `run` invocation seen by a [`RecordingNode`]
#[derive(Debug, Clone)]
pub struct Run {
    pub shard_id: u32,
    pub started: Instant,
    pub finished: Instant,
    pub is_last: bool,
    pub ok: bool,
}

pub type RunLog = Arc<Mutex<Vec<Run>>>;

/// Connect node that records every run and fails a scripted number of times
pub struct RecordingNode {
    shard_id: u32,
    log: RunLog,
    hold: Duration,
    failures: AtomicU32,
    failure: fn() -> GatewayError,
}

impl RecordingNode {
    pub fn new(shard_id: u32, log: &RunLog) -> Self {
        Self {
            shard_id,
            log: Arc::clone(log),
            hold: Duration::ZERO,
            failures: AtomicU32::new(0),
            failure: transient,
        }
    }

    /// Keep `run` busy for `hold`
    pub fn holding(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    /// Fail the first `count` runs with `failure()`
    pub fn failing(mut self, count: u32, failure: fn() -> GatewayError) -> Self {
        self.failures = AtomicU32::new(count);
        self.failure = failure;
        self
    }

    pub fn into_node(self) -> Arc<dyn ConnectNode> {
        Arc::new(self)
    }
}

#[async_trait]
impl ConnectNode for RecordingNode {
    fn shard_id(&self) -> u32 {
        self.shard_id
    }

    fn is_reconnect(&self) -> bool {
        false
    }

    async fn run(&self, is_last: bool) -> Result<(), GatewayError> {
        let started = Instant::now();
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.log.lock().push(Run {
            shard_id: self.shard_id,
            started,
            finished: Instant::now(),
            is_last,
            ok: !fail,
        });
        if fail {
            Err((self.failure)())
        } else {
            Ok(())
        }
    }
}

pub fn transient() -> GatewayError {
    GatewayError::transient("handshake", "connection reset")
}

pub fn interrupted() -> GatewayError {
    GatewayError::Interrupted
}

pub fn runs(log: &RunLog) -> Vec<Run> {
    log.lock().clone()
}

/// Wait (in tokio time) until `cond` holds, panicking after `limit`.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Shared record of what a [`FakeBuilder`] did
#[derive(Default)]
pub struct BuildLog {
    pub builds: Mutex<Vec<u32>>,
    pub disposals: Mutex<Vec<(u32, DisposePolicy)>>,
    pub reject_token_for: Mutex<Option<u32>>,
    pub broken: Mutex<Vec<u32>>,
    pub held: Mutex<Option<u32>>,
    /// Lets a held build finish
    pub release: Notify,
}

impl BuildLog {
    pub fn builds(&self) -> Vec<u32> {
        self.builds.lock().clone()
    }

    pub fn disposed(&self) -> Vec<u32> {
        let mut ids: Vec<_> = self.disposals.lock().iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }
}

/// Session builder that never touches the network
#[derive(Clone, Default)]
pub struct FakeBuilder {
    pub log: Arc<BuildLog>,
}

impl FakeBuilder {
    /// Building `shard_id` fails with an authentication error
    pub fn rejecting_token_for(shard_id: u32) -> Self {
        let builder = Self::default();
        *builder.log.reject_token_for.lock() = Some(shard_id);
        builder
    }

    /// Building any of `shard_ids` fails with a transient error
    pub fn broken_for(shard_ids: &[u32]) -> Self {
        let builder = Self::default();
        builder.log.broken.lock().extend_from_slice(shard_ids);
        builder
    }

    /// Building `shard_id` waits for `log.release`
    pub fn holding(shard_id: u32) -> Self {
        let builder = Self::default();
        *builder.log.held.lock() = Some(shard_id);
        builder
    }
}

#[async_trait]
impl SessionBuilder for FakeBuilder {
    type Session = FakeSession;

    async fn build(&self, context: SessionContext) -> Result<FakeSession, GatewayError> {
        let shard_id = context.shard_id;
        self.log.builds.lock().push(shard_id);

        let held = *self.log.held.lock() == Some(shard_id);
        if held {
            self.log.release.notified().await;
        }

        if *self.log.reject_token_for.lock() == Some(shard_id) {
            return Err(GatewayError::Authentication("the provided token is invalid".to_string()));
        }
        if self.log.broken.lock().contains(&shard_id) {
            return Err(transient());
        }

        Ok(FakeSession {
            shard_id,
            log: Arc::clone(&self.log),
        })
    }
}

pub struct FakeSession {
    shard_id: u32,
    log: Arc<BuildLog>,
}

#[async_trait]
impl Session for FakeSession {
    fn shard_id(&self) -> u32 {
        self.shard_id
    }

    async fn dispose(&self, policy: DisposePolicy) {
        self.log.disposals.lock().push((self.shard_id, policy));
    }
}

/// Config for manager tests: fast admission and discovery retries
pub fn test_config(shard_total: ShardTotal) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new("test-token");
    config.shard_total = shard_total;
    config.admission_interval = Duration::from_millis(20);
    config.discovery_retry = fast_retry();
    config.shutdown_hook = false;
    config
}
