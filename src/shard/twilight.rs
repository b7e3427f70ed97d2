//! Twilight gateway sessions
//!
//! Each session runs one Twilight [`Shard`] on the gateway-writer executor.
//! Every (re)connection first goes through the session controller: the
//! runner queues a connect node and only opens the socket once the node is
//! admitted.

use crate::controller::{ConnectNode, SessionController};
use crate::error::GatewayError;
use crate::metrics;
use crate::pool::PoolKind;
use crate::shard::session::{DisposePolicy, Session, SessionBuilder, SessionContext};
use crate::shard::state::{ShardHealth, ShardState};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use twilight_gateway::error::ReceiveMessageErrorType;
use twilight_gateway::{CloseFrame, ConfigBuilder, EventTypeFlags, Intents, Shard, StreamExt as _};
use twilight_model::gateway::{event::Event, ShardId};

/// Time allowed between admission and the first gateway event
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for a graceful close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);

// Circuit breaker: reconnect after N consecutive receive errors
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Gateway event tagged with its shard
#[derive(Debug)]
pub struct ShardEvent {
    pub shard_id: u32,
    pub event: Event,
}

/// Intents requested by default
pub fn default_intents() -> Intents {
    Intents::GUILDS | Intents::GUILD_MEMBERS
}

/// Builds Twilight-backed sessions
#[derive(Clone)]
pub struct TwilightSessionBuilder {
    token: String,
    intents: Intents,
    events: mpsc::Sender<ShardEvent>,
}

impl TwilightSessionBuilder {
    /// Events from every session are forwarded to `events`; they are dropped
    /// when the channel is full.
    pub fn new(token: impl Into<String>, intents: Intents, events: mpsc::Sender<ShardEvent>) -> Self {
        Self {
            token: token.into(),
            intents,
            events,
        }
    }
}

#[async_trait]
impl SessionBuilder for TwilightSessionBuilder {
    type Session = TwilightSession;

    async fn build(&self, context: SessionContext) -> Result<TwilightSession, GatewayError> {
        if self.token.trim().is_empty() {
            return Err(GatewayError::Authentication("bot token is empty".to_string()));
        }

        let shard_id = context.shard_id;
        let (admissions_tx, admissions_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let pending = Arc::new(Mutex::new(None));

        let runner = SessionRunner {
            shard_id,
            shard_total: context.shard_total,
            token: self.token.clone(),
            intents: self.intents,
            large_threshold: context.large_threshold,
            max_reconnect_delay: context.max_reconnect_delay,
            controller: context.controller.clone(),
            state: context.state.clone(),
            events: self.events.clone(),
            admissions_tx,
            admissions: admissions_rx,
            shutdown: shutdown_rx,
            pending: Arc::clone(&pending),
        };

        let handle = context.executors.handle_or_current(PoolKind::GatewayWriter);
        let task = handle.spawn(runner.run());
        debug!(shard_id, gateway = %context.gateway_url, "Session runner spawned");

        Ok(TwilightSession {
            shard_id,
            controller: context.controller,
            shutdown: shutdown_tx,
            pending,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Handle to a running Twilight session
pub struct TwilightSession {
    shard_id: u32,
    controller: SessionController,
    shutdown: watch::Sender<Option<DisposePolicy>>,
    pending: Arc<Mutex<Option<Arc<dyn ConnectNode>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Session for TwilightSession {
    fn shard_id(&self) -> u32 {
        self.shard_id
    }

    async fn dispose(&self, policy: DisposePolicy) {
        let pending = self.pending.lock().take();
        if let Some(node) = pending {
            self.controller.remove_session(&node);
        }
        self.shutdown.send_replace(Some(policy));

        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };

        match policy {
            DisposePolicy::Immediate => task.abort(),
            DisposePolicy::Graceful => {
                let abort = task.abort_handle();
                if tokio::time::timeout(CLOSE_TIMEOUT * 2, task).await.is_err() {
                    warn!(shard_id = self.shard_id, "Session did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }
}

/// Admission handed from the bucket worker to the session runner
struct Admission {
    is_last: bool,
    done: oneshot::Sender<Result<(), GatewayError>>,
}

/// Connect node for one Twilight (re)connection
struct TwilightConnectNode {
    shard_id: u32,
    reconnect: bool,
    admissions: mpsc::Sender<Admission>,
}

#[async_trait]
impl ConnectNode for TwilightConnectNode {
    fn shard_id(&self) -> u32 {
        self.shard_id
    }

    fn is_reconnect(&self) -> bool {
        self.reconnect
    }

    async fn run(&self, is_last: bool) -> Result<(), GatewayError> {
        let (done, result) = oneshot::channel();
        if self.admissions.send(Admission { is_last, done }).await.is_err() {
            debug!(shard_id = self.shard_id, "Session gone before admission");
            return Ok(());
        }
        // A session disposed mid-handshake counts as done.
        result.await.unwrap_or(Ok(()))
    }
}

enum PumpOutcome {
    Disposed,
    Lost { was_ready: bool },
}

struct SessionRunner {
    shard_id: u32,
    shard_total: u32,
    token: String,
    intents: Intents,
    large_threshold: u32,
    max_reconnect_delay: Duration,
    controller: SessionController,
    state: ShardState,
    events: mpsc::Sender<ShardEvent>,
    admissions_tx: mpsc::Sender<Admission>,
    admissions: mpsc::Receiver<Admission>,
    shutdown: watch::Receiver<Option<DisposePolicy>>,
    pending: Arc<Mutex<Option<Arc<dyn ConnectNode>>>>,
}

impl SessionRunner {
    async fn run(mut self) {
        let shard_id = self.shard_id;
        let mut reconnect = false;
        let mut backoff = INITIAL_BACKOFF;

        while !self.stopping() {
            let Some(shard) = self.connect(reconnect).await else {
                break;
            };

            let was_ready = match self.pump(shard).await {
                PumpOutcome::Disposed => break,
                PumpOutcome::Lost { was_ready } => was_ready,
            };
            if was_ready {
                backoff = INITIAL_BACKOFF;
            }

            reconnect = true;
            self.state.set_health(shard_id, ShardHealth::Disconnected);
            self.state.record_reconnect(shard_id);
            info!(shard_id, delay = ?backoff, "Connection lost, reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(self.max_reconnect_delay);
        }

        debug!(shard_id, "Session runner stopped");
    }

    fn stopping(&self) -> bool {
        self.shutdown.borrow().is_some()
    }

    /// Queue a connect node and wait until an admitted handshake succeeds.
    async fn connect(&mut self, reconnect: bool) -> Option<Shard> {
        let node: Arc<dyn ConnectNode> = Arc::new(TwilightConnectNode {
            shard_id: self.shard_id,
            reconnect,
            admissions: self.admissions_tx.clone(),
        });
        *self.pending.lock() = Some(Arc::clone(&node));
        self.state.set_health(self.shard_id, ShardHealth::Connecting);
        self.controller.append_session(node);

        loop {
            let admission = tokio::select! {
                admission = self.admissions.recv() => admission?,
                _ = self.shutdown.changed() => return None,
            };

            match self.handshake(admission.is_last).await {
                Ok(shard) => {
                    *self.pending.lock() = None;
                    let _ = admission.done.send(Ok(()));
                    return Some(shard);
                }
                Err(err) => {
                    warn!(shard_id = self.shard_id, error = %err, "Handshake failed, waiting for next admission");
                    let _ = admission.done.send(Err(err));
                }
            }
        }
    }

    /// Open the connection and wait for the first gateway event.
    async fn handshake(&self, is_last: bool) -> Result<Shard, GatewayError> {
        let config = ConfigBuilder::new(self.token.clone(), self.intents)
            .large_threshold(u64::from(self.large_threshold))
            .build();
        let mut shard = Shard::with_config(ShardId::new(self.shard_id, self.shard_total), config);
        debug!(shard_id = self.shard_id, is_last, "Admitted, opening gateway connection");

        let context = format!("shard {} handshake", self.shard_id);
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, shard.next_event(EventTypeFlags::all())).await;
        match first {
            Ok(Some(Ok(event))) => {
                self.forward(event);
                Ok(shard)
            }
            Ok(Some(Err(source))) => Err(GatewayError::transient(context, source)),
            Ok(None) => Err(GatewayError::transient(context, "gateway stream closed")),
            Err(elapsed) => Err(GatewayError::transient(context, elapsed)),
        }
    }

    /// Run the event loop until the connection is lost or the session is
    /// disposed.
    async fn pump(&mut self, mut shard: Shard) -> PumpOutcome {
        let shard_id = self.shard_id;
        let mut consecutive_errors: u32 = 0;
        let mut was_ready = false;

        loop {
            let item = tokio::select! {
                item = shard.next_event(EventTypeFlags::all()) => item,
                changed = self.shutdown.changed() => {
                    let policy = match changed {
                        Ok(()) => (*self.shutdown.borrow()).unwrap_or(DisposePolicy::Immediate),
                        Err(_) => DisposePolicy::Immediate,
                    };
                    close(&mut shard, shard_id, policy).await;
                    return PumpOutcome::Disposed;
                }
            };

            let event = match item {
                None => {
                    info!(shard_id, "Shard event stream ended");
                    return PumpOutcome::Lost { was_ready };
                }
                Some(Ok(event)) => {
                    consecutive_errors = 0;
                    event
                }
                Some(Err(source)) => {
                    consecutive_errors += 1;
                    warn!(shard_id, error = %source, consecutive = consecutive_errors, "Error receiving event");

                    if matches!(source.kind(), ReceiveMessageErrorType::Reconnect) {
                        let err = GatewayError::ShardReconnectFailed {
                            shard_id,
                            source: Box::new(source),
                        };
                        metrics::record_error(err.error_type_label());
                        error!(shard_id, error = %err, "Reconnect failed, requesting new admission");
                        return PumpOutcome::Lost { was_ready };
                    }

                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        let err = GatewayError::ShardCircuitBroken {
                            shard_id,
                            count: consecutive_errors,
                            max: MAX_CONSECUTIVE_ERRORS,
                        };
                        metrics::record_error(err.error_type_label());
                        error!(shard_id, error = %err, "Consecutive error threshold exceeded");
                        return PumpOutcome::Lost { was_ready };
                    }

                    metrics::record_error("receive_error");
                    // Twilight resumes an identified session on its own.
                    let health = if was_ready {
                        ShardHealth::Resuming
                    } else {
                        ShardHealth::Disconnected
                    };
                    self.state.set_health(shard_id, health);
                    continue;
                }
            };

            match &event {
                Event::Ready(ready) => {
                    was_ready = true;
                    self.state.set_health(shard_id, ShardHealth::Ready);
                    self.state.set_guilds(shard_id, ready.guilds.len() as u64);
                    metrics::set_shards_ready(self.state.ready_shards());
                    info!(
                        shard_id,
                        guilds = ready.guilds.len(),
                        session_id = %ready.session_id,
                        "Shard ready"
                    );
                }
                Event::Resumed => {
                    self.state.set_health(shard_id, ShardHealth::Ready);
                    info!(shard_id, "Shard resumed");
                }
                Event::GatewayHeartbeatAck => {
                    self.state.record_heartbeat(shard_id);
                }
                Event::GuildCreate(guild) => {
                    self.state.adjust_guilds(shard_id, 1);
                    debug!(shard_id, guild_id = %guild.id(), "Guild joined");
                }
                Event::GuildDelete(guild) => {
                    if guild.unavailable != Some(true) {
                        self.state.adjust_guilds(shard_id, -1);
                    }
                    debug!(shard_id, guild_id = %guild.id, "Guild left");
                }
                _ => {}
            }

            self.forward(event);
        }
    }

    fn forward(&self, event: Event) {
        self.state.record_event(self.shard_id);
        match self.events.try_send(ShardEvent {
            shard_id: self.shard_id,
            event,
        }) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                debug!(shard_id = self.shard_id, "Event channel full, dropping event");
            }
        }
    }
}

async fn close(shard: &mut Shard, shard_id: u32, policy: DisposePolicy) {
    match policy {
        DisposePolicy::Immediate => {
            debug!(shard_id, "Dropping gateway connection");
        }
        DisposePolicy::Graceful => {
            shard.close(CloseFrame::NORMAL);
            let drain = async {
                while let Some(item) = shard.next_event(EventTypeFlags::all()).await {
                    if let Ok(Event::GatewayClose(_)) = item {
                        break;
                    }
                }
            };
            if tokio::time::timeout(CLOSE_TIMEOUT, drain).await.is_err() {
                warn!(shard_id, "Close frame not acknowledged in time");
            } else {
                debug!(shard_id, "Gateway connection closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ApiResponse, GatewayApi, RetryPolicy};
    use crate::pool::{PoolOverrides, SharedPools};
    use tokio::runtime::Handle;

    struct NoApi;

    #[async_trait]
    impl GatewayApi for NoApi {
        async fn get_gateway_bot(&self) -> Result<ApiResponse, GatewayError> {
            Err(GatewayError::Other("not used".to_string()))
        }
    }

    fn context(controller: &SessionController) -> SessionContext {
        SessionContext {
            shard_id: 0,
            shard_total: 1,
            gateway_url: "wss://gateway.discord.gg".to_string(),
            controller: controller.clone(),
            executors: SharedPools::new(&PoolOverrides::default()).executors_for(0),
            state: ShardState::new(),
            max_reconnect_delay: Duration::from_secs(32),
            large_threshold: 250,
        }
    }

    #[test]
    fn default_intents_cover_guilds_and_members() {
        let intents = default_intents();
        assert!(intents.contains(Intents::GUILDS));
        assert!(intents.contains(Intents::GUILD_MEMBERS));
    }

    #[tokio::test]
    async fn empty_token_is_an_auth_error() {
        let controller = SessionController::new(
            Arc::new(NoApi),
            Duration::from_secs(5),
            RetryPolicy::default(),
            Handle::current(),
        );
        let (events, _rx) = mpsc::channel(8);
        let builder = TwilightSessionBuilder::new(" ", default_intents(), events);

        let err = builder.build(context(&controller)).await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
    }

    #[tokio::test]
    async fn dispose_stops_a_session_waiting_for_admission() {
        let controller = SessionController::new(
            Arc::new(NoApi),
            Duration::from_secs(3600),
            RetryPolicy::default(),
            Handle::current(),
        );
        controller.set_concurrency(1).unwrap();
        controller.shutdown();

        // A shut-down controller never admits, so the node stays pending
        let (events, _rx) = mpsc::channel(8);
        let builder = TwilightSessionBuilder::new("token", default_intents(), events);
        let session = builder.build(context(&controller)).await.unwrap();
        assert_eq!(session.shard_id(), 0);

        session.dispose(DisposePolicy::Graceful).await;
        assert!(session.task.lock().is_none());
        assert_eq!(controller.pending(), 0);
    }
}
