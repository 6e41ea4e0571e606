//! Connection Manager
//!
//! A single task owns the stream connection, the subscription registry,
//! the update batcher and the fallback poller. Consumers talk to it through
//! a cloneable [`StreamClient`] handle; it answers through the quote store's
//! update feed and a `watch` channel carrying [`StreamStatus`].
//!
//! # State Machine
//!
//! ```text
//!            connect()                 handshake ok
//!   CLOSED ────────────► CONNECTING ─────────────────► OPEN
//!     ▲  (market status     │                           │
//!     │   checked first)    │ error                     │ error / close
//!     │                     ▼                           ▼
//!     └──────────── CLOSED + reconnect timer ◄──────────┘
//!
//!   disconnect(): OPEN ──► CLOSING ──► CLOSED, every timer cleared
//! ```
//!
//! While `OPEN` a heartbeat pings the peer and treats a silent connection
//! as lost.
//!
//! Every timer is an `Option<Instant>` raced in one `select!`, and every
//! in-flight request is an `Option<BoxFuture>` polled from the same loop,
//! so clearing a field is all it takes to cancel it.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use super::heartbeat::{Heartbeat, HeartbeatConfig};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    CollaboratorError, InboundFrame, MarketStatusPort, QuoteCache, StreamConnection,
    StreamConnector, TransportError,
};
use crate::application::services::{
    DEFAULT_BATCH_WINDOW, QuoteBatch, QuoteStore, SnapshotPoller, SnapshotResults, UpdateBatcher,
};
use crate::domain::instrument::InstrumentKey;
use crate::domain::normalizer;
use crate::domain::quote::Quote;
use crate::domain::streaming::{ConnectionState, InboundMessage, OutboundMessage, StreamStatus};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::metrics::{self, PollOutcome};

/// Capacity of the command channel.
const COMMAND_CAPACITY: usize = 64;

type ConnectFuture = BoxFuture<'static, Result<Box<dyn StreamConnection>, TransportError>>;
type MarketFuture = BoxFuture<'static, Result<bool, CollaboratorError>>;
type PollFuture = BoxFuture<'static, SnapshotResults>;

// =============================================================================
// Configuration
// =============================================================================

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Stream endpoint. `None` disables streaming; only snapshots are used.
    pub url: Option<String>,
    /// Update batching window.
    pub batch_window: Duration,
    /// Delay between context-switch unsubscribes and the new subscribes.
    pub grace_delay: Duration,
    /// Backoff for automatic reconnects.
    pub reconnect: ReconnectConfig,
    /// Delay before re-checking a closed market.
    pub market_recheck: Duration,
    /// Keepalive pings and silence detection.
    pub heartbeat: HeartbeatConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            url: None,
            batch_window: DEFAULT_BATCH_WINDOW,
            grace_delay: Duration::from_millis(250),
            reconnect: ReconnectConfig::default(),
            market_recheck: Duration::from_secs(60),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Collaborators injected into the manager.
#[derive(Clone)]
pub struct ManagerDeps {
    /// Opens stream connections.
    pub connector: Arc<dyn StreamConnector>,
    /// Market-status gate. Without one the market is assumed open.
    pub market: Option<Arc<dyn MarketStatusPort>>,
    /// Snapshot fallback. Without one nothing is polled.
    pub poller: Option<SnapshotPoller>,
    /// Quote table shared with consumers.
    pub store: Arc<QuoteStore>,
    /// Durable mirror of live quotes.
    pub cache: Arc<dyn QuoteCache>,
}

// =============================================================================
// Client Handle
// =============================================================================

/// The connection manager task has stopped.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("connection manager is not running")]
pub struct ManagerStopped;

enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    SetDesired(Vec<InstrumentKey>),
    TriggerFallback,
}

/// Cloneable handle to a running connection manager.
#[derive(Clone)]
pub struct StreamClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StreamStatus>,
    store: Arc<QuoteStore>,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    /// Start connecting. A no-op unless the connection is `CLOSED`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerStopped` if the manager task has exited.
    pub async fn connect(&self) -> Result<(), ManagerStopped> {
        self.send(Command::Connect).await
    }

    /// Tear the connection down and clear every timer.
    ///
    /// Resolves once teardown is complete. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns `ManagerStopped` if the manager task has exited.
    pub async fn disconnect(&self) -> Result<(), ManagerStopped> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Disconnect(ack)).await?;
        done.await.map_err(|_| ManagerStopped)
    }

    /// Replace the set of instruments to stream.
    ///
    /// # Errors
    ///
    /// Returns `ManagerStopped` if the manager task has exited.
    pub async fn set_desired(
        &self,
        keys: impl IntoIterator<Item = InstrumentKey>,
    ) -> Result<(), ManagerStopped> {
        self.send(Command::SetDesired(keys.into_iter().collect()))
            .await
    }

    /// Allow one more snapshot poll while the stream is down.
    ///
    /// # Errors
    ///
    /// Returns `ManagerStopped` if the manager task has exited.
    pub async fn trigger_fallback(&self) -> Result<(), ManagerStopped> {
        self.send(Command::TriggerFallback).await
    }

    /// Connection-status signal.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Current connection status.
    #[must_use]
    pub fn current_status(&self) -> StreamStatus {
        *self.status.borrow()
    }

    /// Quote-update feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QuoteBatch> {
        self.store.subscribe()
    }

    /// Current quote for `key`, `NO_DATA` if unknown.
    #[must_use]
    pub fn quote(&self, key: &InstrumentKey) -> Quote {
        self.store.get_or_empty(key)
    }

    /// Shared quote table.
    #[must_use]
    pub const fn store(&self) -> &Arc<QuoteStore> {
        &self.store
    }

    async fn send(&self, command: Command) -> Result<(), ManagerStopped> {
        self.commands.send(command).await.map_err(|_| ManagerStopped)
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Owner of the stream connection and everything timed around it.
pub struct ConnectionManager {
    config: ManagerConfig,
    connector: Arc<dyn StreamConnector>,
    market: Option<Arc<dyn MarketStatusPort>>,
    poller: Option<SnapshotPoller>,
    store: Arc<QuoteStore>,
    codec: JsonCodec,
    registry: SubscriptionRegistry,
    batcher: UpdateBatcher,
    policy: ReconnectPolicy,
    heartbeat: Heartbeat,
    status: watch::Sender<StreamStatus>,

    state: ConnectionState,
    market_open: Option<bool>,
    polling: bool,
    fallback_armed: bool,
    deferred: Vec<OutboundMessage>,

    connection: Option<Box<dyn StreamConnection>>,
    connecting: Option<ConnectFuture>,
    market_check: Option<MarketFuture>,
    poll: Option<PollFuture>,

    grace_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    recheck_at: Option<Instant>,
    repoll_at: Option<Instant>,
}

impl ConnectionManager {
    /// Spawn the manager on the current runtime.
    ///
    /// The task stops when `cancel` fires or every handle is dropped,
    /// tearing the connection down first.
    #[must_use]
    pub fn spawn(
        config: ManagerConfig,
        deps: ManagerDeps,
        cancel: CancellationToken,
    ) -> (StreamClient, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(StreamStatus::default());

        let client = StreamClient {
            commands: commands_tx,
            status: status_rx,
            store: Arc::clone(&deps.store),
        };

        let manager = Self {
            batcher: UpdateBatcher::new(config.batch_window, Arc::clone(&deps.store), deps.cache),
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            heartbeat: Heartbeat::new(config.heartbeat.clone()),
            config,
            connector: deps.connector,
            market: deps.market,
            poller: deps.poller,
            store: deps.store,
            codec: JsonCodec::new(),
            registry: SubscriptionRegistry::new(),
            status: status_tx,
            state: ConnectionState::Closed,
            market_open: None,
            polling: false,
            fallback_armed: false,
            deferred: Vec::new(),
            connection: None,
            connecting: None,
            market_check: None,
            poll: None,
            grace_at: None,
            reconnect_at: None,
            recheck_at: None,
            repoll_at: None,
        };

        let handle = tokio::spawn(manager.run(commands_rx, cancel));
        (client, handle)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        tracing::debug!("Connection manager started");
        self.publish();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    self.teardown().await;
                    break;
                }
                () = sleep_opt(self.batcher.deadline()) => {
                    self.flush_batch();
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.teardown().await;
                        break;
                    };
                    self.handle_command(command).await;
                }
                result = drive(&mut self.connecting) => {
                    self.on_handshake(result).await;
                }
                result = drive(&mut self.market_check) => {
                    self.on_market_status(result);
                }
                results = drive(&mut self.poll) => {
                    self.on_poll_complete(results);
                }
                () = sleep_opt(self.grace_at) => {
                    self.grace_at = None;
                    let deferred = std::mem::take(&mut self.deferred);
                    self.send_all(deferred).await;
                }
                () = sleep_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    tracing::info!(attempt = self.policy.attempt_count(), "Reconnecting to quote stream");
                    self.begin_attempt();
                }
                () = sleep_opt(self.recheck_at) => {
                    self.recheck_at = None;
                    tracing::debug!("Re-checking market status");
                    self.begin_attempt();
                }
                () = sleep_opt(self.repoll_at) => {
                    self.repoll_at = None;
                    self.fallback_armed = true;
                    self.start_fallback();
                    self.repoll_at = Some(Instant::now() + self.config.market_recheck);
                }
                frame = recv_frame(&mut self.connection) => {
                    self.on_frame(frame);
                }
                () = sleep_opt(self.heartbeat.silence_deadline()) => {
                    metrics::record_heartbeat_timeout();
                    tracing::warn!(
                        silence_secs = self.heartbeat.config().silence_limit().as_secs(),
                        "Quote stream went silent"
                    );
                    self.on_connection_lost();
                }
                () = sleep_opt(self.heartbeat.ping_deadline()) => {
                    self.send_ping().await;
                }
            }
        }

        tracing::debug!("Connection manager stopped");
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect(ack) => {
                self.teardown().await;
                let _ = ack.send(());
            }
            Command::SetDesired(keys) => self.set_desired(keys).await,
            Command::TriggerFallback => {
                self.fallback_armed = true;
                self.start_fallback();
            }
        }
    }

    fn connect(&mut self) {
        if self.state != ConnectionState::Closed || self.market_check.is_some() {
            tracing::debug!(state = self.state.as_str(), "Connect ignored; attempt already active");
            return;
        }

        self.reconnect_at = None;
        self.recheck_at = None;
        self.repoll_at = None;
        if !self.policy.should_retry() {
            self.policy.reset();
        }
        self.begin_attempt();
    }

    async fn set_desired(&mut self, keys: Vec<InstrumentKey>) {
        let plan = self.registry.set_desired(keys);
        metrics::set_subscriptions(self.registry.len());
        self.publish();

        if plan.is_empty() || self.state != ConnectionState::Open {
            return;
        }

        if self.grace_at.is_some() {
            // The pending subscribes belong to a superseded set.
            let unsubscribes = plan
                .immediate
                .into_iter()
                .filter(OutboundMessage::is_unsubscribe)
                .collect();
            if self.send_all(unsubscribes).await {
                self.deferred = self.registry.subscribe_all();
                self.grace_at = Some(Instant::now() + self.config.grace_delay);
            }
            return;
        }

        if self.send_all(plan.immediate).await && !plan.deferred.is_empty() {
            tracing::debug!(
                generation = %self.registry.generation(),
                "Context switch; delaying subscribes"
            );
            self.deferred = plan.deferred;
            self.grace_at = Some(Instant::now() + self.config.grace_delay);
        }
    }

    async fn teardown(&mut self) {
        if self.state == ConnectionState::Open {
            let unsubscribes = self.registry.unsubscribe_all();
            if let Some(connection) = self.connection.as_mut() {
                for message in unsubscribes {
                    let Ok(text) = self.codec.encode(&message) else {
                        continue;
                    };
                    if connection.send(text).await.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(mut connection) = self.connection.take() {
            self.set_state(ConnectionState::Closing);
            connection.close().await;
        }
        self.heartbeat.stop();

        self.connecting = None;
        self.market_check = None;
        self.poll = None;
        self.grace_at = None;
        self.reconnect_at = None;
        self.recheck_at = None;
        self.repoll_at = None;
        self.deferred.clear();
        self.fallback_armed = false;
        self.polling = false;
        self.policy.reset();

        self.flush_batch();
        self.store.demote_live();

        if self.state != ConnectionState::Closed {
            tracing::info!("Disconnected from quote stream");
        }
        self.set_state(ConnectionState::Closed);
    }

    // -------------------------------------------------------------------------
    // Connection Lifecycle
    // -------------------------------------------------------------------------

    fn begin_attempt(&mut self) {
        if self.state != ConnectionState::Closed || self.market_check.is_some() {
            return;
        }
        self.fallback_armed = true;

        if self.config.url.is_none() {
            tracing::warn!("No stream URL configured; using snapshots only");
            self.start_fallback();
            return;
        }

        match &self.market {
            Some(market) => {
                let market = Arc::clone(market);
                self.market_check = Some(async move { market.is_open().await }.boxed());
            }
            None => self.begin_handshake(),
        }
    }

    fn on_market_status(&mut self, result: Result<bool, CollaboratorError>) {
        match result {
            Ok(true) => {
                self.market_open = Some(true);
                self.begin_handshake();
            }
            Ok(false) => {
                tracing::info!(
                    recheck_secs = self.config.market_recheck.as_secs(),
                    "Market closed; serving snapshots"
                );
                self.market_open = Some(false);
                self.start_fallback();
                self.recheck_at = Some(Instant::now() + self.config.market_recheck);
                self.publish();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Market status unavailable; connecting anyway");
                self.market_open = None;
                self.begin_handshake();
            }
        }
    }

    fn begin_handshake(&mut self) {
        let Some(url) = self.config.url.clone() else {
            return;
        };
        tracing::info!(url = %url, "Connecting to quote stream");
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        self.connecting = Some(async move { connector.connect(&url).await }.boxed());
    }

    async fn on_handshake(
        &mut self,
        result: Result<Box<dyn StreamConnection>, TransportError>,
    ) {
        match result {
            Ok(connection) => {
                self.connection = Some(connection);
                self.policy.reset();
                self.reconnect_at = None;
                self.recheck_at = None;
                self.repoll_at = None;
                self.poll = None;
                self.polling = false;
                self.grace_at = None;
                self.deferred.clear();
                self.heartbeat.start(Instant::now());
                self.set_state(ConnectionState::Open);
                tracing::info!(
                    instruments = self.registry.len(),
                    generation = %self.registry.generation(),
                    "Quote stream open"
                );

                let subscribes = self.registry.subscribe_all();
                self.send_all(subscribes).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Quote stream handshake failed");
                self.on_connection_lost();
            }
        }
    }

    fn on_connection_lost(&mut self) {
        self.connection = None;
        self.connecting = None;
        self.heartbeat.stop();
        self.grace_at = None;
        self.deferred.clear();

        self.flush_batch();
        let demoted = self.store.demote_live();
        if demoted > 0 {
            tracing::debug!(demoted, "Live quotes marked last known");
        }

        self.state = ConnectionState::Closed;
        self.start_fallback();
        self.schedule_reconnect();
        self.publish();
    }

    fn schedule_reconnect(&mut self) {
        if let Some(delay) = self.policy.next_delay() {
            metrics::record_reconnect();
            tracing::info!(
                attempt = self.policy.attempt_count(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Scheduling reconnect"
            );
            self.reconnect_at = Some(Instant::now() + delay);
        } else {
            tracing::warn!(
                attempts = self.policy.attempt_count(),
                "Reconnect attempts exhausted; polling snapshots until connect() is called"
            );
            self.repoll_at = Some(Instant::now() + self.config.market_recheck);
        }
    }

    // -------------------------------------------------------------------------
    // Inbound Frames
    // -------------------------------------------------------------------------

    fn on_frame(&mut self, frame: Option<Result<InboundFrame, TransportError>>) {
        if matches!(frame, Some(Ok(_))) {
            self.heartbeat.record_activity(Instant::now());
        }
        match frame {
            Some(Ok(InboundFrame::Text(text))) => self.on_text(&text),
            Some(Ok(InboundFrame::Pong)) => tracing::trace!("Heartbeat pong"),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Quote stream error");
                self.on_connection_lost();
            }
            None => {
                tracing::info!("Quote stream closed by peer");
                self.on_connection_lost();
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        let messages = match self.codec.decode(text) {
            Ok(messages) => messages,
            Err(e) => {
                metrics::record_frame_malformed();
                tracing::debug!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        for message in messages {
            metrics::record_frame_received(message.kind());
            self.on_message(&message);
        }
    }

    fn on_message(&mut self, message: &InboundMessage) {
        match message {
            InboundMessage::Tick(_) => {
                match normalizer::evaluate(
                    message,
                    self.registry.alias_table(),
                    self.registry.generation(),
                    Utc::now(),
                ) {
                    Ok(tick) => {
                        metrics::record_tick_normalized();
                        self.batcher.ingest(tick);
                    }
                    Err(reason) => {
                        metrics::record_tick_dropped(reason);
                        tracing::trace!(reason = reason.as_str(), "Dropped tick");
                    }
                }
            }
            InboundMessage::Subscribed(ack) => {
                tracing::debug!(message = %ack.text(), "Subscription acknowledged");
            }
            InboundMessage::Unsubscribed(ack) => {
                tracing::debug!(message = %ack.text(), "Unsubscription acknowledged");
            }
            InboundMessage::Info(ack) => {
                tracing::info!(message = %ack.text(), "Quote stream notice");
            }
            InboundMessage::Error(ack) => {
                tracing::warn!(message = %ack.text(), "Quote stream reported an error");
            }
            InboundMessage::Unknown => {
                tracing::trace!("Ignoring unknown frame type");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Send `messages` in order. Returns `false` if the connection was lost.
    async fn send_all(&mut self, messages: Vec<OutboundMessage>) -> bool {
        for message in messages {
            let text = match self.codec.encode(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(action = message.action(), error = %e, "Failed to encode command");
                    continue;
                }
            };
            let Some(connection) = self.connection.as_mut() else {
                return false;
            };
            tracing::debug!(action = message.action(), "Sending subscription command");
            if let Err(e) = connection.send(text).await {
                tracing::warn!(action = message.action(), error = %e, "Failed to send command");
                self.on_connection_lost();
                return false;
            }
        }
        true
    }

    async fn send_ping(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            self.heartbeat.stop();
            return;
        };
        if let Err(e) = connection.ping().await {
            tracing::warn!(error = %e, "Failed to send heartbeat ping");
            self.on_connection_lost();
            return;
        }
        self.heartbeat.record_ping(Instant::now());
    }

    // -------------------------------------------------------------------------
    // Batching and Fallback
    // -------------------------------------------------------------------------

    fn flush_batch(&mut self) {
        let changes = self.batcher.flush();
        if !changes.is_empty() {
            metrics::record_batch_flushed(changes.len());
        }
    }

    fn start_fallback(&mut self) {
        if self.state == ConnectionState::Open || self.poll.is_some() || !self.fallback_armed {
            return;
        }
        let Some(poller) = self.poller.clone() else {
            return;
        };
        let keys: Vec<InstrumentKey> = self.registry.desired().cloned().collect();
        if keys.is_empty() {
            return;
        }

        self.fallback_armed = false;
        self.polling = true;
        tracing::debug!(instruments = keys.len(), "Polling snapshots");
        self.poll = Some(async move { poller.fetch(keys).await }.boxed());
        self.publish();
    }

    fn on_poll_complete(&mut self, results: SnapshotResults) {
        let Some(poller) = self.poller.as_ref() else {
            return;
        };
        let report = poller.apply(results);
        metrics::record_fallback_poll(PollOutcome::classify(
            report.applied + report.reset,
            report.failed,
        ));
        tracing::debug!(
            applied = report.applied,
            reset = report.reset,
            failed = report.failed,
            "Snapshot poll complete"
        );
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let next = StreamStatus {
            state: self.state,
            polling: self.polling,
            generation: self.registry.generation().get(),
            reconnect_attempt: self.policy.attempt_count(),
            market_open: self.market_open,
        };
        metrics::set_connection_state(self.state);
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

// =============================================================================
// Select Helpers
// =============================================================================

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Poll the future in `slot` to completion and clear the slot.
///
/// Pending forever when the slot is empty. Dropping this future leaves the
/// inner future in place for the next loop iteration.
async fn drive<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    let Some(future) = slot.as_mut() else {
        return pending().await;
    };
    let output = future.await;
    *slot = None;
    output
}

/// Next frame from the connection, or pending forever without one.
async fn recv_frame(
    connection: &mut Option<Box<dyn StreamConnection>>,
) -> Option<Result<InboundFrame, TransportError>> {
    match connection.as_mut() {
        Some(connection) => connection.next_frame().await,
        None => pending().await,
    }
}
