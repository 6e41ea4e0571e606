//! Connection Lifecycle Integration Tests
//!
//! Drives a real `ConnectionManager` against scripted transport and
//! collaborator fakes on a paused clock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use quote_stream_client::application::ports::{
    CollaboratorError, InboundFrame, MarketStatusPort, SnapshotPort, SnapshotQuote,
    StreamConnection, StreamConnector, TransportError,
};
use quote_stream_client::infrastructure::persistence::InMemoryQuoteCache;
use quote_stream_client::infrastructure::stream::{HeartbeatConfig, ReconnectConfig};
use quote_stream_client::{
    ConnectionManager, ConnectionState, InstrumentKey, ManagerConfig, ManagerDeps, OptionSide,
    QuoteStatus, QuoteStore, SnapshotPoller, StreamClient, StreamStatus,
};

const URL: &str = "ws://gateway.test/quotes";

// =============================================================================
// Fakes
// =============================================================================

/// How the next handshake ends.
enum Session {
    Refuse,
    Accept(mpsc::UnboundedReceiver<String>),
}

/// Connector that plays back scripted sessions, refusing once they run out.
#[derive(Default)]
struct ScriptedConnector {
    sessions: Mutex<VecDeque<Session>>,
    attempts: Mutex<Vec<Instant>>,
    sent: Arc<Mutex<Vec<Value>>>,
    pings: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    /// Queue an accepted session and return its frame feed.
    fn accept(&self) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().push_back(Session::Accept(rx));
        tx
    }

    fn refuse(&self) {
        self.sessions.lock().push_back(Session::Refuse);
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    fn sent_actions(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|m| m["action"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn StreamConnection>, TransportError> {
        self.attempts.lock().push(Instant::now());
        match self.sessions.lock().pop_front() {
            Some(Session::Accept(frames)) => Ok(Box::new(FakeConnection {
                frames,
                sent: Arc::clone(&self.sent),
                pings: Arc::clone(&self.pings),
            })),
            Some(Session::Refuse) | None => Err(TransportError::Connect("refused".into())),
        }
    }
}

/// Connection fed by the test. It never answers pings on its own.
struct FakeConnection {
    frames: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<Value>>>,
    pings: Arc<AtomicUsize>,
}

#[async_trait]
impl StreamConnection for FakeConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let value = serde_json::from_str(&text).map_err(|e| TransportError::Send(e.to_string()))?;
        self.sent.lock().push(value);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        self.frames.recv().await.map(|text| Ok(InboundFrame::Text(text)))
    }

    async fn close(&mut self) {
        self.frames.close();
    }
}

struct FixedMarket {
    open: bool,
    calls: AtomicUsize,
}

impl FixedMarket {
    fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            open,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MarketStatusPort for FixedMarket {
    async fn is_open(&self) -> Result<bool, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.open)
    }
}

/// Snapshot port answering every key with a last-known price after `delay`.
struct CountingSnapshots {
    delay: Duration,
    calls: AtomicUsize,
}

impl CountingSnapshots {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotPort for CountingSnapshots {
    async fn fetch(&self, _key: &InstrumentKey) -> Result<SnapshotQuote, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        Ok(SnapshotQuote {
            ltp: Some(dec!(250)),
            close: Some(dec!(245)),
            status: Some("closed".to_string()),
            ..SnapshotQuote::default()
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    client: StreamClient,
    connector: Arc<ScriptedConnector>,
    cancel: CancellationToken,
}

fn start(
    market: Option<Arc<FixedMarket>>,
    snapshots: Option<Arc<CountingSnapshots>>,
) -> Harness {
    start_with(ManagerConfig::default(), market, snapshots)
}

fn start_with(
    config: ManagerConfig,
    market: Option<Arc<FixedMarket>>,
    snapshots: Option<Arc<CountingSnapshots>>,
) -> Harness {
    let connector = Arc::new(ScriptedConnector::default());
    let store = Arc::new(QuoteStore::default());
    let cache = Arc::new(InMemoryQuoteCache::new());
    let poller = snapshots.map(|snapshots| {
        SnapshotPoller::new(snapshots, Arc::clone(&store), cache.clone())
    });

    let deps = ManagerDeps {
        connector: connector.clone(),
        market: market.map(|m| m as Arc<dyn MarketStatusPort>),
        poller,
        store,
        cache,
    };
    let config = ManagerConfig {
        url: Some(URL.to_string()),
        ..config
    };
    let cancel = CancellationToken::new();
    let (client, _handle) = ConnectionManager::spawn(config, deps, cancel.clone());

    Harness {
        client,
        connector,
        cancel,
    }
}

async fn wait_for(client: &StreamClient, predicate: impl Fn(&StreamStatus) -> bool) -> StreamStatus {
    let mut status = client.status();
    let seen = timeout(Duration::from_secs(300), status.wait_for(|s| predicate(s)))
        .await
        .expect("status never reached")
        .expect("manager stopped");
    *seen
}

fn equity(symbol: &str) -> InstrumentKey {
    InstrumentKey::simple(symbol, "NSE", "cash")
}

fn call(expiry: NaiveDate, strike: rust_decimal::Decimal) -> InstrumentKey {
    InstrumentKey::derivative("NIFTY", expiry, OptionSide::Call, strike)
}

fn tick(symbol: &str, ltp: &str) -> String {
    json!({"type": "tick", "symbol": symbol, "ltp": ltp}).to_string()
}

fn alias_tick(key: &InstrumentKey, ltp: &str, generation: u64) -> String {
    json!({
        "type": "tick",
        "alias": key.alias().unwrap(),
        "ltp": ltp,
        "subscriptionId": generation,
    })
    .to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn closed_market_polls_once_and_rechecks_later() {
    let market = FixedMarket::new(false);
    let snapshots = CountingSnapshots::new(Duration::ZERO);
    let h = start(Some(Arc::clone(&market)), Some(Arc::clone(&snapshots)));

    h.client.set_desired([equity("TCS")]).await.unwrap();
    h.client.connect().await.unwrap();

    let status = wait_for(&h.client, |s| s.market_open == Some(false)).await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert!(status.polling);

    sleep(Duration::from_secs(30)).await;
    assert!(h.connector.attempts().is_empty());
    assert_eq!(market.calls.load(Ordering::SeqCst), 1);
    assert_eq!(snapshots.calls(), 1);
    assert_eq!(h.client.quote(&equity("TCS")).status, QuoteStatus::LastKnown);

    sleep(Duration::from_secs(31)).await;
    assert_eq!(market.calls.load(Ordering::SeqCst), 2);
    assert_eq!(snapshots.calls(), 2);
    assert!(h.connector.attempts().is_empty());

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn failed_handshakes_back_off_exponentially() {
    let h = start(None, None);
    h.client.set_desired([equity("TCS")]).await.unwrap();
    h.client.connect().await.unwrap();

    sleep(Duration::from_millis(7_500)).await;

    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected) in gaps.iter().zip([1, 2, 4]) {
        let expected = Duration::from_secs(expected);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(10),
            "gap {gap:?}, expected {expected:?}"
        );
    }
    assert_eq!(h.client.current_status().reconnect_attempt, 4);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent_and_silences_timers() {
    let snapshots = CountingSnapshots::new(Duration::ZERO);
    let h = start(None, Some(Arc::clone(&snapshots)));
    h.connector.refuse();

    h.client.set_desired([equity("TCS")]).await.unwrap();
    h.client.connect().await.unwrap();
    wait_for(&h.client, |s| s.reconnect_attempt == 1).await;

    h.client.disconnect().await.unwrap();
    h.client.disconnect().await.unwrap();

    let attempts = h.connector.attempts().len();
    let polls = snapshots.calls();

    sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts().len(), attempts);
    assert_eq!(snapshots.calls(), polls);

    let status = h.client.current_status();
    assert_eq!(status.state, ConnectionState::Closed);
    assert!(!status.polling);
    assert_eq!(status.reconnect_attempt, 0);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn fallback_never_runs_while_open() {
    let snapshots = CountingSnapshots::new(Duration::from_secs(5));
    let h = start(None, Some(Arc::clone(&snapshots)));
    let first = h.connector.accept();
    let _second = h.connector.accept();

    h.client.set_desired([equity("TCS")]).await.unwrap();
    h.client.connect().await.unwrap();
    wait_for(&h.client, |s| s.state == ConnectionState::Open).await;

    h.client.trigger_fallback().await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(snapshots.calls(), 0);
    assert!(!h.client.current_status().polling);

    // Peer goes away: poll starts, reconnect at 1s reopens before it lands.
    drop(first);
    let status = wait_for(&h.client, |s| s.polling).await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert_eq!(snapshots.calls(), 1);

    let status = wait_for(&h.client, |s| s.state == ConnectionState::Open).await;
    assert!(!status.polling);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.client.quote(&equity("TCS")).status, QuoteStatus::NoData);

    // Both sessions subscribed the desired set.
    let subscribes = h
        .connector
        .sent_actions()
        .iter()
        .filter(|a| *a == "subscribe_many")
        .count();
    assert_eq!(subscribes, 2);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn adding_a_strike_keeps_existing_ladder_live() {
    let june = NaiveDate::from_ymd_opt(2024, 6, 27).unwrap();
    let h = start(None, None);
    let frames = h.connector.accept();

    h.client.set_desired([call(june, dec!(22000))]).await.unwrap();
    h.client.connect().await.unwrap();
    wait_for(&h.client, |s| s.state == ConnectionState::Open).await;

    h.client
        .set_desired([call(june, dec!(22000)), call(june, dec!(22100))])
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.client.current_status().generation, 1);

    frames
        .send(alias_tick(&call(june, dec!(22000)), "101.5", 1))
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.client.quote(&call(june, dec!(22000))).ltp, Some(dec!(101.5)));

    let sent = h.connector.sent();
    assert_eq!(sent[1]["action"], "subscribe_options");
    assert_eq!(sent[1]["strikes"], json!([22100]));
    assert_eq!(sent[1]["subscriptionId"], 1);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn ticks_from_superseded_generation_are_dropped() {
    let june = NaiveDate::from_ymd_opt(2024, 6, 27).unwrap();
    let july = NaiveDate::from_ymd_opt(2024, 7, 25).unwrap();
    let bank = InstrumentKey::derivative("BANKNIFTY", july, OptionSide::Put, dec!(48000));

    let h = start(None, None);
    let frames = h.connector.accept();

    h.client
        .set_desired([call(june, dec!(22000)), bank.clone()])
        .await
        .unwrap();
    h.client.connect().await.unwrap();
    wait_for(&h.client, |s| s.state == ConnectionState::Open).await;

    frames.send(alias_tick(&bank, "100", 1)).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.client.quote(&bank).ltp, Some(dec!(100)));

    h.client
        .set_desired([call(july, dec!(22000)), bank.clone()])
        .await
        .unwrap();
    wait_for(&h.client, |s| s.generation == 2).await;

    frames.send(alias_tick(&bank, "200", 1)).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.client.quote(&bank).ltp, Some(dec!(100)));

    frames.send(alias_tick(&bank, "300", 2)).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.client.quote(&bank).ltp, Some(dec!(300)));
    assert_eq!(h.client.quote(&bank).status, QuoteStatus::Live);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn burst_of_ticks_commits_once_per_window() {
    let h = start(None, None);
    let frames = h.connector.accept();

    h.client.set_desired([equity("TCS")]).await.unwrap();
    h.client.connect().await.unwrap();
    wait_for(&h.client, |s| s.state == ConnectionState::Open).await;

    let mut feed = h.client.subscribe();
    for ltp in ["101", "102", "103", "104", "105"] {
        frames.send(tick("TCS", ltp)).unwrap();
    }
    sleep(Duration::from_millis(200)).await;

    let batch = feed.try_recv().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].quote.ltp, Some(dec!(105)));
    assert!(feed.try_recv().is_err());

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn context_switch_waits_for_grace_delay() {
    let june = NaiveDate::from_ymd_opt(2024, 6, 27).unwrap();
    let july = NaiveDate::from_ymd_opt(2024, 7, 25).unwrap();

    let h = start(None, None);
    let _frames = h.connector.accept();

    h.client
        .set_desired([call(june, dec!(22000)), call(june, dec!(22100))])
        .await
        .unwrap();
    h.client.connect().await.unwrap();
    wait_for(&h.client, |s| s.state == ConnectionState::Open).await;
    assert_eq!(h.connector.sent_actions(), vec!["subscribe_options"]);

    h.client
        .set_desired([call(july, dec!(22000)), call(july, dec!(22100))])
        .await
        .unwrap();
    wait_for(&h.client, |s| s.generation == 2).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.connector.sent_actions(),
        vec!["subscribe_options", "unsubscribe_options"]
    );
    assert_eq!(h.connector.sent()[1]["expiryDate"], "2024-06-27");
    assert_eq!(h.connector.sent()[1]["subscriptionId"], 1);

    sleep(Duration::from_millis(200)).await;
    let sent = h.connector.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2]["action"], "subscribe_options");
    assert_eq!(sent[2]["expiryDate"], "2024-07-25");
    assert_eq!(sent[2]["subscriptionId"], 2);
    assert_eq!(sent[2]["strikes"], json!([22000, 22100]));

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn disconnect_releases_subscriptions_and_demotes_quotes() {
    let h = start(None, None);
    let frames = h.connector.accept();

    h.client.set_desired([equity("TCS")]).await.unwrap();
    h.client.connect().await.unwrap();
    wait_for(&h.client, |s| s.state == ConnectionState::Open).await;

    frames.send(tick("TCS", "100")).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.client.quote(&equity("TCS")).status, QuoteStatus::Live);

    h.client.disconnect().await.unwrap();

    assert_eq!(
        h.connector.sent_actions(),
        vec!["subscribe_many", "unsubscribe_many"]
    );
    assert_eq!(h.client.quote(&equity("TCS")).status, QuoteStatus::LastKnown);
    assert_eq!(h.client.current_status().state, ConnectionState::Closed);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn second_context_switch_during_grace_subscribes_only_latest_set() {
    let june = NaiveDate::from_ymd_opt(2024, 6, 27).unwrap();
    let july = NaiveDate::from_ymd_opt(2024, 7, 25).unwrap();
    let august = NaiveDate::from_ymd_opt(2024, 8, 29).unwrap();

    let h = start(None, None);
    let _frames = h.connector.accept();

    h.client.set_desired([call(june, dec!(22000))]).await.unwrap();
    h.client.connect().await.unwrap();
    wait_for(&h.client, |s| s.state == ConnectionState::Open).await;

    h.client.set_desired([call(july, dec!(22000))]).await.unwrap();
    wait_for(&h.client, |s| s.generation == 2).await;
    sleep(Duration::from_millis(100)).await;

    // Still inside the first grace window.
    h.client.set_desired([call(august, dec!(22000))]).await.unwrap();
    wait_for(&h.client, |s| s.generation == 3).await;
    sleep(Duration::from_millis(200)).await;

    // The restarted window has not elapsed. July is released, never subscribed.
    let sent = h.connector.sent();
    assert_eq!(
        h.connector.sent_actions(),
        vec!["subscribe_options", "unsubscribe_options", "unsubscribe_options"]
    );
    assert_eq!(sent[2]["expiryDate"], "2024-07-25");
    assert_eq!(sent[2]["subscriptionId"], 2);

    sleep(Duration::from_millis(100)).await;
    let sent = h.connector.sent();
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[3]["action"], "subscribe_options");
    assert_eq!(sent[3]["expiryDate"], "2024-08-29");
    assert_eq!(sent[3]["subscriptionId"], 3);
    assert!(
        !sent
            .iter()
            .any(|m| m["action"] == "subscribe_options" && m["expiryDate"] == "2024-07-25")
    );

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_fall_back_to_periodic_polls_until_connect() {
    let snapshots = CountingSnapshots::new(Duration::ZERO);
    let config = ManagerConfig {
        reconnect: ReconnectConfig {
            max_attempts: 2,
            ..ReconnectConfig::default()
        },
        heartbeat: HeartbeatConfig::new(Duration::ZERO, Duration::ZERO),
        ..ManagerConfig::default()
    };
    let h = start_with(config, None, Some(Arc::clone(&snapshots)));

    h.client.set_desired([equity("TCS")]).await.unwrap();
    h.client.connect().await.unwrap();

    // Initial attempt plus two automatic retries at 1s and 3s, one poll each.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.connector.attempts().len(), 3);
    assert_eq!(snapshots.calls(), 3);
    assert_eq!(h.client.current_status().reconnect_attempt, 2);

    // No more handshakes; one snapshot poll per recheck interval instead.
    sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.attempts().len(), 3);
    assert_eq!(snapshots.calls(), 4);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.attempts().len(), 3);
    assert_eq!(snapshots.calls(), 5);
    assert_eq!(h.client.quote(&equity("TCS")).status, QuoteStatus::LastKnown);

    // An explicit connect starts a fresh backoff sequence.
    let _frames = h.connector.accept();
    h.client.connect().await.unwrap();
    let status = wait_for(&h.client, |s| s.state == ConnectionState::Open).await;
    assert_eq!(status.reconnect_attempt, 0);
    assert_eq!(h.connector.attempts().len(), 4);

    sleep(Duration::from_secs(120)).await;
    assert_eq!(snapshots.calls(), 5);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn silent_connection_is_dropped_and_reopened() {
    let config = ManagerConfig {
        heartbeat: HeartbeatConfig::new(Duration::from_secs(5), Duration::from_secs(3)),
        ..ManagerConfig::default()
    };
    let h = start_with(config, None, None);
    let frames = h.connector.accept();
    let _second = h.connector.accept();

    h.client.set_desired([equity("TCS")]).await.unwrap();
    h.client.connect().await.unwrap();
    wait_for(&h.client, |s| s.state == ConnectionState::Open).await;
    let opened = Instant::now();

    // Traffic keeps the first session alive past the silence limit.
    for ltp in ["100", "101", "102"] {
        sleep(Duration::from_secs(4)).await;
        frames.send(tick("TCS", ltp)).unwrap();
    }
    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.connector.attempts().len(), 1);
    assert!(h.connector.pings() >= 2);

    // Then it goes quiet without closing.
    let status = wait_for(&h.client, |s| s.state == ConnectionState::Closed).await;
    assert_eq!(status.reconnect_attempt, 1);
    assert!(Instant::now() - opened >= Duration::from_secs(20));
    assert_eq!(h.client.quote(&equity("TCS")).status, QuoteStatus::LastKnown);

    wait_for(&h.client, |s| s.state == ConnectionState::Open).await;
    assert_eq!(h.connector.attempts().len(), 2);

    h.cancel.cancel();
}
