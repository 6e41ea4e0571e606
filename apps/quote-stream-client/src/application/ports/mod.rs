//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `MarketStatusPort`: Is the exchange open right now
//! - `SnapshotPort`: One-shot quote for a single instrument
//! - `QuoteCache`: Durable last-known quotes keyed by canonical key
//! - `StreamConnector`: Opens streaming connections

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::instrument::InstrumentKey;
use crate::domain::quote::{Quote, QuoteStatus};

// =============================================================================
// Errors
// =============================================================================

/// Failure talking to a request/response collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// Request could not be sent or timed out.
    #[error("request failed: {0}")]
    Request(String),

    /// Collaborator answered with a non-success status.
    #[error("unexpected status {0}")]
    Status(u16),

    /// Response body did not match the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Failure reading or writing the persistence cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Filesystem error.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The background writer is no longer running.
    #[error("cache writer stopped")]
    WriterStopped,
}

/// Failure on the streaming transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Handshake failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Frame could not be written.
    #[error("send failed: {0}")]
    Send(String),

    /// Read side reported an error.
    #[error("receive failed: {0}")]
    Receive(String),

    /// Peer closed the connection.
    #[error("connection closed")]
    Closed,
}

// =============================================================================
// Collaborators
// =============================================================================

/// Market-status collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketStatusPort: Send + Sync {
    /// Whether the market is currently open.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError` if the status could not be determined.
    async fn is_open(&self) -> Result<bool, CollaboratorError>;
}

/// One-shot snapshot for an instrument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotQuote {
    /// Last traded price.
    #[serde(default)]
    pub ltp: Option<Decimal>,
    /// Previous close.
    #[serde(default)]
    pub close: Option<Decimal>,
    /// Percent change versus close.
    #[serde(default, alias = "change_pct")]
    pub change_pct: Option<Decimal>,
    /// Best bid.
    #[serde(default)]
    pub bid: Option<Decimal>,
    /// Best ask.
    #[serde(default)]
    pub ask: Option<Decimal>,
    /// Traded volume.
    #[serde(default)]
    pub volume: Option<u64>,
    /// Observation time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Freshness label from the endpoint (`live`, `closed`, ...).
    #[serde(default)]
    pub status: Option<String>,
    /// Session rollover: drop every stored value for this key.
    #[serde(default)]
    pub reset: bool,
}

impl SnapshotQuote {
    /// Whether the endpoint explicitly marked this snapshot as live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("live"))
    }

    /// Map onto a quote record for `key`.
    ///
    /// Snapshots are `LAST_KNOWN` unless the endpoint says otherwise.
    #[must_use]
    pub fn into_quote(self, key: InstrumentKey) -> Quote {
        let status = if self.is_live() {
            QuoteStatus::Live
        } else {
            QuoteStatus::LastKnown
        };
        Quote {
            key,
            ltp: self.ltp,
            close: self.close,
            change_pct: self.change_pct,
            volume: self.volume,
            open_interest: None,
            bid: self.bid,
            ask: self.ask,
            timestamp: self.timestamp,
            status,
        }
    }
}

/// Snapshot-quote collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotPort: Send + Sync {
    /// Fetch the current snapshot for `key`.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError` if the snapshot could not be fetched.
    async fn fetch(&self, key: &InstrumentKey) -> Result<SnapshotQuote, CollaboratorError>;
}

// =============================================================================
// Persistence Cache
// =============================================================================

/// Durable record for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedQuote {
    /// Last traded price.
    pub ltp: Option<Decimal>,
    /// Previous close.
    pub close: Option<Decimal>,
    /// Percent change versus close.
    pub change_pct: Option<Decimal>,
    /// Best bid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    /// Best ask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    /// Observation time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Status at the time of writing.
    pub status: QuoteStatus,
}

impl CachedQuote {
    /// Restore as a `LAST_KNOWN` quote.
    #[must_use]
    pub fn into_quote(self, key: InstrumentKey) -> Quote {
        Quote {
            key,
            ltp: self.ltp,
            close: self.close,
            change_pct: self.change_pct,
            volume: None,
            open_interest: None,
            bid: self.bid,
            ask: self.ask,
            timestamp: self.timestamp,
            status: QuoteStatus::LastKnown,
        }
    }
}

impl From<&Quote> for CachedQuote {
    fn from(quote: &Quote) -> Self {
        Self {
            ltp: quote.ltp,
            close: quote.close,
            change_pct: quote.change_pct,
            bid: quote.bid,
            ask: quote.ask,
            timestamp: quote.timestamp,
            status: quote.status,
        }
    }
}

/// Key-value store of last observed quotes, keyed by canonical key string.
///
/// Called from the connection event loop, so implementations must not
/// block on I/O. Durable stores queue the write and return.
#[cfg_attr(test, mockall::automock)]
pub trait QuoteCache: Send + Sync {
    /// Every stored record.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the store cannot be read.
    fn load_all(&self) -> Result<HashMap<String, CachedQuote>, CacheError>;

    /// Insert or replace records in one write.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the write cannot be accepted.
    fn put_many(&self, entries: Vec<(String, CachedQuote)>) -> Result<(), CacheError>;

    /// Delete the record for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the store cannot be written.
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

// =============================================================================
// Streaming Transport
// =============================================================================

/// Opens streaming connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Perform the handshake with `url`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connect` if the handshake fails.
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>, TransportError>;
}

/// What arrived on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Application payload.
    Text(String),
    /// Answer to one of our pings.
    Pong,
}

/// An established text-frame connection.
#[async_trait]
pub trait StreamConnection: Send {
    /// Write one text frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the frame cannot be written.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Write a keepalive ping.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the ping cannot be written.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Next inbound frame. `None` once the peer has gone away.
    ///
    /// Must be cancel-safe: dropping the future loses no frame.
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>>;

    /// Close the connection. Errors are ignored.
    async fn close(&mut self);
}
