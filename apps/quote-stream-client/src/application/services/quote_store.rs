//! Quote Store
//!
//! Canonical in-memory table of last-known quotes. Every write takes the
//! lock once, applies a whole batch, and publishes a single notification,
//! so readers never observe half a batch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::domain::instrument::InstrumentKey;
use crate::domain::quote::{Flash, Quote, QuoteChange, QuoteStatus, TickUpdate};

/// One notification on the quote-update feed.
pub type QuoteBatch = Arc<[QuoteChange]>;

/// Default capacity of the update feed.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Shared quote table with a change feed.
#[derive(Debug)]
pub struct QuoteStore {
    quotes: RwLock<HashMap<InstrumentKey, Quote>>,
    updates: broadcast::Sender<QuoteBatch>,
}

impl Default for QuoteStore {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl QuoteStore {
    /// Create an empty store whose feed buffers `capacity` batches.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            quotes: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Subscribe to committed batches.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QuoteBatch> {
        self.updates.subscribe()
    }

    /// Stored quote for `key`.
    #[must_use]
    pub fn get(&self, key: &InstrumentKey) -> Option<Quote> {
        self.quotes.read().get(key).cloned()
    }

    /// Stored quote, or a `NO_DATA` placeholder.
    #[must_use]
    pub fn get_or_empty(&self, key: &InstrumentKey) -> Quote {
        self.get(key).unwrap_or_else(|| Quote::no_data(key.clone()))
    }

    /// Every stored quote.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Quote> {
        self.quotes.read().values().cloned().collect()
    }

    /// Number of stored quotes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.quotes.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quotes.read().is_empty()
    }

    /// Apply a batch of ticks atomically.
    ///
    /// Each tick is overlaid on the stored quote, the result is marked
    /// `LIVE`, and its flash is computed against the previously stored
    /// price. Returns the committed changes.
    pub fn apply_ticks(&self, ticks: Vec<TickUpdate>) -> Vec<QuoteChange> {
        if ticks.is_empty() {
            return Vec::new();
        }

        let changes: Vec<QuoteChange> = {
            let mut quotes = self.quotes.write();
            ticks
                .into_iter()
                .map(|tick| {
                    let entry = quotes
                        .entry(tick.key.clone())
                        .or_insert_with(|| Quote::no_data(tick.key.clone()));
                    let previous = entry.ltp;
                    entry.apply_tick(&tick);
                    QuoteChange {
                        quote: entry.clone(),
                        flash: Flash::between(previous, entry.ltp),
                    }
                })
                .collect()
        };

        self.publish(&changes);
        changes
    }

    /// Merge quotes restored from durable storage or a snapshot.
    ///
    /// Fields present on an incoming quote replace the stored ones; absent
    /// fields keep their stored values. Quotes without data are skipped.
    /// Returns the number stored.
    pub fn upsert(&self, quotes: impl IntoIterator<Item = Quote>) -> usize {
        let changes: Vec<QuoteChange> = {
            let mut table = self.quotes.write();
            quotes
                .into_iter()
                .filter(Quote::has_data)
                .map(|incoming| {
                    let stored = table
                        .entry(incoming.key.clone())
                        .or_insert_with(|| Quote::no_data(incoming.key.clone()));
                    let previous = stored.ltp;
                    stored.merge(incoming);
                    QuoteChange {
                        flash: Flash::between(previous, stored.ltp),
                        quote: stored.clone(),
                    }
                })
                .collect()
        };

        self.publish(&changes);
        changes.len()
    }

    /// Drop the stored quote for `key`.
    pub fn remove(&self, key: &InstrumentKey) -> Option<Quote> {
        let removed = self.quotes.write().remove(key);
        if removed.is_some() {
            self.publish(&[QuoteChange {
                quote: Quote::no_data(key.clone()),
                flash: Flash::None,
            }]);
        }
        removed
    }

    /// Demote every `LIVE` quote to `LAST_KNOWN`. Returns how many changed.
    pub fn demote_live(&self) -> usize {
        let changes: Vec<QuoteChange> = {
            let mut quotes = self.quotes.write();
            quotes
                .values_mut()
                .filter(|q| q.status == QuoteStatus::Live)
                .map(|quote| {
                    quote.status = QuoteStatus::LastKnown;
                    QuoteChange {
                        quote: quote.clone(),
                        flash: Flash::None,
                    }
                })
                .collect()
        };

        self.publish(&changes);
        changes.len()
    }

    fn publish(&self, changes: &[QuoteChange]) {
        if changes.is_empty() {
            return;
        }
        // No receivers is fine; the table is still authoritative.
        let _ = self.updates.send(Arc::from(changes));
    }
}
