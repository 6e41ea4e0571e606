//! Snapshot Fallback
//!
//! One polling pass over the desired set through the snapshot
//! collaborator. Fetching and applying are split so the event loop can
//! drop results that arrive after the stream has reopened.

use std::sync::Arc;

use futures::future::join_all;

use super::quote_store::QuoteStore;
use crate::application::ports::{
    CachedQuote, CollaboratorError, QuoteCache, SnapshotPort, SnapshotQuote,
};
use crate::domain::instrument::InstrumentKey;
use crate::domain::quote::{Quote, QuoteStatus};

/// Results of one fetch pass, in request order.
pub type SnapshotResults = Vec<(InstrumentKey, Result<SnapshotQuote, CollaboratorError>)>;

/// Counts from applying one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Quotes written to the store.
    pub applied: usize,
    /// Keys cleared by a session reset.
    pub reset: usize,
    /// Fetches that failed.
    pub failed: usize,
}

/// Polls snapshots while the stream is unavailable.
#[derive(Clone)]
pub struct SnapshotPoller {
    snapshots: Arc<dyn SnapshotPort>,
    store: Arc<QuoteStore>,
    cache: Arc<dyn QuoteCache>,
}

impl std::fmt::Debug for SnapshotPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPoller").finish_non_exhaustive()
    }
}

impl SnapshotPoller {
    /// Create a poller writing into `store` and `cache`.
    #[must_use]
    pub fn new(
        snapshots: Arc<dyn SnapshotPort>,
        store: Arc<QuoteStore>,
        cache: Arc<dyn QuoteCache>,
    ) -> Self {
        Self {
            snapshots,
            store,
            cache,
        }
    }

    /// Fetch every key concurrently. Nothing is written.
    pub async fn fetch(&self, keys: Vec<InstrumentKey>) -> SnapshotResults {
        let requests = keys.iter().map(|key| self.snapshots.fetch(key));
        let responses = join_all(requests).await;
        keys.into_iter().zip(responses).collect()
    }

    /// Write fetched snapshots into the store and cache.
    ///
    /// A `reset` snapshot clears the key from both. Everything else is
    /// stored in one batch; only `LIVE` snapshots reach the cache.
    pub fn apply(&self, results: SnapshotResults) -> PollReport {
        let mut report = PollReport::default();
        let mut quotes: Vec<Quote> = Vec::with_capacity(results.len());

        for (key, result) in results {
            match result {
                Ok(snapshot) if snapshot.reset => {
                    self.store.remove(&key);
                    if let Err(e) = self.cache.remove(&key.canonical()) {
                        tracing::warn!(key = %key, error = %e, "Failed to clear cached quote");
                    }
                    report.reset += 1;
                }
                Ok(snapshot) => quotes.push(snapshot.into_quote(key)),
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Snapshot fetch failed");
                    report.failed += 1;
                }
            }
        }

        let live: Vec<(String, CachedQuote)> = quotes
            .iter()
            .filter(|q| q.status == QuoteStatus::Live && q.has_data())
            .map(|q| (q.key.canonical(), CachedQuote::from(q)))
            .collect();

        report.applied = self.store.upsert(quotes);

        if !live.is_empty()
            && let Err(e) = self.cache.put_many(live)
        {
            tracing::warn!(error = %e, "Failed to mirror snapshots into cache");
        }

        report
    }
}
