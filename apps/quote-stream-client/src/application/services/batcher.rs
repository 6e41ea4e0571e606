//! Update Batcher
//!
//! Buffers normalized ticks for a short window and commits them to the
//! quote store in one batch. Within a window the newest tick per key wins;
//! intermediate prices are dropped on purpose.
//!
//! The batcher does not own a timer. It exposes [`UpdateBatcher::deadline`],
//! armed by the first ingest into an empty buffer, and the owning event
//! loop calls [`UpdateBatcher::flush`] when that deadline passes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::quote_store::QuoteStore;
use crate::application::ports::{CachedQuote, QuoteCache};
use crate::domain::instrument::InstrumentKey;
use crate::domain::quote::{QuoteChange, QuoteStatus, TickUpdate};

/// Default batching window.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(120);

/// Per-window last-write-wins buffer.
pub struct UpdateBatcher {
    window: Duration,
    pending: HashMap<InstrumentKey, TickUpdate>,
    deadline: Option<Instant>,
    store: Arc<QuoteStore>,
    cache: Arc<dyn QuoteCache>,
}

impl std::fmt::Debug for UpdateBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBatcher")
            .field("window", &self.window)
            .field("pending", &self.pending.len())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl UpdateBatcher {
    /// Create a batcher committing into `store` and mirroring into `cache`.
    #[must_use]
    pub fn new(window: Duration, store: Arc<QuoteStore>, cache: Arc<dyn QuoteCache>) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            deadline: None,
            store,
            cache,
        }
    }

    /// Buffer a tick.
    ///
    /// Arms the flush deadline only when the buffer was empty.
    pub fn ingest(&mut self, update: TickUpdate) {
        if self.pending.is_empty() {
            self.deadline = Some(Instant::now() + self.window);
        }

        match self.pending.get_mut(&update.key) {
            Some(existing) => existing.absorb(update),
            None => {
                self.pending.insert(update.key.clone(), update);
            }
        }
    }

    /// When the pending batch is due, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Number of keys waiting to be committed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drain the buffer into the store in one batch.
    ///
    /// Committed `LIVE` quotes are mirrored into the cache with a single
    /// write. Cache failures are logged and do not affect the commit.
    pub fn flush(&mut self) -> Vec<QuoteChange> {
        self.deadline = None;
        if self.pending.is_empty() {
            return Vec::new();
        }

        let ticks: Vec<TickUpdate> = self.pending.drain().map(|(_, tick)| tick).collect();
        let changes = self.store.apply_ticks(ticks);

        let records: Vec<(String, CachedQuote)> = changes
            .iter()
            .filter(|change| change.quote.status == QuoteStatus::Live)
            .map(|change| (change.quote.key.canonical(), CachedQuote::from(&change.quote)))
            .collect();
        if let Err(e) = self.cache.put_many(records) {
            tracing::warn!(error = %e, "Failed to mirror quotes into cache");
        }

        tracing::trace!(count = changes.len(), "Flushed quote batch");
        changes
    }
}
