//! In-memory quote cache.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::application::ports::{CacheError, CachedQuote, QuoteCache};

/// Process-local cache. Nothing is persisted.
#[derive(Debug, Default)]
pub struct InMemoryQuoteCache {
    entries: RwLock<HashMap<String, CachedQuote>>,
}

impl InMemoryQuoteCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuoteCache for InMemoryQuoteCache {
    fn load_all(&self) -> Result<HashMap<String, CachedQuote>, CacheError> {
        Ok(self.entries.read().clone())
    }

    fn put_many(&self, entries: Vec<(String, CachedQuote)>) -> Result<(), CacheError> {
        self.entries.write().extend(entries);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }
}
