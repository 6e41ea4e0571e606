//! Quote Cache Adapters
//!
//! Implementations of [`QuoteCache`](crate::application::ports::QuoteCache):
//! an in-memory map for tests and embedding, and a JSON file that survives
//! restarts.

mod file;
mod memory;

pub use file::{CacheWriter, FileQuoteCache};
pub use memory::InMemoryQuoteCache;
