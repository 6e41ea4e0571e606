//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `QuoteStore`: Shared quote table with a batched change feed
//! - `UpdateBatcher`: Last-write-wins buffer flushed on a window
//! - `SnapshotPoller`: Snapshot fallback while the stream is down

mod batcher;
mod fallback;
mod quote_store;

pub use batcher::{DEFAULT_BATCH_WINDOW, UpdateBatcher};
pub use fallback::{PollReport, SnapshotPoller, SnapshotResults};
pub use quote_store::{DEFAULT_FEED_CAPACITY, QuoteBatch, QuoteStore};
