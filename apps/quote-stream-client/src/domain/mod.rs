//! Domain Layer - Core quote streaming types and business logic.
//!
//! This layer contains instrument identity, the quote model, the wire
//! protocol types, subscription reconciliation and tick normalization.
//! Nothing here performs I/O.

/// Instrument keys, option sides and expiry normalization.
pub mod instrument;

/// Pure tick normalization.
pub mod normalizer;

/// Quote records, ticks and flash direction.
pub mod quote;

/// Connection state and stream protocol frames.
pub mod streaming;

/// Desired-set tracking, generations and alias tables.
pub mod subscription;
