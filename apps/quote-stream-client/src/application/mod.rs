//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (stream, collaborators, cache).
pub mod ports;

/// Application services for quote storage, batching and fallback polling.
pub mod services;
