#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Quote Stream Client - Real-time Market Data
//!
//! Keeps one streaming connection to a market-data gateway, tracks which
//! instruments are wanted, normalizes ticks into a canonical quote table
//! and falls back to snapshot polling while the stream is unavailable.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and logic
//!   - `instrument`: Instrument keys and expiry normalization
//!   - `quote`: Quote records, ticks and flash direction
//!   - `streaming`: Connection state and wire messages
//!   - `subscription`: Desired set, generations and alias tables
//!   - `normalizer`: Raw tick to `TickUpdate`
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Stream transport, collaborators and cache interfaces
//!   - `services`: Quote store, update batcher, snapshot poller
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `stream`: WebSocket transport, codec and the connection manager
//!   - `collaborators`: Market-status and snapshot HTTP clients
//!   - `persistence`: In-memory and JSON file quote caches
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                      ┌─────────────┐   ┌─────────┐   ┌─────────────┐
//! Gateway WS ─────────►│ Normalizer  │──►│ Batcher │──►│ Quote Store │──► update feed
//!                      └─────────────┘   └─────────┘   └──────┬──────┘
//!                             ▲                               │
//!                        alias table                          ▼
//!                             │                         Quote Cache
//!                    ┌────────┴────────┐                      ▲
//! consumers ────────►│ Subscription    │                      │
//!                    │ Registry        │              Snapshot Poller ◄── snapshot API
//!                    └─────────────────┘              (stream down only)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core quote types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::instrument::{InstrumentError, InstrumentKey, OptionSide};
pub use domain::quote::{Flash, Quote, QuoteChange, QuoteStatus, TickUpdate};
pub use domain::streaming::{ConnectionState, StreamStatus};
pub use domain::subscription::{Generation, SubscriptionPlan, SubscriptionRegistry};

// Application services
pub use application::services::{QuoteBatch, QuoteStore, SnapshotPoller, UpdateBatcher};

// Streaming
pub use infrastructure::stream::{
    ConnectionManager, ManagerConfig, ManagerDeps, ManagerStopped, ReconnectConfig, StreamClient,
    TungsteniteConnector,
};

// Infrastructure config
pub use infrastructure::config::{ClientConfig, ConfigError};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
