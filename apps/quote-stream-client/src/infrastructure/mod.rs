//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Market-status and snapshot HTTP clients.
pub mod collaborators;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Quote cache implementations.
pub mod persistence;

/// Streaming connection, codec and connection manager.
pub mod stream;

/// OpenTelemetry tracing integration.
pub mod telemetry;
