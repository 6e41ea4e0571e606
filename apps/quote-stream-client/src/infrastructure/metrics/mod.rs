//! Prometheus Metrics Module
//!
//! Exposes client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Text frames received from the stream, by message type
//! - **Ticks**: Normalized ticks, and ticks dropped by reason
//! - **Batches**: Commits to the quote store
//! - **Connection**: State gauge and reconnect attempts
//! - **Fallback**: Snapshot polls and their outcomes
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::normalizer::Rejection;
use crate::domain::streaming::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Errors
///
/// Returns `BuildError` if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "quote_stream_frames_received_total",
        "Total messages decoded from the stream, by type"
    );
    describe_counter!(
        "quote_stream_frames_malformed_total",
        "Total frames that could not be decoded"
    );
    describe_counter!(
        "quote_stream_ticks_normalized_total",
        "Total ticks accepted by the normalizer"
    );
    describe_counter!(
        "quote_stream_ticks_dropped_total",
        "Total ticks dropped by the normalizer, by reason"
    );
    describe_counter!(
        "quote_stream_batches_flushed_total",
        "Total batches committed to the quote store"
    );
    describe_counter!(
        "quote_stream_quotes_committed_total",
        "Total quotes committed by batches"
    );
    describe_gauge!(
        "quote_stream_connection_state",
        "Connection state (0=closed, 1=connecting, 2=open, 3=closing)"
    );
    describe_gauge!(
        "quote_stream_subscriptions",
        "Instruments in the desired subscription set"
    );
    describe_counter!(
        "quote_stream_reconnects_total",
        "Total scheduled reconnection attempts"
    );
    describe_counter!(
        "quote_stream_fallback_polls_total",
        "Total snapshot fallback polls, by outcome"
    );
    describe_counter!(
        "quote_stream_cache_write_errors_total",
        "Total failed background cache rewrites"
    );
    describe_counter!(
        "quote_stream_heartbeat_timeouts_total",
        "Total connections dropped for going silent"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a decoded inbound message.
pub fn record_frame_received(kind: &'static str) {
    counter!("quote_stream_frames_received_total", "type" => kind).increment(1);
}

/// Record a frame that failed to decode.
pub fn record_frame_malformed() {
    counter!("quote_stream_frames_malformed_total").increment(1);
}

/// Record a tick accepted by the normalizer.
pub fn record_tick_normalized() {
    counter!("quote_stream_ticks_normalized_total").increment(1);
}

/// Record a tick dropped by the normalizer.
pub fn record_tick_dropped(reason: Rejection) {
    counter!("quote_stream_ticks_dropped_total", "reason" => reason.as_str()).increment(1);
}

/// Record a batch commit of `quotes` quotes.
pub fn record_batch_flushed(quotes: usize) {
    counter!("quote_stream_batches_flushed_total").increment(1);
    counter!("quote_stream_quotes_committed_total").increment(u64::try_from(quotes).unwrap_or(u64::MAX));
}

/// Update the connection-state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("quote_stream_connection_state").set(state.as_gauge());
}

/// Update the desired-set size gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("quote_stream_subscriptions").set(count as f64);
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect() {
    counter!("quote_stream_reconnects_total").increment(1);
}

/// Outcome label for fallback polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every fetch succeeded.
    Ok,
    /// Some fetches failed.
    Partial,
    /// Every fetch failed.
    Failed,
}

impl PollOutcome {
    /// Classify a poll from its success and failure counts.
    #[must_use]
    pub const fn classify(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => Self::Ok,
            (0, _) => Self::Failed,
            _ => Self::Partial,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Record a completed fallback poll.
pub fn record_fallback_poll(outcome: PollOutcome) {
    counter!("quote_stream_fallback_polls_total", "outcome" => outcome.as_str()).increment(1);
}

/// Record a failed cache rewrite.
pub fn record_cache_write_error() {
    counter!("quote_stream_cache_write_errors_total").increment(1);
}

/// Record a connection dropped by the heartbeat deadline.
pub fn record_heartbeat_timeout() {
    counter!("quote_stream_heartbeat_timeouts_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
