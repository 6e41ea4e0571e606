//! Heartbeat
//!
//! Keeps an open stream honest. A ping goes out every `ping_interval`; any
//! inbound frame, pongs included, pushes the silence deadline back. If
//! nothing arrives for `ping_interval + pong_timeout` the connection is
//! treated as lost.

use std::time::Duration;

use tokio::time::Instant;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ping messages. Zero disables the heartbeat.
    pub ping_interval: Duration,
    /// How long past a ping the peer may stay silent.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Whether pings are sent at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }

    /// Longest tolerated gap between inbound frames.
    #[must_use]
    pub fn silence_limit(&self) -> Duration {
        self.ping_interval + self.pong_timeout
    }
}

/// Ping and silence deadlines for one connection.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    ping_at: Option<Instant>,
    silent_at: Option<Instant>,
}

impl Heartbeat {
    /// Idle heartbeat; nothing is scheduled until [`start`](Self::start).
    #[must_use]
    pub const fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            ping_at: None,
            silent_at: None,
        }
    }

    /// Arm both deadlines for a freshly opened connection.
    pub fn start(&mut self, now: Instant) {
        if !self.config.is_enabled() {
            return;
        }
        self.ping_at = Some(now + self.config.ping_interval);
        self.silent_at = Some(now + self.config.silence_limit());
    }

    /// Clear both deadlines.
    pub const fn stop(&mut self) {
        self.ping_at = None;
        self.silent_at = None;
    }

    /// A frame arrived.
    pub fn record_activity(&mut self, now: Instant) {
        if self.silent_at.is_some() {
            self.silent_at = Some(now + self.config.silence_limit());
        }
    }

    /// A ping went out; schedule the next one.
    pub fn record_ping(&mut self, now: Instant) {
        if self.ping_at.is_some() {
            self.ping_at = Some(now + self.config.ping_interval);
        }
    }

    /// When the next ping is due.
    #[must_use]
    pub const fn ping_deadline(&self) -> Option<Instant> {
        self.ping_at
    }

    /// When the connection is declared dead without further frames.
    #[must_use]
    pub const fn silence_deadline(&self) -> Option<Instant> {
        self.silent_at
    }

    /// Configured limits.
    #[must_use]
    pub const fn config(&self) -> &HeartbeatConfig {
        &self.config
    }
}
