//! Quote Model
//!
//! The canonical quote record, the normalized tick that updates it, and the
//! ephemeral flash direction attached to each committed change.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::instrument::InstrumentKey;

/// Freshness of a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteStatus {
    /// Updated by a stream tick during the current session.
    Live,
    /// Restored from cache or snapshot, or demoted after the stream dropped.
    LastKnown,
    /// Nothing has ever been observed for this key.
    #[default]
    NoData,
}

impl QuoteStatus {
    /// Label used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "LIVE",
            Self::LastKnown => "LAST_KNOWN",
            Self::NoData => "NO_DATA",
        }
    }
}

/// Last-known quote for an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Instrument this quote belongs to.
    pub key: InstrumentKey,
    /// Last traded price.
    pub ltp: Option<Decimal>,
    /// Previous session close.
    pub close: Option<Decimal>,
    /// Percent change versus close.
    pub change_pct: Option<Decimal>,
    /// Traded volume.
    pub volume: Option<u64>,
    /// Open interest (derivatives only).
    pub open_interest: Option<u64>,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Time of the observation that produced this quote.
    pub timestamp: Option<DateTime<Utc>>,
    /// Freshness.
    pub status: QuoteStatus,
}

impl Quote {
    /// Empty quote for a key that has never been observed.
    #[must_use]
    pub const fn no_data(key: InstrumentKey) -> Self {
        Self {
            key,
            ltp: None,
            close: None,
            change_pct: None,
            volume: None,
            open_interest: None,
            bid: None,
            ask: None,
            timestamp: None,
            status: QuoteStatus::NoData,
        }
    }

    /// Whether any numeric field is populated.
    #[must_use]
    pub const fn has_data(&self) -> bool {
        self.ltp.is_some()
            || self.close.is_some()
            || self.change_pct.is_some()
            || self.volume.is_some()
            || self.open_interest.is_some()
            || self.bid.is_some()
            || self.ask.is_some()
    }

    /// Overlay a restored or polled quote onto this one.
    ///
    /// Present fields win, absent ones keep their values. The status is
    /// always taken from `other`.
    pub fn merge(&mut self, other: Self) {
        overlay(&mut self.ltp, other.ltp);
        overlay(&mut self.close, other.close);
        overlay(&mut self.change_pct, other.change_pct);
        overlay(&mut self.volume, other.volume);
        overlay(&mut self.open_interest, other.open_interest);
        overlay(&mut self.bid, other.bid);
        overlay(&mut self.ask, other.ask);
        overlay(&mut self.timestamp, other.timestamp);
        self.status = other.status;
    }

    /// Overlay a tick onto this quote and mark it live.
    ///
    /// Fields the tick does not carry keep their previous values. A tick
    /// without any market field changes nothing.
    pub fn apply_tick(&mut self, tick: &TickUpdate) {
        if !tick.carries_values() {
            return;
        }
        overlay(&mut self.ltp, tick.ltp);
        overlay(&mut self.close, tick.close);
        overlay(&mut self.change_pct, tick.change_pct);
        overlay(&mut self.volume, tick.volume);
        overlay(&mut self.open_interest, tick.open_interest);
        overlay(&mut self.bid, tick.bid);
        overlay(&mut self.ask, tick.ask);
        self.timestamp = Some(tick.timestamp);
        self.status = QuoteStatus::Live;
    }
}

/// Normalized stream tick for a single instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickUpdate {
    /// Resolved instrument.
    pub key: InstrumentKey,
    /// Last traded price.
    pub ltp: Option<Decimal>,
    /// Previous close, when the tick carries it.
    pub close: Option<Decimal>,
    /// Traded volume.
    pub volume: Option<u64>,
    /// Open interest.
    pub open_interest: Option<u64>,
    /// Percent change versus close.
    pub change_pct: Option<Decimal>,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Exchange or receive time.
    pub timestamp: DateTime<Utc>,
}

impl TickUpdate {
    /// Tick with only a key and timestamp.
    #[must_use]
    pub const fn empty(key: InstrumentKey, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            ltp: None,
            close: None,
            volume: None,
            open_interest: None,
            change_pct: None,
            bid: None,
            ask: None,
            timestamp,
        }
    }

    /// Whether any market field is set.
    #[must_use]
    pub const fn carries_values(&self) -> bool {
        self.ltp.is_some()
            || self.close.is_some()
            || self.volume.is_some()
            || self.open_interest.is_some()
            || self.change_pct.is_some()
            || self.bid.is_some()
            || self.ask.is_some()
    }

    /// Fold a newer tick for the same key into this one.
    ///
    /// Fields present on `newer` win; absent ones keep the older value.
    pub fn absorb(&mut self, newer: Self) {
        overlay(&mut self.ltp, newer.ltp);
        overlay(&mut self.close, newer.close);
        overlay(&mut self.volume, newer.volume);
        overlay(&mut self.open_interest, newer.open_interest);
        overlay(&mut self.change_pct, newer.change_pct);
        overlay(&mut self.bid, newer.bid);
        overlay(&mut self.ask, newer.ask);
        self.timestamp = newer.timestamp;
    }
}

fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Direction of the last price move, consumed by the display layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Flash {
    /// Price strictly increased.
    Up,
    /// Price strictly decreased.
    Down,
    /// Equal, or no previous price to compare against.
    None,
}

impl Flash {
    /// Compare a new price to the previous one.
    #[must_use]
    pub fn between(previous: Option<Decimal>, next: Option<Decimal>) -> Self {
        match (previous, next) {
            (Some(prev), Some(next)) if next > prev => Self::Up,
            (Some(prev), Some(next)) if next < prev => Self::Down,
            _ => Self::None,
        }
    }
}

/// One committed quote together with its flash direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuoteChange {
    /// Quote as stored after the commit.
    pub quote: Quote,
    /// Direction versus the previous stored price.
    pub flash: Flash,
}
