//! Streaming Protocol Types
//!
//! Connection state, inbound frames and outbound subscription commands
//! exchanged with the market-data gateway.
//!
//! # Inbound
//!
//! Frames are JSON objects tagged by `type`:
//!
//! ```json
//! {"type":"tick","alias":"NIFTY|2024-06-27|CALL|22000","ltp":"101.5","subscriptionId":3}
//! {"type":"subscribed","message":"ok"}
//! {"type":"error","message":"unknown symbol"}
//! ```
//!
//! Tick payloads come from several upstream encodings with overlapping field
//! names, so `RawTick` keeps the raw field map and exposes prioritized
//! lookups instead of a fixed struct.
//!
//! # Outbound
//!
//! Commands are JSON objects tagged by `action` (`subscribe_many`,
//! `unsubscribe_many`, `subscribe_options`, `unsubscribe_options`).

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use super::instrument::OptionSide;

/// Price keys inside one depth level.
const DEPTH_PRICE_FIELDS: &[&str] = &["price", "rate", "bPrice", "sPrice"];

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Closed,
    /// Handshake in flight.
    Connecting,
    /// Socket established.
    Open,
    /// Teardown in progress.
    Closing,
}

impl ConnectionState {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }

    /// Numeric encoding for the connection-state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Connecting => 1.0,
            Self::Open => 2.0,
            Self::Closing => 3.0,
        }
    }
}

/// Connection-status signal published to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    /// Current connection state.
    pub state: ConnectionState,
    /// Whether the snapshot fallback poller is active.
    pub polling: bool,
    /// Current subscription generation.
    pub generation: u64,
    /// Consecutive reconnect attempts since the last successful open.
    pub reconnect_attempt: u32,
    /// Last market-status answer, if one was obtained.
    pub market_open: Option<bool>,
}

// =============================================================================
// Inbound Frames
// =============================================================================

/// Frame received from the stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Market data tick.
    Tick(Box<RawTick>),
    /// Subscription acknowledged.
    Subscribed(AckMessage),
    /// Unsubscription acknowledged.
    Unsubscribed(AckMessage),
    /// Informational notice.
    Info(AckMessage),
    /// Error reported by the gateway.
    Error(AckMessage),
    /// Any other frame type.
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Frame type label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Tick(_) => "tick",
            Self::Subscribed(_) => "subscribed",
            Self::Unsubscribed(_) => "unsubscribed",
            Self::Info(_) => "info",
            Self::Error(_) => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Acknowledgement, info or error frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AckMessage {
    /// Free-form message from the gateway.
    #[serde(default, alias = "msg", alias = "error")]
    pub message: Option<Value>,
}

impl AckMessage {
    /// Message rendered as text.
    #[must_use]
    pub fn text(&self) -> String {
        match &self.message {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// Tick payload as received, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RawTick {
    fields: Map<String, Value>,
}

impl RawTick {
    /// Wrap a field map.
    #[must_use]
    pub const fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Raw field value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// First non-empty string among `keys`.
    #[must_use]
    pub fn text(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.fields.get(*key))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    /// First numeric value among `keys`, accepting numeric strings.
    #[must_use]
    pub fn decimal(&self, keys: &[&str]) -> Option<Decimal> {
        keys.iter()
            .filter_map(|key| self.fields.get(*key))
            .find_map(decimal_from_value)
    }

    /// First non-negative integral value among `keys`.
    #[must_use]
    pub fn count(&self, keys: &[&str]) -> Option<u64> {
        keys.iter()
            .filter_map(|key| self.fields.get(*key))
            .filter_map(decimal_from_value)
            .find_map(|d| d.trunc().to_u64())
    }

    /// Price of the top level on one side of the book (`bids` or `asks`).
    ///
    /// Levels are objects carrying a price field or `[price, qty]` pairs,
    /// either at the top level or nested under `depth`.
    #[must_use]
    pub fn best_price(&self, side: &str) -> Option<Decimal> {
        let levels = self
            .fields
            .get(side)
            .or_else(|| self.fields.get("depth")?.get(side))?;
        match levels.as_array()?.first()? {
            Value::Object(level) => DEPTH_PRICE_FIELDS
                .iter()
                .filter_map(|key| level.get(*key))
                .find_map(decimal_from_value),
            Value::Array(pair) => pair.first().and_then(decimal_from_value),
            other => decimal_from_value(other),
        }
    }

    /// Subscription generation the tick was tagged with, if any.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.count(&["subscriptionId", "subscription_id", "generation"])
    }
}

/// Coerce a JSON number or numeric string into a decimal.
#[must_use]
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(&s.trim().replace(',', "")),
        _ => None,
    }
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

// =============================================================================
// Outbound Commands
// =============================================================================

/// Subscription command sent to the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Subscribe simple instruments.
    SubscribeMany {
        /// Instruments to add.
        symbols: Vec<SymbolSpec>,
    },
    /// Unsubscribe simple instruments.
    UnsubscribeMany {
        /// Instruments to remove.
        symbols: Vec<SymbolSpec>,
    },
    /// Subscribe a strike ladder for one underlying, expiry and side.
    SubscribeOptions(OptionsRequest),
    /// Unsubscribe a strike ladder.
    UnsubscribeOptions(OptionsRequest),
}

impl OutboundMessage {
    /// Whether this command removes subscriptions.
    #[must_use]
    pub const fn is_unsubscribe(&self) -> bool {
        matches!(
            self,
            Self::UnsubscribeMany { .. } | Self::UnsubscribeOptions(_)
        )
    }

    /// Action label for logs.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::SubscribeMany { .. } => "subscribe_many",
            Self::UnsubscribeMany { .. } => "unsubscribe_many",
            Self::SubscribeOptions(_) => "subscribe_options",
            Self::UnsubscribeOptions(_) => "unsubscribe_options",
        }
    }
}

/// Simple instrument reference in `subscribe_many` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSpec {
    /// Trading symbol.
    pub stock_code: String,
    /// Exchange code.
    pub exchange_code: String,
    /// Product type.
    pub product_type: String,
}

/// Strike ladder in `subscribe_options` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsRequest {
    /// Underlying symbol.
    pub underlying: String,
    /// Expiry as `YYYY-MM-DD`.
    pub expiry_date: String,
    /// Strikes, sent as JSON numbers.
    #[serde(serialize_with = "serialize_strikes")]
    pub strikes: Vec<Decimal>,
    /// Option side, sent as `call` or `put`.
    #[serde(serialize_with = "serialize_right")]
    pub right: OptionSide,
    /// Generation the request belongs to.
    pub subscription_id: u64,
}

fn serialize_strikes<S: Serializer>(strikes: &[Decimal], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(strikes.iter().map(strike_value))
}

fn serialize_right<S: Serializer>(side: &OptionSide, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(side.wire_right())
}

fn strike_value(strike: &Decimal) -> Value {
    if strike.fract().is_zero()
        && let Some(whole) = strike.to_i64()
    {
        return Value::from(whole);
    }
    strike.to_f64().map_or(Value::Null, Value::from)
}
