//! Instrument Identity
//!
//! `InstrumentKey` identifies a streamable quote target. Simple keys cover
//! equities and indices; derivative keys cover individual option contracts.
//!
//! Derivative expiries arrive from upstream in several encodings and are
//! normalized to a calendar date at construction, so two keys built from
//! `"27-Jun-2024"` and `"2024-06-27T00:00:00Z"` compare equal.
//!
//! # Canonical Form
//!
//! ```text
//! Simple:     NSE:RELIANCE:cash
//! Derivative: NIFTY|2024-06-27|CALL|22000
//! ```
//!
//! The derivative form doubles as the wire-level alias used by the stream.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while building or parsing instrument keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstrumentError {
    /// Expiry string did not match any supported date format.
    #[error("unrecognized expiry date: {0}")]
    InvalidExpiry(String),

    /// Strike could not be parsed as a decimal number.
    #[error("invalid strike: {0}")]
    InvalidStrike(String),

    /// Canonical key string is malformed.
    #[error("invalid instrument key: {0}")]
    InvalidKey(String),
}

// =============================================================================
// Option Side
// =============================================================================

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionSide {
    /// Call option.
    Call,
    /// Put option.
    Put,
}

impl OptionSide {
    /// Map an upstream right code onto a side.
    ///
    /// `CE` and `CALL` are calls; every other value is treated as a put.
    #[must_use]
    pub fn from_right(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CE" | "CALL" => Self::Call,
            _ => Self::Put,
        }
    }

    /// Uppercase label used in aliases.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::Put => "PUT",
        }
    }

    /// Lowercase label used by the options subscribe protocol.
    #[must_use]
    pub const fn wire_right(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Put => "put",
        }
    }
}

impl fmt::Display for OptionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Expiry Normalization
// =============================================================================

/// Parse an expiry in any of the upstream formats.
///
/// Accepted: `2024-06-27`, `2024-06-27T00:00:00Z` (and other datetimes with
/// a leading ISO date), `27-Jun-2024`, `27/06/2024`.
#[must_use]
pub fn normalize_expiry(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%d-%b-%Y"))
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%d/%m/%Y"))
        .ok()
        .or_else(|| {
            trimmed
                .get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        })
}

/// Format a date the way expiries appear in aliases and outbound messages.
#[must_use]
pub fn format_expiry(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

// =============================================================================
// Instrument Key
// =============================================================================

/// Logical identity of a quote target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstrumentKey {
    /// Equity or index.
    Simple {
        /// Trading symbol (uppercase).
        symbol: String,
        /// Exchange code (uppercase).
        exchange: String,
        /// Product type (lowercase, e.g. `cash`).
        product_type: String,
    },
    /// Single option contract.
    Derivative {
        /// Underlying symbol (uppercase).
        underlying: String,
        /// Expiry date.
        expiry: NaiveDate,
        /// Call or put.
        side: OptionSide,
        /// Strike with trailing zeros removed.
        strike: Decimal,
    },
}

impl InstrumentKey {
    /// Build a simple key.
    #[must_use]
    pub fn simple(symbol: &str, exchange: &str, product_type: &str) -> Self {
        Self::Simple {
            symbol: symbol.trim().to_ascii_uppercase(),
            exchange: exchange.trim().to_ascii_uppercase(),
            product_type: product_type.trim().to_ascii_lowercase(),
        }
    }

    /// Build a derivative key from an already-parsed expiry.
    #[must_use]
    pub fn derivative(underlying: &str, expiry: NaiveDate, side: OptionSide, strike: Decimal) -> Self {
        Self::Derivative {
            underlying: underlying.trim().to_ascii_uppercase(),
            expiry,
            side,
            strike: strike.normalize(),
        }
    }

    /// Build a derivative key, normalizing a raw expiry string.
    ///
    /// # Errors
    ///
    /// Returns `InstrumentError::InvalidExpiry` if the expiry matches none
    /// of the supported formats.
    pub fn derivative_from_raw(
        underlying: &str,
        raw_expiry: &str,
        side: OptionSide,
        strike: Decimal,
    ) -> Result<Self, InstrumentError> {
        let expiry = normalize_expiry(raw_expiry)
            .ok_or_else(|| InstrumentError::InvalidExpiry(raw_expiry.to_string()))?;
        Ok(Self::derivative(underlying, expiry, side, strike))
    }

    /// Whether this key identifies an option contract.
    #[must_use]
    pub const fn is_derivative(&self) -> bool {
        matches!(self, Self::Derivative { .. })
    }

    /// Symbol for simple keys, underlying for derivatives.
    #[must_use]
    pub fn root_symbol(&self) -> &str {
        match self {
            Self::Simple { symbol, .. } => symbol,
            Self::Derivative { underlying, .. } => underlying,
        }
    }

    /// Expiry of a derivative key.
    #[must_use]
    pub const fn expiry(&self) -> Option<NaiveDate> {
        match self {
            Self::Simple { .. } => None,
            Self::Derivative { expiry, .. } => Some(*expiry),
        }
    }

    /// Wire alias (`UNDERLYING|EXPIRY|SIDE|STRIKE`) for derivative keys.
    #[must_use]
    pub fn alias(&self) -> Option<String> {
        self.is_derivative().then(|| self.to_string())
    }

    /// Canonical string form, used as the persistence key.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple {
                symbol,
                exchange,
                product_type,
            } => write!(f, "{exchange}:{symbol}:{product_type}"),
            Self::Derivative {
                underlying,
                expiry,
                side,
                strike,
            } => write!(f, "{underlying}|{}|{side}|{strike}", format_expiry(*expiry)),
        }
    }
}

impl FromStr for InstrumentKey {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();

        if trimmed.contains('|') {
            let parts: Vec<&str> = trimmed.split('|').map(str::trim).collect();
            let [underlying, expiry, side, strike] = parts.as_slice() else {
                return Err(InstrumentError::InvalidKey(s.to_string()));
            };
            if underlying.is_empty() {
                return Err(InstrumentError::InvalidKey(s.to_string()));
            }
            let strike = Decimal::from_str(strike)
                .map_err(|_| InstrumentError::InvalidStrike((*strike).to_string()))?;
            return Self::derivative_from_raw(underlying, expiry, OptionSide::from_right(side), strike);
        }

        let parts: Vec<&str> = trimmed.split(':').map(str::trim).collect();
        match parts.as_slice() {
            [exchange, symbol, product_type]
                if !exchange.is_empty() && !symbol.is_empty() && !product_type.is_empty() =>
            {
                Ok(Self::simple(symbol, exchange, product_type))
            }
            _ => Err(InstrumentError::InvalidKey(s.to_string())),
        }
    }
}

impl Serialize for InstrumentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstrumentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
