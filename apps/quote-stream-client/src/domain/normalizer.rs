//! Tick Normalizer
//!
//! Turns a raw inbound frame into at most one [`TickUpdate`]. Pure: it
//! reads the alias table and current generation but never mutates them.
//!
//! # Resolution Order
//!
//! 1. Pipe alias (`alias`, or a `symbol` containing `|`)
//! 2. Structural fields (`strikePrice` with `right`/`rightType`)
//! 3. Plain symbol against subscribed simple keys
//!
//! Ticks for keys outside the current desired set resolve to nothing and
//! are dropped.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::domain::instrument::{InstrumentKey, OptionSide, normalize_expiry};
use crate::domain::quote::TickUpdate;
use crate::domain::streaming::{InboundMessage, RawTick, decimal_from_value};
use crate::domain::subscription::{AliasTable, Generation};

const ALIAS_FIELDS: &[&str] = &["alias"];
const SYMBOL_FIELDS: &[&str] = &["symbol", "stockCode", "stock_code", "underlying"];
const STRIKE_FIELDS: &[&str] = &["strikePrice", "strike_price", "strike"];
const RIGHT_FIELDS: &[&str] = &["right", "rightType", "right_type", "optionType", "option_type"];
const EXPIRY_FIELDS: &[&str] = &["expiryDate", "expiry_date", "expiry"];
const LTP_FIELDS: &[&str] = &["ltp", "last", "close"];
const CLOSE_FIELDS: &[&str] = &["close", "prevClose", "previousClose"];
const VOLUME_FIELDS: &[&str] = &["volume", "ltq", "totalQuantityTraded"];
const OI_FIELDS: &[&str] = &["openInterest", "OI", "oi"];
const COMPACT_OI_FIELD: &str = "ttv";
const CHANGE_FIELDS: &[&str] = &["changePct", "change_pct", "pChange"];
const BID_FIELDS: &[&str] = &["bid", "bPrice", "best_bid_price", "bestBidPrice"];
const ASK_FIELDS: &[&str] = &["ask", "sPrice", "best_ask_price", "bestAskPrice"];
const TIME_FIELDS: &[&str] = &["timestamp", "ltt", "datetime"];

#[allow(clippy::expect_used)]
static COMPACT_NOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([\d.]+)([KMBC]?)$").expect("static compact-notation pattern is valid")
});

/// Why a frame produced no tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Control, ack or error frame.
    NotATick,
    /// No subscribed instrument matched.
    UnknownInstrument,
    /// Generation tag from a superseded subscription set.
    StaleGeneration,
    /// Expiry does not match the resolved contract.
    ExpiryMismatch,
    /// No price, top-of-book level or volume present.
    NoPrice,
}

impl Rejection {
    /// Label for the dropped-ticks metric.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotATick => "not_a_tick",
            Self::UnknownInstrument => "unknown_instrument",
            Self::StaleGeneration => "stale_generation",
            Self::ExpiryMismatch => "expiry_mismatch",
            Self::NoPrice => "no_price",
        }
    }
}

/// Normalize a frame, stamping untagged ticks with the current time.
#[must_use]
pub fn normalize(
    message: &InboundMessage,
    aliases: &AliasTable,
    current: Generation,
) -> Option<TickUpdate> {
    evaluate(message, aliases, current, Utc::now()).ok()
}

/// Normalize a frame, reporting why it was dropped.
///
/// # Errors
///
/// Returns the [`Rejection`] that stopped the frame.
pub fn evaluate(
    message: &InboundMessage,
    aliases: &AliasTable,
    current: Generation,
    now: DateTime<Utc>,
) -> Result<TickUpdate, Rejection> {
    let InboundMessage::Tick(raw) = message else {
        return Err(Rejection::NotATick);
    };

    let key = resolve_key(raw, aliases).ok_or(Rejection::UnknownInstrument)?;

    if current.is_stale(raw.generation()) {
        return Err(Rejection::StaleGeneration);
    }

    if let Some(expected) = key.expiry()
        && let Some(raw_expiry) = raw.text(EXPIRY_FIELDS)
        && normalize_expiry(raw_expiry) != Some(expected)
    {
        return Err(Rejection::ExpiryMismatch);
    }

    let ltp = raw.decimal(LTP_FIELDS);
    let volume = raw.count(VOLUME_FIELDS);
    let bid = raw.decimal(BID_FIELDS).or_else(|| raw.best_price("bids"));
    let ask = raw.decimal(ASK_FIELDS).or_else(|| raw.best_price("asks"));
    if ltp.is_none() && volume.is_none() && bid.is_none() && ask.is_none() {
        return Err(Rejection::NoPrice);
    }

    let close = raw.decimal(CLOSE_FIELDS);
    let change_pct = raw.decimal(CHANGE_FIELDS).or_else(|| derive_change_pct(ltp, close));

    Ok(TickUpdate {
        key,
        ltp,
        close,
        volume,
        open_interest: raw.count(OI_FIELDS).or_else(|| compact_open_interest(raw)),
        change_pct,
        bid,
        ask,
        timestamp: raw
            .text(TIME_FIELDS)
            .and_then(parse_timestamp)
            .or_else(|| raw.count(TIME_FIELDS).and_then(epoch_timestamp))
            .unwrap_or(now),
    })
}

fn resolve_key(raw: &RawTick, aliases: &AliasTable) -> Option<InstrumentKey> {
    let symbol = raw.text(SYMBOL_FIELDS);

    let alias = raw
        .text(ALIAS_FIELDS)
        .or_else(|| symbol.filter(|s| s.contains('|')));
    if let Some(alias) = alias {
        return aliases.resolve(alias).map(|entry| entry.key.clone());
    }

    if let Some(strike) = raw.decimal(STRIKE_FIELDS)
        && let Some(right) = raw.text(RIGHT_FIELDS)
    {
        let expiry = raw.text(EXPIRY_FIELDS).and_then(normalize_expiry);
        return aliases
            .find_derivative(symbol, expiry, OptionSide::from_right(right), strike)
            .cloned();
    }

    symbol
        .and_then(|s| aliases.resolve_symbol(s))
        .cloned()
}

fn derive_change_pct(ltp: Option<Decimal>, close: Option<Decimal>) -> Option<Decimal> {
    let (ltp, close) = (ltp?, close?);
    if close <= Decimal::ZERO {
        return None;
    }
    ((ltp - close) / close)
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|pct| pct.round_dp(4))
}

/// Parse compact volume notation such as `12.5K` or `1.2C`.
///
/// `B` and `C` (crore) share the ten-million multiplier used by the feed.
#[must_use]
pub fn parse_compact(raw: &str) -> Option<u64> {
    let upper = raw.trim().to_ascii_uppercase();
    let captures = COMPACT_NOTATION.captures(&upper)?;
    let base: Decimal = captures.get(1)?.as_str().parse().ok()?;
    let multiplier = match captures.get(2).map_or("", |m| m.as_str()) {
        "K" => Decimal::from(1_000),
        "M" => Decimal::from(1_000_000),
        "B" | "C" => Decimal::from(10_000_000),
        _ => Decimal::ONE,
    };
    base.checked_mul(multiplier)
        .and_then(|value| value.round().to_u64())
}

fn compact_open_interest(raw: &RawTick) -> Option<u64> {
    match raw.get(COMPACT_OI_FIELD)? {
        serde_json::Value::String(s) => parse_compact(s),
        other => decimal_from_value(other).and_then(|d| d.trunc().to_u64()),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%d-%b-%Y %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn epoch_timestamp(value: u64) -> Option<DateTime<Utc>> {
    let value = i64::try_from(value).ok()?;
    // Millisecond epochs are 13 digits for any date after 2001.
    if value >= 1_000_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use serde_json::{Value, json};
    use test_case::test_case;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 27).unwrap()
    }

    fn call() -> InstrumentKey {
        InstrumentKey::derivative("NIFTY", expiry(), OptionSide::Call, dec!(22000))
    }

    fn put() -> InstrumentKey {
        InstrumentKey::derivative("NIFTY", expiry(), OptionSide::Put, dec!(22000))
    }

    fn index() -> InstrumentKey {
        InstrumentKey::simple("NIFTY 50", "NSE", "cash")
    }

    fn table(generation: u64) -> AliasTable {
        let keys: BTreeSet<InstrumentKey> = [call(), put(), index()].into_iter().collect();
        AliasTable::build(&keys, Generation::new(generation))
    }

    fn frame(value: Value) -> InboundMessage {
        serde_json::from_value(value).unwrap()
    }

    fn run(value: Value) -> Result<TickUpdate, Rejection> {
        evaluate(&frame(value), &table(3), Generation::new(3), Utc::now())
    }

    #[test]
    fn control_frames_are_not_ticks() {
        for value in [
            json!({"type": "subscribed", "message": "ok"}),
            json!({"type": "unsubscribed"}),
            json!({"type": "error", "message": "bad"}),
            json!({"type": "info"}),
            json!({"type": "pong"}),
        ] {
            assert_eq!(run(value), Err(Rejection::NotATick));
        }
    }

    #[test]
    fn alias_resolution() {
        let tick = run(json!({
            "type": "tick", "alias": "NIFTY|2024-06-27|CALL|22000", "ltp": 101.5
        }))
        .unwrap();
        assert_eq!(tick.key, call());
        assert_eq!(tick.ltp, Some(dec!(101.5)));
    }

    #[test]
    fn pipe_symbol_is_treated_as_alias() {
        let tick = run(json!({
            "type": "tick", "symbol": "NIFTY|27-Jun-2024|PUT|22000", "last": "88"
        }))
        .unwrap();
        assert_eq!(tick.key, put());
    }

    #[test]
    fn structural_resolution_maps_right_codes() {
        let ce = run(json!({
            "type": "tick", "symbol": "NIFTY", "strikePrice": "22000", "right": "CE",
            "expiryDate": "27-Jun-2024", "ltp": 12
        }))
        .unwrap();
        assert_eq!(ce.key, call());

        let pe = run(json!({
            "type": "tick", "strikePrice": 22000.0, "rightType": "PE", "ltp": 9
        }))
        .unwrap();
        assert_eq!(pe.key, put());
    }

    #[test]
    fn plain_symbol_resolution_strips_suffix() {
        let tick = run(json!({"type": "tick", "symbol": "nifty 50.ns", "ltp": 22500})).unwrap();
        assert_eq!(tick.key, index());
    }

    #[test]
    fn unsubscribed_instrument_is_dropped() {
        assert_eq!(
            run(json!({"type": "tick", "alias": "NIFTY|2024-06-27|CALL|22100", "ltp": 1})),
            Err(Rejection::UnknownInstrument)
        );
        assert_eq!(
            run(json!({"type": "tick", "symbol": "TCS", "ltp": 1})),
            Err(Rejection::UnknownInstrument)
        );
    }

    #[test]
    fn previous_generation_is_stale() {
        let base = json!({"type": "tick", "alias": "NIFTY|2024-06-27|CALL|22000", "ltp": 1});

        let mut stale = base.clone();
        stale["subscriptionId"] = json!(2);
        assert_eq!(run(stale), Err(Rejection::StaleGeneration));

        let mut current = base.clone();
        current["subscriptionId"] = json!(3);
        assert!(run(current).is_ok());

        let mut zero = base.clone();
        zero["subscriptionId"] = json!(0);
        assert!(run(zero).is_ok());

        assert!(run(base).is_ok());
    }

    #[test]
    fn expiry_mismatch_is_rejected() {
        assert_eq!(
            run(json!({
                "type": "tick", "alias": "NIFTY|2024-06-27|CALL|22000",
                "expiryDate": "20-Jun-2024", "ltp": 1
            })),
            Err(Rejection::ExpiryMismatch)
        );
        assert!(
            run(json!({
                "type": "tick", "alias": "NIFTY|2024-06-27|CALL|22000",
                "expiry": "2024-06-27T00:00:00Z", "ltp": 1
            }))
            .is_ok()
        );
    }

    #[test]
    fn ltp_priority_and_no_price_rejection() {
        let tick = run(json!({
            "type": "tick", "symbol": "NIFTY 50", "last": 10, "close": 9
        }))
        .unwrap();
        assert_eq!(tick.ltp, Some(dec!(10)));
        assert_eq!(tick.close, Some(dec!(9)));

        let fallback = run(json!({"type": "tick", "symbol": "NIFTY 50", "close": 9})).unwrap();
        assert_eq!(fallback.ltp, Some(dec!(9)));

        assert_eq!(
            run(json!({"type": "tick", "symbol": "NIFTY 50", "changePct": 1.2})),
            Err(Rejection::NoPrice)
        );

        let depth_only = run(json!({
            "type": "tick", "symbol": "NIFTY 50", "bids": [{"price": 1}]
        }))
        .unwrap();
        assert_eq!(depth_only.ltp, None);
        assert_eq!(depth_only.bid, Some(dec!(1)));

        assert_eq!(
            run(json!({"type": "tick", "symbol": "NIFTY 50", "bids": [], "asks": []})),
            Err(Rejection::NoPrice)
        );

        let volume_only = run(json!({"type": "tick", "symbol": "NIFTY 50", "ltq": "75"})).unwrap();
        assert_eq!(volume_only.volume, Some(75));
    }

    #[test]
    fn top_of_book_comes_from_depth_levels() {
        let tick = run(json!({
            "type": "tick", "symbol": "NIFTY 50",
            "bids": [{"price": "22010.5", "qty": 75}, {"price": "22010", "qty": 150}],
            "asks": [["22011.25", 50]]
        }))
        .unwrap();
        assert_eq!(tick.bid, Some(dec!(22010.5)));
        assert_eq!(tick.ask, Some(dec!(22011.25)));

        let nested = run(json!({
            "type": "tick", "symbol": "NIFTY 50", "bPrice": 22009,
            "depth": {"bids": [{"rate": 22008}], "asks": [{"rate": 22012}]}
        }))
        .unwrap();
        assert_eq!(nested.bid, Some(dec!(22009)));
        assert_eq!(nested.ask, Some(dec!(22012)));
    }

    #[test]
    fn open_interest_priority() {
        let explicit = run(json!({
            "type": "tick", "symbol": "NIFTY 50", "ltp": 1, "OI": "1200", "ttv": "5K"
        }))
        .unwrap();
        assert_eq!(explicit.open_interest, Some(1200));

        let compact = run(json!({"type": "tick", "symbol": "NIFTY 50", "ltp": 1, "ttv": "1.5M"}))
            .unwrap();
        assert_eq!(compact.open_interest, Some(1_500_000));
    }

    #[test_case("12.5K", Some(12_500) ; "thousands")]
    #[test_case("1.5M", Some(1_500_000) ; "millions")]
    #[test_case("2B", Some(20_000_000) ; "billions use crore multiplier")]
    #[test_case("2C", Some(20_000_000) ; "crore")]
    #[test_case("2c", Some(20_000_000) ; "lowercase suffix")]
    #[test_case("750", Some(750) ; "no suffix")]
    #[test_case("1.2X", None ; "unknown suffix")]
    #[test_case("-5K", None ; "negative")]
    fn compact_notation(raw: &str, expected: Option<u64>) {
        assert_eq!(parse_compact(raw), expected);
    }

    #[test]
    fn change_pct_explicit_or_derived() {
        let explicit = run(json!({
            "type": "tick", "symbol": "NIFTY 50", "ltp": 110, "close": 100, "changePct": "2.5"
        }))
        .unwrap();
        assert_eq!(explicit.change_pct, Some(dec!(2.5)));

        let derived = run(json!({"type": "tick", "symbol": "NIFTY 50", "ltp": 110, "close": 100}))
            .unwrap();
        assert_eq!(derived.change_pct, Some(dec!(10)));

        let zero_close =
            run(json!({"type": "tick", "symbol": "NIFTY 50", "ltp": 110, "close": 0})).unwrap();
        assert_eq!(zero_close.ltp, Some(dec!(110)));
        assert_eq!(zero_close.change_pct, None);
    }

    #[test]
    fn timestamp_parsing() {
        let now = Utc::now();
        let rfc = evaluate(
            &frame(json!({
                "type": "tick", "symbol": "NIFTY 50", "ltp": 1, "timestamp": "2024-06-27T09:15:00Z"
            })),
            &table(1),
            Generation::new(1),
            now,
        )
        .unwrap();
        assert_eq!(rfc.timestamp.to_rfc3339(), "2024-06-27T09:15:00+00:00");

        let epoch = evaluate(
            &frame(json!({"type": "tick", "symbol": "NIFTY 50", "ltp": 1, "ltt": 1_719_479_700_000_u64})),
            &table(1),
            Generation::new(1),
            now,
        )
        .unwrap();
        assert_eq!(epoch.timestamp.timestamp(), 1_719_479_700);

        let missing = evaluate(
            &frame(json!({"type": "tick", "symbol": "NIFTY 50", "ltp": 1})),
            &table(1),
            Generation::new(1),
            now,
        )
        .unwrap();
        assert_eq!(missing.timestamp, now);
    }

    #[test]
    fn normalize_wraps_evaluate() {
        let msg = frame(json!({"type": "tick", "symbol": "NIFTY 50", "ltp": 1}));
        assert!(normalize(&msg, &table(1), Generation::new(1)).is_some());
        assert!(normalize(&frame(json!({"type": "info"})), &table(1), Generation::new(1)).is_none());
    }
}
