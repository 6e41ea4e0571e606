//! Alias Table
//!
//! Lookup structure rebuilt by the registry whenever the desired set
//! changes, and read by the tick normalizer to resolve inbound frames.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::Generation;
use crate::domain::instrument::{InstrumentKey, OptionSide};

/// Resolution target of a derivative alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    /// Option side.
    pub side: OptionSide,
    /// Normalized strike.
    pub strike: Decimal,
    /// Full key the alias stands for.
    pub key: InstrumentKey,
}

/// Alias and symbol lookup for one subscription generation.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    generation: Generation,
    derivatives: HashMap<String, AliasEntry>,
    symbols: HashMap<String, InstrumentKey>,
}

impl AliasTable {
    /// Build the table for a desired set.
    #[must_use]
    pub fn build(keys: &BTreeSet<InstrumentKey>, generation: Generation) -> Self {
        let mut derivatives = HashMap::new();
        let mut symbols = HashMap::new();

        for key in keys {
            match key {
                InstrumentKey::Derivative { side, strike, .. } => {
                    derivatives.insert(
                        key.to_string(),
                        AliasEntry {
                            side: *side,
                            strike: *strike,
                            key: key.clone(),
                        },
                    );
                }
                InstrumentKey::Simple { symbol, .. } => {
                    symbols.entry(symbol.clone()).or_insert_with(|| key.clone());
                }
            }
        }

        Self {
            generation,
            derivatives,
            symbols,
        }
    }

    /// Generation this table was built for.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Number of derivative aliases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.derivatives.len()
    }

    /// Whether the table resolves nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.derivatives.is_empty() && self.symbols.is_empty()
    }

    /// Resolve a pipe-delimited alias.
    ///
    /// Tries an exact match first, then re-normalizes the expiry and strike
    /// so `NIFTY|27-Jun-2024|CE|22000.0` finds the same entry.
    #[must_use]
    pub fn resolve(&self, alias: &str) -> Option<&AliasEntry> {
        let exact = alias.trim().to_ascii_uppercase();
        if let Some(entry) = self.derivatives.get(&exact) {
            return Some(entry);
        }

        let key = InstrumentKey::from_str(alias).ok()?;
        self.derivatives.get(&key.to_string())
    }

    /// Find a derivative by structural fields.
    ///
    /// `underlying` narrows the search when present. When several expiries
    /// match, the one equal to `expiry` is preferred.
    #[must_use]
    pub fn find_derivative(
        &self,
        underlying: Option<&str>,
        expiry: Option<NaiveDate>,
        side: OptionSide,
        strike: Decimal,
    ) -> Option<&InstrumentKey> {
        let strike = strike.normalize();
        let underlying = underlying.map(normalize_symbol);

        let mut candidates = self
            .derivatives
            .values()
            .filter(|entry| entry.side == side && entry.strike == strike)
            .filter(|entry| {
                underlying
                    .as_deref()
                    .is_none_or(|u| entry.key.root_symbol() == u)
            })
            .map(|entry| &entry.key)
            .collect::<Vec<_>>();
        candidates.sort();

        candidates
            .iter()
            .find(|key| expiry.is_some() && key.expiry() == expiry)
            .or_else(|| candidates.first())
            .copied()
    }

    /// Resolve a plain symbol against subscribed simple keys.
    ///
    /// Case-insensitive; a trailing `.NS` suffix is ignored.
    #[must_use]
    pub fn resolve_symbol(&self, symbol: &str) -> Option<&InstrumentKey> {
        self.symbols.get(&normalize_symbol(symbol))
    }
}

fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_ascii_uppercase();
    upper
        .strip_suffix(".NS")
        .map_or_else(|| upper.clone(), str::to_string)
}
