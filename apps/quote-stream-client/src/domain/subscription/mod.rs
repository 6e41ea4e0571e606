//! Subscription Registry
//!
//! Tracks the desired instrument set, diffs it against what was last
//! requested, and produces the outbound commands that reconcile the two.
//!
//! # Design
//!
//! The registry owns three pieces of state:
//! - The desired set of instrument keys
//! - A monotonically increasing [`Generation`] bumped on every context switch
//! - The [`AliasTable`] used to resolve inbound ticks for that generation
//!
//! A change that drops an `(underlying, expiry)` context is a context
//! switch. Its unsubscribes are returned as immediate commands, tagged with
//! the generation they were subscribed under, and the full new set is
//! deferred under the next generation. The caller sends the deferred
//! commands after a grace delay, so the gateway never sees the new context
//! before the old one is released.

mod alias;

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use rust_decimal::Decimal;

pub use alias::{AliasEntry, AliasTable};

use crate::domain::instrument::{InstrumentKey, OptionSide, format_expiry};
use crate::domain::streaming::{OptionsRequest, OutboundMessage, SymbolSpec};

// =============================================================================
// Generation
// =============================================================================

/// Tag for one desired instrument set. Zero means "never set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(u64);

impl Generation {
    /// Wrap a raw generation value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value, as sent in `subscriptionId`.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Whether a tick tagged with `tag` belongs to a superseded generation.
    ///
    /// Untagged ticks and ticks tagged zero are never stale by this test.
    #[must_use]
    pub fn is_stale(self, tag: Option<u64>) -> bool {
        tag.is_some_and(|tag| tag != 0 && tag != self.0)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Subscription Plan
// =============================================================================

/// Commands produced by a desired-set change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPlan {
    /// Send now, in order.
    pub immediate: Vec<OutboundMessage>,
    /// Send after the grace delay. Non-empty only on a context switch.
    pub deferred: Vec<OutboundMessage>,
}

impl SubscriptionPlan {
    /// Whether the change requires no traffic.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.immediate.is_empty() && self.deferred.is_empty()
    }

    /// Whether subscribes must wait for the grace delay.
    #[must_use]
    pub fn is_context_switch(&self) -> bool {
        !self.deferred.is_empty()
    }
}

/// `(underlying, expiry)` pair shared by a strike ladder.
type Context = (String, NaiveDate);

/// `(underlying, expiry, side)` group sent as one options command.
type Ladder = (String, NaiveDate, OptionSide);

// =============================================================================
// Registry
// =============================================================================

/// Desired subscription set with generation tracking.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    desired: BTreeSet<InstrumentKey>,
    generation: Generation,
    aliases: AliasTable,
}

impl SubscriptionRegistry {
    /// Create an empty registry at generation zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the desired set.
    ///
    /// Returns an empty plan when the set is unchanged. Otherwise rebuilds
    /// the alias table and returns the commands that move the gateway from
    /// the previous set to the new one.
    ///
    /// The generation advances on the first set and on every context
    /// switch. A plain diff inside the retained contexts keeps it, so
    /// ladders that stay subscribed keep matching their tag. Unsubscribes
    /// always carry the generation the ladder was subscribed under.
    pub fn set_desired(&mut self, keys: impl IntoIterator<Item = InstrumentKey>) -> SubscriptionPlan {
        let next: BTreeSet<InstrumentKey> = keys.into_iter().collect();
        if next == self.desired {
            return SubscriptionPlan::default();
        }

        let previous = std::mem::replace(&mut self.desired, next);
        let prior = self.generation;

        let to_add: BTreeSet<InstrumentKey> = self.desired.difference(&previous).cloned().collect();
        let to_remove: BTreeSet<InstrumentKey> =
            previous.difference(&self.desired).cloned().collect();

        let dropped_contexts: BTreeSet<Context> = contexts(&previous)
            .difference(&contexts(&self.desired))
            .cloned()
            .collect();

        if dropped_contexts.is_empty() {
            if prior == Generation::default() {
                self.generation = prior.next();
            }
            self.aliases = AliasTable::build(&self.desired, self.generation);

            let mut immediate = unsubscribe_messages(&to_remove, prior);
            immediate.extend(subscribe_messages(&to_add, self.generation));
            return SubscriptionPlan {
                immediate,
                deferred: Vec::new(),
            };
        }

        // Dropped contexts are released in full; everything else is a plain diff.
        let (released, retained): (BTreeSet<InstrumentKey>, BTreeSet<InstrumentKey>) = to_remove
            .into_iter()
            .partition(|key| context_of(key).is_some_and(|ctx| dropped_contexts.contains(&ctx)));

        let mut immediate = unsubscribe_messages(&released, prior);
        immediate.extend(unsubscribe_messages(&retained, prior));

        self.generation = prior.next();
        self.aliases = AliasTable::build(&self.desired, self.generation);

        // Retained ladders are re-sent so every ladder carries the new tag.
        SubscriptionPlan {
            immediate,
            deferred: self.subscribe_all(),
        }
    }

    /// Commands that subscribe the entire desired set.
    ///
    /// Sent whenever the connection (re)enters OPEN, since the gateway does
    /// not remember subscriptions across sockets.
    #[must_use]
    pub fn subscribe_all(&self) -> Vec<OutboundMessage> {
        subscribe_messages(&self.desired, self.generation)
    }

    /// Commands that release the entire desired set.
    #[must_use]
    pub fn unsubscribe_all(&self) -> Vec<OutboundMessage> {
        unsubscribe_messages(&self.desired, self.generation)
    }

    /// Whether `key` is in the desired set.
    #[must_use]
    pub fn is_subscribed(&self, key: &InstrumentKey) -> bool {
        self.desired.contains(key)
    }

    /// Current generation.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Alias table for the current generation.
    #[must_use]
    pub const fn alias_table(&self) -> &AliasTable {
        &self.aliases
    }

    /// Desired keys in canonical order.
    pub fn desired(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.desired.iter()
    }

    /// Number of desired keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.desired.len()
    }

    /// Whether nothing is desired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }
}

fn subscribe_messages(keys: &BTreeSet<InstrumentKey>, generation: Generation) -> Vec<OutboundMessage> {
    let (symbols, ladders) = group(keys, generation);
    let mut messages = Vec::with_capacity(ladders.len() + 1);
    if !symbols.is_empty() {
        messages.push(OutboundMessage::SubscribeMany { symbols });
    }
    messages.extend(ladders.into_iter().map(OutboundMessage::SubscribeOptions));
    messages
}

fn unsubscribe_messages(keys: &BTreeSet<InstrumentKey>, generation: Generation) -> Vec<OutboundMessage> {
    let (symbols, ladders) = group(keys, generation);
    let mut messages = Vec::with_capacity(ladders.len() + 1);
    messages.extend(ladders.into_iter().map(OutboundMessage::UnsubscribeOptions));
    if !symbols.is_empty() {
        messages.push(OutboundMessage::UnsubscribeMany { symbols });
    }
    messages
}

fn group(
    keys: &BTreeSet<InstrumentKey>,
    generation: Generation,
) -> (Vec<SymbolSpec>, Vec<OptionsRequest>) {
    let mut symbols = Vec::new();
    let mut ladders: BTreeMap<Ladder, Vec<Decimal>> = BTreeMap::new();

    for key in keys {
        match key {
            InstrumentKey::Simple {
                symbol,
                exchange,
                product_type,
            } => symbols.push(SymbolSpec {
                stock_code: symbol.clone(),
                exchange_code: exchange.clone(),
                product_type: product_type.clone(),
            }),
            InstrumentKey::Derivative {
                underlying,
                expiry,
                side,
                strike,
            } => ladders
                .entry((underlying.clone(), *expiry, *side))
                .or_default()
                .push(*strike),
        }
    }

    let requests = ladders
        .into_iter()
        .map(|((underlying, expiry, side), strikes)| OptionsRequest {
            underlying,
            expiry_date: format_expiry(expiry),
            strikes,
            right: side,
            subscription_id: generation.get(),
        })
        .collect();

    (symbols, requests)
}

fn context_of(key: &InstrumentKey) -> Option<Context> {
    match key {
        InstrumentKey::Derivative {
            underlying, expiry, ..
        } => Some((underlying.clone(), *expiry)),
        InstrumentKey::Simple { .. } => None,
    }
}

fn contexts(keys: &BTreeSet<InstrumentKey>) -> BTreeSet<Context> {
    keys.iter().filter_map(context_of).collect()
}

// =============================================================================
// Tests
// =============================================================================
