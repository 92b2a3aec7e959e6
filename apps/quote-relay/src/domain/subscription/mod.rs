//! Subscription Tracking
//!
//! Reference-counted symbol interest shared by many sessions over one
//! upstream connection.
//!
//! # Design
//!
//! [`InterestSet`] is the reusable refcount core: symbols mapped to how
//! many holders want them, reporting only the 0→1 and 1→0 transitions.
//! [`SubscriptionRegistry`] layers per-session bookkeeping on top and is
//! the single source of truth for which symbols the upstream link must
//! hold; the returned [`SubscriptionChanges`] are the only trigger for
//! upstream subscribe/unsubscribe traffic.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::domain::market::Symbol;

/// Unique identifier for a downstream session.
pub type SessionId = u64;

// =============================================================================
// Subscription Changes
// =============================================================================

/// Net upstream effect of a registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Symbols whose interest went 0→1; subscribe upstream.
    pub subscribe: HashSet<Symbol>,
    /// Symbols whose interest went 1→0; unsubscribe upstream.
    pub unsubscribe: HashSet<Symbol>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            subscribe: symbols.into_iter().collect(),
            unsubscribe: HashSet::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            subscribe: HashSet::new(),
            unsubscribe: symbols.into_iter().collect(),
        }
    }
}

// =============================================================================
// Interest Set
// =============================================================================

/// Reference-counted set of symbols.
///
/// Counts are per distinct holder; callers are responsible for not
/// double-counting a single holder (the registry enforces this with its
/// per-session symbol sets).
#[derive(Debug, Default)]
pub struct InterestSet {
    refcounts: HashMap<Symbol, usize>,
}

impl InterestSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments interest in `symbol`.
    ///
    /// Returns `true` on the 0→1 transition.
    pub fn add(&mut self, symbol: &Symbol) -> bool {
        let count = self.refcounts.entry(symbol.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Decrements interest in `symbol`.
    ///
    /// Returns `true` on the 1→0 transition. Removing a symbol that was
    /// never tracked is a no-op.
    pub fn remove(&mut self, symbol: &Symbol) -> bool {
        let Some(count) = self.refcounts.get_mut(symbol) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.refcounts.remove(symbol);
            return true;
        }
        false
    }

    /// Current refcount for `symbol` (0 if untracked).
    #[must_use]
    pub fn count(&self, symbol: &str) -> usize {
        self.refcounts.get(symbol).copied().unwrap_or(0)
    }

    /// Whether any symbol has interest.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refcounts.is_empty()
    }

    /// Number of symbols with interest.
    #[must_use]
    pub fn len(&self) -> usize {
        self.refcounts.len()
    }

    /// All symbols with nonzero interest.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.refcounts.keys().cloned().collect()
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    /// Map from session ID to its subscribed symbols.
    session_symbols: HashMap<SessionId, HashSet<Symbol>>,
    /// Process-wide refcounted interest.
    interest: InterestSet,
}

/// Registry statistics for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Symbols with at least one interested session.
    pub symbol_count: usize,
    /// Sessions holding at least one symbol.
    pub session_count: usize,
}

/// Thread-safe registry mapping sessions to symbols.
///
/// All methods take `&self`; interior mutability via [`RwLock`] lets the
/// registry be shared across session tasks behind an `Arc`.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `symbols` for `session`.
    ///
    /// Symbols the session already holds are skipped; empty symbols are
    /// never registered. Returns the upstream subscribes needed.
    pub fn add_interest(&self, session: SessionId, symbols: &[Symbol]) -> SubscriptionChanges {
        let mut state = self.state.write();
        let mut changes = SubscriptionChanges::default();

        for symbol in symbols {
            if symbol.is_empty() {
                continue;
            }
            let session_set = state.session_symbols.entry(session).or_default();
            if !session_set.insert(symbol.clone()) {
                continue;
            }
            if state.interest.add(symbol) {
                changes.subscribe.insert(symbol.clone());
            }
        }

        changes
    }

    /// Drops interest in `symbols` for `session`.
    ///
    /// Symbols the session never held are skipped. Returns the upstream
    /// unsubscribes needed.
    pub fn remove_interest(&self, session: SessionId, symbols: &[Symbol]) -> SubscriptionChanges {
        let mut state = self.state.write();
        let mut changes = SubscriptionChanges::default();

        for symbol in symbols {
            let Some(session_set) = state.session_symbols.get_mut(&session) else {
                break;
            };
            if !session_set.remove(symbol) {
                continue;
            }
            if session_set.is_empty() {
                state.session_symbols.remove(&session);
            }
            if state.interest.remove(symbol) {
                changes.unsubscribe.insert(symbol.clone());
            }
        }

        changes
    }

    /// Drops all interest held by `session`.
    ///
    /// Idempotent: closing an unknown or already-closed session returns
    /// empty changes.
    pub fn session_closed(&self, session: SessionId) -> SubscriptionChanges {
        let mut state = self.state.write();
        let Some(session_set) = state.session_symbols.remove(&session) else {
            return SubscriptionChanges::default();
        };

        let released = session_set
            .into_iter()
            .filter(|symbol| state.interest.remove(symbol))
            .collect::<Vec<_>>();

        SubscriptionChanges::unsubscribe_only(released)
    }

    /// All symbols with at least one interested session.
    ///
    /// This is the authoritative set the upstream link must hold; it is
    /// replayed wholesale after every reconnect.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.state.read().interest.symbols()
    }

    /// Symbols held by a specific session.
    #[must_use]
    pub fn session_symbols(&self, session: SessionId) -> Vec<Symbol> {
        self.state
            .read()
            .session_symbols
            .get(&session)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            symbol_count: state.interest.len(),
            session_count: state.session_symbols.len(),
        }
    }
}
