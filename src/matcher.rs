//! Lock-free IP matcher (C3).
//!
//! Holds a single [`arc_swap::ArcSwap`] reference to an immutable
//! `{trie, approx_entry_count}` bundle: readers never block, and an
//! update is a single pointer replace. The old bundle becomes
//! unreachable once no in-flight read holds it.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::trie::Trie;

struct MatcherState {
    trie: Trie,
    approx_entry_count: u32,
}

pub struct Matcher {
    inner: ArcSwap<MatcherState>,
}

impl Matcher {
    pub fn empty() -> Self {
        Self {
            inner: ArcSwap::from_pointee(MatcherState {
                trie: Trie::new(),
                approx_entry_count: 0,
            }),
        }
    }

    /// Replace the live trie wholesale. All-or-nothing: readers observe
    /// either the old or the new bundle, never a partially constructed one.
    pub fn update(&self, trie: Trie, approx_entry_count: u32) {
        self.inner.store(Arc::new(MatcherState {
            trie,
            approx_entry_count,
        }));
    }

    /// Parses `ip_text` and delegates to the current trie. Invalid textual
    /// IPs return `false` without error.
    pub fn contains(&self, ip_text: &str) -> bool {
        match ip_text.parse() {
            Ok(addr) => self.inner.load().trie.contains(addr),
            Err(_) => false,
        }
    }

    /// Approximate number of inserted prefixes, for telemetry only; derived
    /// from the serialized node count via a `nodes/7` heuristic rather than
    /// an exact tally.
    pub fn approx_entry_count(&self) -> u32 {
        self.inner.load().approx_entry_count
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::empty()
    }
}
