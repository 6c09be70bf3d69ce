// Pair Registry
//
// Pairs registered for live swap extraction. Subscribe jobs add to it, the
// extractor reads a snapshot of it at the start of every Registered pass.

use crate::types::PairRecord;
use alloy_primitives::Address;
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Tracks which pairs we extract swaps for
pub struct PairRegistry {
    /// Map of pair address -> metadata
    pairs_by_address: HashMap<Address, PairRecord>,

    /// Set of tracked addresses for fast lookup
    tracked_addresses: HashSet<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_pairs: usize,
    /// Pairs registered without a known creation block (lazily initialized)
    pub lazy_pairs: usize,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self {
            pairs_by_address: HashMap::new(),
            tracked_addresses: HashSet::new(),
        }
    }

    /// Register a pair. Returns false if it was already registered.
    pub fn register(&mut self, pair: PairRecord) -> bool {
        if !self.tracked_addresses.insert(pair.address) {
            return false;
        }
        self.pairs_by_address.insert(pair.address, pair);
        true
    }

    /// Seed from stored pairs, e.g. at startup
    pub fn register_all(&mut self, pairs: impl IntoIterator<Item = PairRecord>) -> usize {
        let added = pairs
            .into_iter()
            .map(|pair| self.register(pair))
            .filter(|added| *added)
            .count();

        if added > 0 {
            info!(
                "Registered {} pairs (total: {})",
                added,
                self.tracked_addresses.len()
            );
        }
        added
    }

    pub fn is_registered(&self, address: &Address) -> bool {
        self.tracked_addresses.contains(address)
    }

    pub fn get(&self, address: &Address) -> Option<&PairRecord> {
        self.pairs_by_address.get(address)
    }

    /// Copy of the tracked address set
    pub fn snapshot(&self) -> HashSet<Address> {
        self.tracked_addresses.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked_addresses.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_pairs: self.pairs_by_address.len(),
            lazy_pairs: self
                .pairs_by_address
                .values()
                .filter(|pair| pair.created_block == 0)
                .count(),
        }
    }
}

impl Default for PairRegistry {
    fn default() -> Self {
        Self::new()
    }
}
