//! Applied key-value state.
//!
//! This is the materialized view of the committed log prefix. Each node owns
//! one [`KvStore`] and applies entries to it strictly in commit order, so any
//! two nodes with the same commit watermark hold identical maps.

use std::collections::BTreeMap;

/// The committed key-value map of a single node.
///
/// The node worker owns it exclusively, so there is no interior locking.
/// `BTreeMap` keeps iteration order deterministic for status output and
/// snapshot comparisons in tests.
#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a key-value pair, overwriting any existing value.
    ///
    /// Called only when applying committed entries, in log order.
    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    /// Returns the current committed value for a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// Returns a copy of all committed key-value pairs.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
