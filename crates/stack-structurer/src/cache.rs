// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Memoisation with at-most-once computation per key.

use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Concurrent requesters for the same key wait on the computation already in flight
/// instead of starting their own. Owned by the embedding application and injected where
/// it is needed.
pub struct SingleFlight<K, V> {
    cells: Mutex<BTreeMap<K, Arc<OnceCell<V>>>>,
}

impl<K: Ord + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the cached value for `key`, running `compute` if no value exists yet.
    ///
    /// The map lock is only held while looking up the cell, so unrelated keys compute in
    /// parallel. A poisoned map lock is recovered since cells are never left half-written.
    pub fn get_or_compute<F>(&self, key: &K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        let cell = {
            let mut cells = match self.cells.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            cells.entry(key.clone()).or_default().clone()
        };
        cell.get_or_init(compute).clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let cells = match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cells.get(key).and_then(|cell| cell.get().cloned())
    }

    pub fn len(&self) -> usize {
        let cells = match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cells.values().filter(|cell| cell.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord + Clone, V: Clone> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
