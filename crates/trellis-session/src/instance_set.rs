// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Planned-instance bookkeeping.
//!
//! When the planner decides instances must be created it does not yet know
//! their instance numbers - only the alias keys they must end up with. An
//! [`InstanceSet`] holds those pending key-maps. Duplicates are meaningful:
//! declaring `min = 3` with the same keys plans three creations.

use std::collections::BTreeMap;

/// An alias key-map: subpath string → required literal.
pub type InstanceKeys = BTreeMap<String, String>;

/// A multiset of pending instance key-maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSet {
    entries: Vec<InstanceKeys>,
}

impl InstanceSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a pending instance.
    pub fn add(&mut self, keys: InstanceKeys) {
        self.entries.push(keys);
    }

    /// Iterate pending instances.
    pub fn iter(&self) -> impl Iterator<Item = &InstanceKeys> {
        self.entries.iter()
    }

    /// Remove and return one pending instance, oldest first.
    pub fn take(&mut self) -> Option<InstanceKeys> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Entries whose keys are a superset of `keys` (they satisfy every
    /// constraint in `keys`, possibly more).
    pub fn superset(&self, keys: &InstanceKeys) -> Vec<&InstanceKeys> {
        self.entries
            .iter()
            .filter(|e| keys.iter().all(|(k, v)| e.get(k) == Some(v)))
            .collect()
    }

    /// Entries whose keys are a subset of `keys` (every constraint they carry
    /// appears in `keys`).
    pub fn subset(&self, keys: &InstanceKeys) -> Vec<&InstanceKeys> {
        self.entries
            .iter()
            .filter(|e| e.iter().all(|(k, v)| keys.get(k) == Some(v)))
            .collect()
    }

    /// Remove one entry equal to `keys`. Returns whether one was removed.
    pub fn remove(&mut self, keys: &InstanceKeys) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e == keys) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(pairs: &[(&str, &str)]) -> InstanceKeys {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut set = InstanceSet::new();
        set.add(keys(&[("Name", "wan0")]));
        set.add(keys(&[("Name", "wan0")]));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_superset_query() {
        let mut set = InstanceSet::new();
        set.add(keys(&[("Name", "wan0"), ("Type", "ppp")]));
        set.add(keys(&[("Name", "wan1")]));
        set.add(keys(&[]));

        let sup = set.superset(&keys(&[("Name", "wan0")]));
        assert_eq!(sup.len(), 1);
        assert_eq!(sup[0].get("Type").map(String::as_str), Some("ppp"));

        // The empty constraint is satisfied by everything.
        assert_eq!(set.superset(&keys(&[])).len(), 3);
    }

    #[test]
    fn test_subset_query() {
        let mut set = InstanceSet::new();
        set.add(keys(&[("Name", "wan0")]));
        set.add(keys(&[("Name", "wan0"), ("Type", "ppp")]));
        set.add(keys(&[]));

        let sub = set.subset(&keys(&[("Name", "wan0")]));
        assert_eq!(sub.len(), 2); // the exact match and the empty map
    }

    #[test]
    fn test_take_is_fifo() {
        let mut set = InstanceSet::new();
        set.add(keys(&[("Name", "a")]));
        set.add(keys(&[("Name", "b")]));
        assert_eq!(set.take().unwrap().get("Name").unwrap(), "a");
        assert_eq!(set.take().unwrap().get("Name").unwrap(), "b");
        assert!(set.take().is_none());
    }

    #[test]
    fn test_remove_single_occurrence() {
        let mut set = InstanceSet::new();
        set.add(keys(&[("Name", "a")]));
        set.add(keys(&[("Name", "a")]));
        assert!(set.remove(&keys(&[("Name", "a")])));
        assert_eq!(set.len(), 1);
    }
}
