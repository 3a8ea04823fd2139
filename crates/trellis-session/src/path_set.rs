// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Path interning and pattern matching.
//!
//! A [`PathSet`] is an ordered trie keyed by segment. [`PathSet::add`]
//! interns a path and hands back the canonical `Arc<Path>`; adding an equal
//! path later returns the same allocation, so handle comparisons elsewhere in
//! the engine are cheap and every structure holding paths shares storage.
//!
//! [`PathSet::find`] matches a pattern against the stored paths under the
//! wildcard/alias semantics: with `superset` set, stored paths that are more
//! general than the pattern (wildcards where the pattern is concrete) are
//! returned; with `subset`, stored paths the pattern covers are returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::path::{Path, Segment};

#[derive(Debug, Default)]
struct Node {
    children: BTreeMap<Segment, Node>,
    path: Option<Arc<Path>>,
}

/// The interning trie.
#[derive(Debug, Default)]
pub struct PathSet {
    root: Node,
    len: usize,
}

impl PathSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interned paths.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is interned.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Intern `path`, returning the canonical handle.
    pub fn add(&mut self, path: Path) -> Arc<Path> {
        let mut node = &mut self.root;
        for seg in path.segments() {
            node = node.children.entry(seg.clone()).or_default();
        }
        if let Some(existing) = &node.path {
            return existing.clone();
        }
        let interned = Arc::new(path);
        node.path = Some(interned.clone());
        self.len += 1;
        interned
    }

    /// The interned handle for `path`, if present.
    pub fn get(&self, path: &Path) -> Option<Arc<Path>> {
        let mut node = &self.root;
        for seg in path.segments() {
            node = node.children.get(seg)?;
        }
        node.path.clone()
    }

    /// All stored paths matching `pattern`.
    ///
    /// Matching is positional. Stored paths shorter than the pattern never
    /// match; stored paths longer than the pattern match when their prefix
    /// does and their length is at most `depth` (segments past the pattern
    /// are unconstrained).
    pub fn find(
        &self,
        pattern: &Path,
        superset: bool,
        subset: bool,
        depth: usize,
    ) -> Vec<Arc<Path>> {
        let depth = depth.max(pattern.len());
        let mut out = Vec::new();
        Self::walk(
            &self.root,
            pattern.segments(),
            0,
            superset,
            subset,
            depth,
            &mut out,
        );
        out
    }

    fn walk(
        node: &Node,
        pattern: &[Segment],
        pos: usize,
        superset: bool,
        subset: bool,
        depth: usize,
        out: &mut Vec<Arc<Path>>,
    ) {
        if pos >= pattern.len() {
            if let Some(p) = &node.path {
                out.push(p.clone());
            }
            if pos < depth {
                for child in node.children.values() {
                    Self::walk(child, pattern, pos + 1, superset, subset, depth, out);
                }
            }
            return;
        }
        let pat = &pattern[pos];
        for (seg, child) in &node.children {
            if segment_matches(pat, seg, superset, subset) {
                Self::walk(child, pattern, pos + 1, superset, subset, depth, out);
            }
        }
    }
}

/// Positional match between a pattern segment and a stored segment.
fn segment_matches(pat: &Segment, stored: &Segment, superset: bool, subset: bool) -> bool {
    if pat == stored {
        return true;
    }
    match (pat, stored) {
        (Segment::Wildcard, _) => subset,
        (_, Segment::Wildcard) => superset,
        (Segment::Alias(pat_pairs), Segment::Alias(stored_pairs)) => {
            // A smaller constraint set is the more general matcher.
            (superset && stored_pairs.iter().all(|p| pat_pairs.contains(p)))
                || (subset && pat_pairs.iter().all(|p| stored_pairs.contains(p)))
        }
        (Segment::Alias(_), _) => subset,
        (_, Segment::Alias(_)) => superset,
        _ => false,
    }
}
