//! Vector clocks: the causality primitive for versioned values.
//!
//! A clock maps node ids to monotonically increasing counters. A missing
//! entry is equivalent to a counter of zero, so clocks over different node
//! sets still compare cleanly. The representation is a small vector sorted
//! by node id; for cluster-sized clocks this beats a hash map and lets
//! `compare` walk both sides without allocating.

use std::fmt;

/// Causal relationship between two vector clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Causality {
    /// Every counter <= the other side, at least one strictly less.
    Before,
    /// Every counter >= the other side, at least one strictly greater.
    After,
    /// All counters match, including implicit zeros.
    Equal,
    /// Neither side dominates.
    Concurrent,
}

/// Vector clock over opaque node ids.
///
/// Entries are kept sorted by node id; counters are non-negative and only
/// move up through `increment`, `merge`, or an explicit `set` during wire
/// decoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VectorClock {
    entries: Vec<(String, i64)>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the clock has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of explicit entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Counter for `node_id`, zero when absent.
    pub fn get(&self, node_id: &str) -> i64 {
        match self
            .entries
            .binary_search_by(|(id, _)| id.as_str().cmp(node_id))
        {
            Ok(idx) => self.entries[idx].1,
            Err(_) => 0,
        }
    }

    /// Set the counter for `node_id`, inserting the entry if needed.
    pub fn set(&mut self, node_id: &str, counter: i64) {
        match self
            .entries
            .binary_search_by(|(id, _)| id.as_str().cmp(node_id))
        {
            Ok(idx) => self.entries[idx].1 = counter,
            Err(idx) => self.entries.insert(idx, (node_id.to_string(), counter)),
        }
    }

    /// Bump the counter for `node_id` by one.
    pub fn increment(&mut self, node_id: &str) {
        match self
            .entries
            .binary_search_by(|(id, _)| id.as_str().cmp(node_id))
        {
            Ok(idx) => self.entries[idx].1 += 1,
            Err(idx) => self.entries.insert(idx, (node_id.to_string(), 1)),
        }
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (id, counter) in &other.entries {
            if self.get(id) < *counter {
                self.set(id, *counter);
            }
        }
    }

    /// Compare against `other` under happens-before semantics.
    ///
    /// Walks both sorted entry lists in one pass; ids absent from a side
    /// count as zero there.
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut less = false;
        let mut greater = false;

        let (a, b) = (&self.entries, &other.entries);
        let (mut i, mut j) = (0usize, 0usize);
        while i < a.len() || j < b.len() {
            let (lhs, rhs) = if i >= a.len() {
                // Only the other side has this id.
                let out = (0, b[j].1);
                j += 1;
                out
            } else if j >= b.len() {
                let out = (a[i].1, 0);
                i += 1;
                out
            } else {
                match a[i].0.cmp(&b[j].0) {
                    std::cmp::Ordering::Less => {
                        let out = (a[i].1, 0);
                        i += 1;
                        out
                    }
                    std::cmp::Ordering::Greater => {
                        let out = (0, b[j].1);
                        j += 1;
                        out
                    }
                    std::cmp::Ordering::Equal => {
                        let out = (a[i].1, b[j].1);
                        i += 1;
                        j += 1;
                        out
                    }
                }
            };

            if lhs < rhs {
                less = true;
            } else if lhs > rhs {
                greater = true;
            }
            // Both directions observed: the clocks are concurrent.
            if less && greater {
                return Causality::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    /// True when `self` strictly dominates `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == Causality::After
    }

    /// Iterate entries in node-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(id, c)| (id.as_str(), *c))
    }
}

impl fmt::Display for VectorClock {
    /// Render as `{a:1, b:2}` with ids in sorted order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, (id, counter)) in self.entries.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}:{counter}")?;
        }
        write!(f, "}}")
    }
}
