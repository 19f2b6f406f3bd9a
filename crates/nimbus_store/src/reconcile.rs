//! Version reconciliation: computing the maximal set over replica replies.
//!
//! Given the versioned values a quorum read collected, the reconciler splits
//! them into winners (versions no other reply strictly dominates, deduplicated
//! by Equal clocks) and stale entries (dominated versions, keyed by the
//! replica that returned them). Tombstones take part like any other version.

use std::collections::HashMap;

use crate::clock::Causality;
use crate::store::VersionedValue;

/// Result of reconciling a set of replica replies.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Non-dominated versions. One entry means the read resolved cleanly;
    /// several mean concurrent siblings the client must resolve.
    pub winners: Vec<VersionedValue>,
    /// Replica id -> the dominated version that replica returned.
    pub stale: HashMap<String, VersionedValue>,
}

impl ReconcileOutcome {
    /// Exactly one winner.
    pub fn is_resolved(&self) -> bool {
        self.winners.len() == 1
    }

    /// Two or more concurrent winners.
    pub fn has_conflict(&self) -> bool {
        self.winners.len() > 1
    }

    /// No winners at all; only possible for empty input.
    pub fn is_not_found(&self) -> bool {
        self.winners.is_empty()
    }
}

/// Compute the maximal set of `replies`, attributing stale versions to the
/// replica that served them.
pub fn reconcile(replies: &[(String, VersionedValue)]) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    for (idx, (replica_id, candidate)) in replies.iter().enumerate() {
        let dominated = replies.iter().enumerate().any(|(other_idx, (_, other))| {
            other_idx != idx && candidate.version.compare(&other.version) == Causality::Before
        });

        if dominated {
            outcome.stale.insert(replica_id.clone(), candidate.clone());
            continue;
        }

        // Equal clocks describe the same logical write; keep one sibling.
        let duplicate = outcome
            .winners
            .iter()
            .any(|winner| candidate.version.compare(&winner.version) == Causality::Equal);
        if !duplicate {
            outcome.winners.push(candidate.clone());
        }
    }

    outcome
}
