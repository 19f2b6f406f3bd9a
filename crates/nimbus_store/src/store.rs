//! Local key/value storage with vector-clock versions and tombstones.
//!
//! The store is a leaf in the lock order: a single `RwLock` over the map,
//! short critical sections, and every returned value is a copy so callers
//! never hold the lock.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use anyhow::bail;

use crate::clock::{Causality, VectorClock};

/// A value together with its causal metadata.
///
/// A tombstone (`deleted = true`) carries empty bytes but keeps its clock so
/// it can dominate, be dominated by, or run concurrent with live values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: VectorClock,
    pub deleted: bool,
    pub expires_at: Option<SystemTime>,
}

impl VersionedValue {
    /// True when the wall-clock expiry has passed.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(deadline) => SystemTime::now() > deadline,
            None => false,
        }
    }

    /// True when this entry is a deletion tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

/// Outcome of an exact-version repair write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The incoming version dominated (or equalled) the stored one and was
    /// written.
    Applied,
    /// The incoming version was Before or Concurrent; the local copy wins.
    Skipped,
}

/// Thread-safe in-memory store, one versioned value per key.
pub struct LocalStore {
    node_id: String,
    data: RwLock<HashMap<String, VersionedValue>>,
}

impl LocalStore {
    /// Create an empty store owned by `node_id`.
    ///
    /// The node id is the counter this store bumps on non-repair writes.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Read a key. Absent and expired entries both read as `None`.
    ///
    /// Expired entries are removed opportunistically with `try_write` so a
    /// reader never blocks on cleanup; a contended lock just defers removal
    /// to a later call.
    pub fn get(&self, key: &str) -> Option<VersionedValue> {
        let expired = {
            let data = self.data.read().expect("store lock poisoned");
            match data.get(key) {
                None => return None,
                Some(vv) if vv.is_expired() => true,
                Some(vv) => return Some(vv.clone()),
            }
        };

        if expired {
            if let Ok(mut data) = self.data.try_write() {
                // Re-check under the write lock; a racing put may have
                // replaced the entry.
                if data.get(key).map(VersionedValue::is_expired) == Some(true) {
                    data.remove(key);
                }
            }
        }
        None
    }

    /// Write a key, producing a new version.
    ///
    /// The new clock is the incoming context (empty when `None`) merged with
    /// any live existing clock, then incremented for this node. With
    /// `deleted` set the bytes are discarded and a tombstone is stored.
    /// Returns a copy of the stored clock.
    pub fn put(
        &self,
        key: &str,
        value: &[u8],
        version: Option<&VectorClock>,
        deleted: bool,
    ) -> VectorClock {
        let mut data = self.data.write().expect("store lock poisoned");

        let mut new_version = version.cloned().unwrap_or_default();
        if let Some(existing) = data.get(key) {
            if !existing.is_expired() {
                new_version.merge(&existing.version);
            }
        }
        new_version.increment(&self.node_id);

        let stored = VersionedValue {
            value: if deleted { Vec::new() } else { value.to_vec() },
            version: new_version.clone(),
            deleted,
            expires_at: None,
        };
        data.insert(key.to_string(), stored);
        new_version
    }

    /// Write a key with an exact version and no local increment.
    ///
    /// Used by coordinated replica writes and read repair: the write is
    /// applied only when the incoming clock is After or Equal the stored
    /// one, so a racing newer write is never erased. Before/Concurrent
    /// incoming clocks are skipped silently.
    pub fn put_repair(
        &self,
        key: &str,
        value: &[u8],
        version: Option<&VectorClock>,
        deleted: bool,
    ) -> anyhow::Result<RepairOutcome> {
        let Some(version) = version else {
            bail!("repair write requires a version");
        };

        let mut data = self.data.write().expect("store lock poisoned");

        if let Some(existing) = data.get(key) {
            if !existing.is_expired() {
                match version.compare(&existing.version) {
                    Causality::After | Causality::Equal => {}
                    Causality::Before | Causality::Concurrent => {
                        return Ok(RepairOutcome::Skipped);
                    }
                }
            }
        }

        let stored = VersionedValue {
            value: if deleted { Vec::new() } else { value.to_vec() },
            version: version.clone(),
            deleted,
            expires_at: None,
        };
        data.insert(key.to_string(), stored);
        Ok(RepairOutcome::Applied)
    }

    /// Delete a key by writing a tombstone; equivalent to a tombstone `put`.
    pub fn delete(&self, key: &str, version: Option<&VectorClock>) -> VectorClock {
        self.put(key, &[], version, true)
    }

    /// Number of live entries, tombstones included.
    pub fn len(&self) -> usize {
        self.data.read().expect("store lock poisoned").len()
    }

    /// True when the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn insert_raw(&self, key: &str, vv: VersionedValue) {
        self.data
            .write()
            .expect("store lock poisoned")
            .insert(key.to_string(), vv);
    }
}
