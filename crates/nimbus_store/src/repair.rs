//! Asynchronous read repair.
//!
//! After a quorum read discovers divergence, the repairer pushes the winning
//! version to every stale replica. It is strictly fire-and-forget: detached
//! from the client request's deadline, no retries, failures only visible in
//! logs and counters. The replica side applies the write through its
//! exact-version path, so repair can never erase a causally newer value that
//! raced with the read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::convert::{clock_to_wire, unix_ms_now};
use crate::store::VersionedValue;
use crate::transport::PeerPool;
use crate::volo_gen::nimbus::rpc;

/// Coordinator id stamped on repair writes.
const REPAIR_COORDINATOR_ID: &str = "read-repair";

/// Default deadline for one repair write.
pub const DEFAULT_REPAIR_TIMEOUT: Duration = Duration::from_secs(2);

/// Fire-and-forget convergence writer.
pub struct ReadRepairer {
    peers: Arc<PeerPool>,
    timeout: Duration,
    repaired: AtomicU64,
    failed: AtomicU64,
}

impl ReadRepairer {
    /// Create a repairer issuing writes through `peers` with a per-write
    /// `timeout` (zero falls back to the default).
    pub fn new(peers: Arc<PeerPool>, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_REPAIR_TIMEOUT
        } else {
            timeout
        };
        Self {
            peers,
            timeout,
            repaired: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Repair `stale` replicas with the first winner. Returns immediately;
    /// the writes happen on a detached task with a fresh deadline.
    ///
    /// Only the first winner is written. With multiple concurrent winners
    /// full sibling convergence would need replicas that store sibling sets,
    /// which this store does not do; the skipped siblings surface again on
    /// the next conflicting read.
    pub fn repair(
        self: &Arc<Self>,
        key: &str,
        winners: Vec<VersionedValue>,
        stale: HashMap<String, VersionedValue>,
        addr_by_replica: HashMap<String, String>,
    ) {
        if stale.is_empty() {
            return;
        }
        let Some(winner) = winners.into_iter().next() else {
            return;
        };

        let repairer = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            info!(
                key = %key,
                stale = stale.len(),
                "read repair triggered"
            );

            let mut repaired = 0u64;
            let mut failed = 0u64;
            for replica_id in stale.into_keys() {
                let Some(addr) = addr_by_replica.get(&replica_id) else {
                    debug!(key = %key, replica = %replica_id, "skipping repair, no address");
                    continue;
                };

                let req = rpc::ReplicaPutRequest {
                    key: key.clone().into(),
                    value: winner.value.clone().into(),
                    version: Some(clock_to_wire(&winner.version)),
                    coordinator_id: REPAIR_COORDINATOR_ID.to_string().into(),
                    request_id: format!("repair-{}", unix_ms_now()).into(),
                    deleted: winner.deleted,
                    is_repair: true,
                };

                match repairer
                    .peers
                    .replica_put_with_deadline(addr, req, repairer.timeout)
                    .await
                {
                    Ok(resp) if resp.status == rpc::ReplicaStatus::REPLICA_STATUS_SUCCESS => {
                        repaired += 1;
                    }
                    Ok(resp) => {
                        warn!(
                            key = %key,
                            replica = %replica_id,
                            error = %resp.error_message,
                            "read repair rejected by replica"
                        );
                        failed += 1;
                    }
                    Err(err) => {
                        warn!(
                            key = %key,
                            replica = %replica_id,
                            error = %err,
                            "read repair write failed"
                        );
                        failed += 1;
                    }
                }
            }

            repairer.repaired.fetch_add(repaired, Ordering::Relaxed);
            repairer.failed.fetch_add(failed, Ordering::Relaxed);
            info!(key = %key, repaired, failed, "read repair completed");
        });
    }

    /// (repaired, failed) write counters since startup.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.repaired.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}
