//! Quorum replication coordinator: the node-side logic behind Put, Get, and
//! Delete.
//!
//! Any node coordinates any request. Writes assign one canonical clock (the
//! client's version context plus the coordinator's own increment; local
//! replica state is deliberately not merged in) and push it to every replica
//! verbatim, so all replicas store the identical clock for one logical
//! write. Reads fan out, reconcile the returned versions, surface siblings,
//! and hand divergent replicas to the read repairer without delaying the
//! response.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use tracing::debug;

use crate::clock::VectorClock;
use crate::convert::{clock_to_wire, value_from_wire};
use crate::node::NodeState;
use crate::quorum;
use crate::reconcile::reconcile;
use crate::store::VersionedValue;
use crate::volo_gen::nimbus::rpc;

/// What a coordinated read resolved to.
#[derive(Debug)]
pub enum GetOutcome {
    /// No replica returned a live value (or a tombstone won).
    NotFound,
    /// A single winning version.
    Value(VersionedValue),
    /// Concurrent siblings the client must resolve; the union of their
    /// clocks is the version context for the resolving write.
    Conflicts(Vec<VersionedValue>),
}

/// One replica's answer to a quorum read, with attribution.
struct ReplicaReply {
    replica_id: String,
    value: Option<VersionedValue>,
}

impl NodeState {
    /// Coordinate a client Put. Returns the clock the write was stored
    /// under; failure means the write quorum was not met.
    pub async fn coordinate_put(
        self: &Arc<Self>,
        key: &str,
        value: Bytes,
        consistency_w: u32,
        version_ctx: Option<VectorClock>,
        request_id: &str,
    ) -> anyhow::Result<VectorClock> {
        self.coordinate_write(key, value, consistency_w, version_ctx, request_id, false)
            .await
    }

    /// Coordinate a client Delete: a tombstone write through the same path.
    pub async fn coordinate_delete(
        self: &Arc<Self>,
        key: &str,
        consistency_w: u32,
        version_ctx: Option<VectorClock>,
        request_id: &str,
    ) -> anyhow::Result<VectorClock> {
        self.coordinate_write(
            key,
            Bytes::new(),
            consistency_w,
            version_ctx,
            request_id,
            true,
        )
        .await
    }

    async fn coordinate_write(
        self: &Arc<Self>,
        key: &str,
        value: Bytes,
        consistency_w: u32,
        version_ctx: Option<VectorClock>,
        request_id: &str,
        deleted: bool,
    ) -> anyhow::Result<VectorClock> {
        let required = self.effective_write_quorum(consistency_w);
        let ring = self.ring.snapshot();
        let replicas = ring.preference_list(key, self.replication_factor());
        if replicas.is_empty() {
            bail!("no replicas available");
        }

        // The coordinator's increment over the client's context is enough to
        // dominate every sibling the client saw.
        let mut version = version_ctx.unwrap_or_default();
        version.increment(&self.config.node_id);

        let replica_ids: Vec<String> = replicas.iter().map(|n| n.id.clone()).collect();
        let addr_by_id: Arc<HashMap<String, String>> = Arc::new(
            replicas
                .iter()
                .map(|n| (n.id.clone(), n.addr.clone()))
                .collect(),
        );

        let state = self.clone();
        let key_owned = key.to_string();
        let request_id = request_id.to_string();
        let write_version = version.clone();
        let op = move |replica_id: String| {
            let state = state.clone();
            let key = key_owned.clone();
            let value = value.clone();
            let version = write_version.clone();
            let request_id = request_id.clone();
            let addr_by_id = addr_by_id.clone();
            async move {
                if replica_id == state.config.node_id {
                    // Local replica: same exact-clock apply as remote ones.
                    state
                        .store
                        .put_repair(&key, &value, Some(&version), deleted)?;
                    return Ok(true);
                }

                let Some(addr) = addr_by_id.get(&replica_id) else {
                    bail!("replica {replica_id} has no address");
                };
                let req = rpc::ReplicaPutRequest {
                    key: key.clone().into(),
                    value,
                    version: Some(clock_to_wire(&version)),
                    coordinator_id: state.config.node_id.clone().into(),
                    request_id: request_id.into(),
                    deleted,
                    is_repair: false,
                };
                let resp = state.peers.replica_put(addr, req).await?;
                Ok(resp.status == rpc::ReplicaStatus::REPLICA_STATUS_SUCCESS)
            }
        };

        let outcome =
            quorum::do_write(&replica_ids, required, self.config.rpc_timeout, op).await;
        if !outcome.success {
            bail!(outcome
                .error
                .unwrap_or_else(|| "quorum write failed".to_string()));
        }
        debug!(
            key,
            acks = outcome.acks,
            required = outcome.required,
            deleted,
            "quorum write committed"
        );
        Ok(version)
    }

    /// Coordinate a client Get: quorum read, reconcile, trigger repair.
    pub async fn coordinate_get(
        self: &Arc<Self>,
        key: &str,
        consistency_r: u32,
        request_id: &str,
    ) -> anyhow::Result<GetOutcome> {
        let required = self.effective_read_quorum(consistency_r);
        let ring = self.ring.snapshot();
        let replicas = ring.preference_list(key, self.replication_factor());
        if replicas.is_empty() {
            bail!("no replicas available");
        }

        let replica_ids: Vec<String> = replicas.iter().map(|n| n.id.clone()).collect();
        let addr_by_id: Arc<HashMap<String, String>> = Arc::new(
            replicas
                .iter()
                .map(|n| (n.id.clone(), n.addr.clone()))
                .collect(),
        );

        let state = self.clone();
        let key_owned = key.to_string();
        let request_id = request_id.to_string();
        let op = {
            let addr_by_id = addr_by_id.clone();
            move |replica_id: String| {
                let state = state.clone();
                let key = key_owned.clone();
                let request_id = request_id.clone();
                let addr_by_id = addr_by_id.clone();
                async move {
                    if replica_id == state.config.node_id {
                        return Ok(ReplicaReply {
                            value: state.store.get(&key),
                            replica_id,
                        });
                    }

                    let Some(addr) = addr_by_id.get(&replica_id) else {
                        bail!("replica {replica_id} has no address");
                    };
                    let req = rpc::ReplicaGetRequest {
                        key: key.clone().into(),
                        coordinator_id: state.config.node_id.clone().into(),
                        request_id: request_id.into(),
                    };
                    let resp = state.peers.replica_get(addr, req).await?;
                    match resp.status {
                        s if s == rpc::ReplicaStatus::REPLICA_STATUS_SUCCESS => {
                            let Some(value) = resp.value.as_ref() else {
                                bail!("replica {replica_id} returned success without a value");
                            };
                            Ok(ReplicaReply {
                                value: Some(value_from_wire(value)),
                                replica_id,
                            })
                        }
                        s if s == rpc::ReplicaStatus::REPLICA_STATUS_NOT_FOUND => {
                            // "Not found" is a real response, not a failure.
                            Ok(ReplicaReply {
                                value: None,
                                replica_id,
                            })
                        }
                        _ => bail!("replica error: {}", resp.error_message),
                    }
                }
            }
        };

        let outcome = quorum::do_read(&replica_ids, required, self.config.rpc_timeout, op).await;
        if !outcome.success {
            bail!(outcome
                .error
                .unwrap_or_else(|| "quorum read failed".to_string()));
        }

        let mut replies: Vec<(String, VersionedValue)> = Vec::new();
        let mut empty_replicas: Vec<String> = Vec::new();
        for reply in outcome.values {
            match reply.value {
                Some(value) => replies.push((reply.replica_id, value)),
                None => empty_replicas.push(reply.replica_id),
            }
        }
        if replies.is_empty() {
            return Ok(GetOutcome::NotFound);
        }

        let recon = reconcile(&replies);
        let mut winners = recon.winners;
        let mut stale = recon.stale;

        // A replica that answered "not found" while others hold values is
        // behind (fresh restart, missed writes): schedule it for repair as
        // an implicit empty version. Its empty clock is Before any winner.
        for replica_id in empty_replicas {
            stale.entry(replica_id).or_insert_with(|| VersionedValue {
                value: Vec::new(),
                version: VectorClock::new(),
                deleted: false,
                expires_at: None,
            });
        }

        if !stale.is_empty() && !winners.is_empty() {
            // Repair writes go over the wire even to the local replica; the
            // loopback RPC keeps one code path for all targets.
            let addrs: HashMap<String, String> = replicas
                .iter()
                .map(|n| (n.id.clone(), n.addr.clone()))
                .collect();
            // Detached; must never delay the client response.
            self.repairer.repair(key, winners.clone(), stale, addrs);
        }

        match winners.len() {
            0 => Ok(GetOutcome::NotFound),
            1 => {
                let winner = winners.remove(0);
                if winner.deleted {
                    Ok(GetOutcome::NotFound)
                } else {
                    Ok(GetOutcome::Value(winner))
                }
            }
            _ => Ok(GetOutcome::Conflicts(winners)),
        }
    }
}
