//! gRPC service handlers for all three surfaces: the client-facing KvStore,
//! the coordinator-to-replica KvInternal, and Membership.
//!
//! Handlers translate wire messages into local types, delegate to the
//! coordinator / store / membership, and map failures per the error policy:
//! bad arguments answer in-band with an ERROR status, unmet quorums surface
//! as `Unavailable`.

use std::sync::Arc;

use tracing::debug;

use crate::convert::{
    clock_from_wire, clock_to_wire, members_from_wire, members_to_wire, unix_ms_now,
    value_to_wire,
};
use crate::coordinator::GetOutcome;
use crate::node::NodeState;
use crate::store::RepairOutcome;
use crate::volo_gen::nimbus::rpc;

/// Service implementation backed by the shared node state.
#[derive(Clone)]
pub struct RpcService {
    pub state: Arc<NodeState>,
}

impl rpc::KvStore for RpcService {
    /// Coordinate a client Put.
    async fn put(
        &self,
        req: volo_grpc::Request<rpc::PutRequest>,
    ) -> Result<volo_grpc::Response<rpc::PutResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        debug!(
            key = %req.key,
            client_id = %req.client_id,
            request_id = %req.request_id,
            "put request"
        );

        if req.key.is_empty() {
            return Ok(volo_grpc::Response::new(rpc::PutResponse {
                status: rpc::PutStatus::PUT_STATUS_ERROR,
                version: None,
                error_message: "key cannot be empty".to_string().into(),
            }));
        }

        let version_ctx = clock_from_wire(req.version.as_ref());
        match self
            .state
            .coordinate_put(
                &req.key,
                req.value,
                req.consistency_w,
                version_ctx,
                &req.request_id,
            )
            .await
        {
            Ok(version) => Ok(volo_grpc::Response::new(rpc::PutResponse {
                status: rpc::PutStatus::PUT_STATUS_SUCCESS,
                version: Some(clock_to_wire(&version)),
                error_message: Default::default(),
            })),
            Err(err) => Err(volo_grpc::Status::unavailable(err.to_string())),
        }
    }

    /// Coordinate a client Get.
    async fn get(
        &self,
        req: volo_grpc::Request<rpc::GetRequest>,
    ) -> Result<volo_grpc::Response<rpc::GetResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        debug!(
            key = %req.key,
            client_id = %req.client_id,
            request_id = %req.request_id,
            "get request"
        );

        if req.key.is_empty() {
            return Ok(volo_grpc::Response::new(rpc::GetResponse {
                status: rpc::GetStatus::GET_STATUS_ERROR,
                value: None,
                conflicts: Vec::new(),
                error_message: "key cannot be empty".to_string().into(),
            }));
        }

        match self
            .state
            .coordinate_get(&req.key, req.consistency_r, &req.request_id)
            .await
        {
            Ok(GetOutcome::NotFound) => Ok(volo_grpc::Response::new(rpc::GetResponse {
                status: rpc::GetStatus::GET_STATUS_NOT_FOUND,
                value: None,
                conflicts: Vec::new(),
                error_message: Default::default(),
            })),
            Ok(GetOutcome::Value(vv)) => Ok(volo_grpc::Response::new(rpc::GetResponse {
                status: rpc::GetStatus::GET_STATUS_SUCCESS,
                value: Some(value_to_wire(&vv)),
                conflicts: Vec::new(),
                error_message: Default::default(),
            })),
            Ok(GetOutcome::Conflicts(winners)) => {
                Ok(volo_grpc::Response::new(rpc::GetResponse {
                    status: rpc::GetStatus::GET_STATUS_SUCCESS,
                    value: None,
                    conflicts: winners.iter().map(value_to_wire).collect(),
                    error_message: Default::default(),
                }))
            }
            Err(err) => Err(volo_grpc::Status::unavailable(err.to_string())),
        }
    }

    /// Coordinate a client Delete.
    async fn delete(
        &self,
        req: volo_grpc::Request<rpc::DeleteRequest>,
    ) -> Result<volo_grpc::Response<rpc::DeleteResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        debug!(
            key = %req.key,
            client_id = %req.client_id,
            request_id = %req.request_id,
            "delete request"
        );

        if req.key.is_empty() {
            return Ok(volo_grpc::Response::new(rpc::DeleteResponse {
                status: rpc::DeleteStatus::DELETE_STATUS_ERROR,
                version: None,
                error_message: "key cannot be empty".to_string().into(),
            }));
        }

        let version_ctx = clock_from_wire(req.version.as_ref());
        match self
            .state
            .coordinate_delete(&req.key, req.consistency_w, version_ctx, &req.request_id)
            .await
        {
            Ok(version) => Ok(volo_grpc::Response::new(rpc::DeleteResponse {
                status: rpc::DeleteStatus::DELETE_STATUS_SUCCESS,
                version: Some(clock_to_wire(&version)),
                error_message: Default::default(),
            })),
            Err(err) => Err(volo_grpc::Status::unavailable(err.to_string())),
        }
    }
}

impl rpc::KvInternal for RpcService {
    /// Apply a coordinator-assigned write at this replica.
    ///
    /// Both normal and repair writes go through the exact-clock path: the
    /// clock is stored verbatim (never incremented here) and a Before or
    /// Concurrent incoming clock leaves the local copy untouched.
    async fn replica_put(
        &self,
        req: volo_grpc::Request<rpc::ReplicaPutRequest>,
    ) -> Result<volo_grpc::Response<rpc::ReplicaPutResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        debug!(
            key = %req.key,
            coordinator = %req.coordinator_id,
            request_id = %req.request_id,
            is_repair = req.is_repair,
            "replica put"
        );

        if req.key.is_empty() {
            return Ok(volo_grpc::Response::new(rpc::ReplicaPutResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_ERROR,
                error_message: "key cannot be empty".to_string().into(),
            }));
        }

        let Some(version) = clock_from_wire(req.version.as_ref()) else {
            return Ok(volo_grpc::Response::new(rpc::ReplicaPutResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_ERROR,
                error_message: "version is required".to_string().into(),
            }));
        };

        match self
            .state
            .store
            .put_repair(&req.key, &req.value, Some(&version), req.deleted)
        {
            Ok(outcome) => {
                if outcome == RepairOutcome::Skipped {
                    debug!(key = %req.key, "incoming version not dominant, kept local copy");
                }
                Ok(volo_grpc::Response::new(rpc::ReplicaPutResponse {
                    status: rpc::ReplicaStatus::REPLICA_STATUS_SUCCESS,
                    error_message: Default::default(),
                }))
            }
            Err(err) => Ok(volo_grpc::Response::new(rpc::ReplicaPutResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_ERROR,
                error_message: err.to_string().into(),
            })),
        }
    }

    /// Serve this replica's current version of a key.
    async fn replica_get(
        &self,
        req: volo_grpc::Request<rpc::ReplicaGetRequest>,
    ) -> Result<volo_grpc::Response<rpc::ReplicaGetResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        debug!(
            key = %req.key,
            coordinator = %req.coordinator_id,
            request_id = %req.request_id,
            "replica get"
        );

        if req.key.is_empty() {
            return Ok(volo_grpc::Response::new(rpc::ReplicaGetResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_ERROR,
                value: None,
                error_message: "key cannot be empty".to_string().into(),
            }));
        }

        match self.state.store.get(&req.key) {
            Some(vv) => Ok(volo_grpc::Response::new(rpc::ReplicaGetResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_SUCCESS,
                value: Some(value_to_wire(&vv)),
                error_message: Default::default(),
            })),
            None => Ok(volo_grpc::Response::new(rpc::ReplicaGetResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_NOT_FOUND,
                value: None,
                error_message: Default::default(),
            })),
        }
    }

    /// Apply a coordinator-assigned tombstone; equivalent to `replica_put`
    /// with `deleted` set.
    async fn replica_delete(
        &self,
        req: volo_grpc::Request<rpc::ReplicaDeleteRequest>,
    ) -> Result<volo_grpc::Response<rpc::ReplicaDeleteResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        debug!(
            key = %req.key,
            coordinator = %req.coordinator_id,
            request_id = %req.request_id,
            "replica delete"
        );

        if req.key.is_empty() {
            return Ok(volo_grpc::Response::new(rpc::ReplicaDeleteResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_ERROR,
                error_message: "key cannot be empty".to_string().into(),
            }));
        }

        let Some(version) = clock_from_wire(req.version.as_ref()) else {
            return Ok(volo_grpc::Response::new(rpc::ReplicaDeleteResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_ERROR,
                error_message: "version is required".to_string().into(),
            }));
        };

        match self
            .state
            .store
            .put_repair(&req.key, &[], Some(&version), true)
        {
            Ok(_) => Ok(volo_grpc::Response::new(rpc::ReplicaDeleteResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_SUCCESS,
                error_message: Default::default(),
            })),
            Err(err) => Ok(volo_grpc::Response::new(rpc::ReplicaDeleteResponse {
                status: rpc::ReplicaStatus::REPLICA_STATUS_ERROR,
                error_message: err.to_string().into(),
            })),
        }
    }
}

impl rpc::Membership for RpcService {
    /// Failure-detection ping. The sender is marked alive and both sides
    /// trade snapshots, making ping the primary anti-entropy channel.
    async fn ping(
        &self,
        req: volo_grpc::Request<rpc::PingRequest>,
    ) -> Result<volo_grpc::Response<rpc::PingResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        self.state.membership.mark_alive(&req.from_id);
        if !req.membership.is_empty() {
            self.state
                .membership
                .apply_gossip(members_from_wire(&req.membership));
        }

        Ok(volo_grpc::Response::new(rpc::PingResponse {
            responder_id: self.state.config.node_id.clone().into(),
            timestamp_ms: unix_ms_now(),
            membership: members_to_wire(&self.state.membership.snapshot()),
        }))
    }

    /// Merge a peer's snapshot and answer with our own.
    async fn gossip(
        &self,
        req: volo_grpc::Request<rpc::GossipRequest>,
    ) -> Result<volo_grpc::Response<rpc::GossipResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        debug!(
            from = %req.from_id,
            members = req.membership.len(),
            "gossip received"
        );
        self.state
            .membership
            .apply_gossip(members_from_wire(&req.membership));

        Ok(volo_grpc::Response::new(rpc::GossipResponse {
            responder_id: self.state.config.node_id.clone().into(),
            membership: members_to_wire(&self.state.membership.snapshot()),
        }))
    }

    /// Introspection: the full member table.
    async fn get_membership(
        &self,
        _req: volo_grpc::Request<rpc::GetMembershipRequest>,
    ) -> Result<volo_grpc::Response<rpc::GetMembershipResponse>, volo_grpc::Status> {
        Ok(volo_grpc::Response::new(rpc::GetMembershipResponse {
            members: members_to_wire(&self.state.membership.snapshot()),
            local_node_id: self.state.config.node_id.clone().into(),
        }))
    }

    /// Introspection: placement for a key on the current ring.
    async fn get_ring(
        &self,
        req: volo_grpc::Request<rpc::GetRingRequest>,
    ) -> Result<volo_grpc::Response<rpc::GetRingResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        let ring = self.state.ring.snapshot();
        let alive_members = self.state.membership.alive_count() as i32;
        let replication_factor = self.state.replication_factor() as i32;

        let mut resp = rpc::GetRingResponse {
            owner_id: Default::default(),
            owner_addr: Default::default(),
            replica_ids: Vec::new(),
            replica_addrs: Vec::new(),
            alive_members,
            replication_factor,
        };

        if !req.key.is_empty() {
            if let Some(owner) = ring.owner(&req.key) {
                resp.owner_id = owner.id.clone().into();
                resp.owner_addr = owner.addr.clone().into();
                for replica in ring.preference_list(&req.key, self.state.replication_factor()) {
                    resp.replica_ids.push(replica.id.into());
                    resp.replica_addrs.push(replica.addr.into());
                }
            }
        }

        Ok(volo_grpc::Response::new(resp))
    }

    /// Operability: DEGRADED below two alive members.
    async fn health(
        &self,
        _req: volo_grpc::Request<rpc::HealthRequest>,
    ) -> Result<volo_grpc::Response<rpc::HealthResponse>, volo_grpc::Status> {
        let status = if self.state.membership.alive_count() < 2 {
            rpc::HealthStatus::HEALTH_STATUS_DEGRADED
        } else {
            rpc::HealthStatus::HEALTH_STATUS_OK
        };

        Ok(volo_grpc::Response::new(rpc::HealthResponse {
            status,
            node_id: self.state.config.node_id.clone().into(),
            uptime_seconds: self.state.started_at.elapsed().as_secs(),
            message: "operational".to_string().into(),
        }))
    }
}
