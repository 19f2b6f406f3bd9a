//! Node state and process bootstrap.
//!
//! Wires the store, ring, peer pool, membership, and read repairer together
//! and hosts the gRPC server for all three service surfaces.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::{error, info};

use crate::config::NodeConfig;
use crate::membership::{Membership, MembershipTransport};
use crate::repair::ReadRepairer;
use crate::ring::RingHandle;
use crate::rpc_service::RpcService;
use crate::store::LocalStore;
use crate::transport::PeerPool;
use crate::volo_gen::nimbus::rpc;

/// Shared state backing every RPC handler on this node.
pub struct NodeState {
    pub config: NodeConfig,
    pub store: LocalStore,
    pub ring: Arc<RingHandle>,
    pub peers: Arc<PeerPool>,
    pub membership: Arc<Membership>,
    pub repairer: Arc<ReadRepairer>,
    pub started_at: Instant,
}

impl NodeState {
    /// Assemble node state from configuration.
    ///
    /// The initial ring optimistically contains self plus all configured
    /// peers; gossip replaces that view as soon as real liveness data
    /// arrives.
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let store = LocalStore::new(config.node_id.clone());
        let ring = Arc::new(RingHandle::new(
            config.vnodes_per_node,
            &config.ring_nodes(),
        ));
        let peers = Arc::new(PeerPool::new(config.rpc_timeout));

        let membership = Arc::new(Membership::new(
            config.node_id.clone(),
            config.listen.to_string(),
            config.probe_interval,
            config.gossip_interval,
            config.suspect_timeout,
            config.dead_timeout,
        ));
        membership.add_seeds(&config.seed_nodes());

        // Membership changes swap in a fresh ring built from the alive set.
        {
            let ring = ring.clone();
            let node_id = config.node_id.clone();
            membership.set_on_change(move |alive| {
                info!(
                    node = %node_id,
                    alive = alive.len(),
                    "membership changed, rebuilding ring"
                );
                ring.rebuild(&alive);
            });
        }

        let repairer = Arc::new(ReadRepairer::new(peers.clone(), config.repair_timeout));

        Arc::new(Self {
            config,
            store,
            ring,
            peers,
            membership,
            repairer,
            started_at: Instant::now(),
        })
    }

    /// Replication factor, defaulting to 3 when unset.
    pub fn replication_factor(&self) -> usize {
        if self.config.replication_factor == 0 {
            3
        } else {
            self.config.replication_factor
        }
    }

    /// Effective read quorum: the request's value when positive, else the
    /// node default.
    pub fn effective_read_quorum(&self, requested: u32) -> usize {
        if requested > 0 {
            requested as usize
        } else {
            self.config.read_quorum
        }
    }

    /// Effective write quorum: the request's value when positive, else the
    /// node default.
    pub fn effective_write_quorum(&self, requested: u32) -> usize {
        if requested > 0 {
            requested as usize
        } else {
            self.config.write_quorum
        }
    }
}

/// Run a node until ctrl-c.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let listen = config.listen;
    let state = NodeState::new(config);

    let transport: Arc<dyn MembershipTransport> = state.peers.clone();
    state.membership.start(transport);

    info!(
        node = %state.config.node_id,
        listen = %listen,
        rf = state.replication_factor(),
        r = state.config.read_quorum,
        w = state.config.write_quorum,
        vnodes = state.config.vnodes_per_node,
        peers = state.config.peers.len(),
        "node starting"
    );

    let service = RpcService {
        state: state.clone(),
    };

    let server = {
        let service = service.clone();
        async move {
            let kv = rpc::KvStoreServer::new(service.clone());
            let kv = volo_grpc::server::ServiceBuilder::new(kv)
                .build::<rpc::KvStoreRequestRecv, rpc::KvStoreResponseSend>();
            let internal = rpc::KvInternalServer::new(service.clone());
            let internal = volo_grpc::server::ServiceBuilder::new(internal)
                .build::<rpc::KvInternalRequestRecv, rpc::KvInternalResponseSend>();
            let membership = rpc::MembershipServer::new(service);
            let membership = volo_grpc::server::ServiceBuilder::new(membership)
                .build::<rpc::MembershipRequestRecv, rpc::MembershipResponseSend>();

            volo_grpc::server::Server::new()
                .add_service(kv)
                .add_service(internal)
                .add_service(membership)
                .run(volo::net::Address::from(listen))
                .await
        }
    };

    tokio::select! {
        result = server => {
            if let Err(err) = result {
                error!(error = ?err, "gRPC server failed");
                anyhow::bail!("gRPC server failed: {err}");
            }
            Ok(())
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!(node = %state.config.node_id, "shutting down");
            Ok(())
        }
    }
}
