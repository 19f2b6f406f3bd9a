//! gRPC peer transport: lazily-built clients, one logical client per peer
//! address, reused across requests.
//!
//! Every call runs under a deadline; transport failures surface as `anyhow`
//! errors that the quorum engine and membership loops absorb into counts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::time;

use crate::convert::{members_from_wire, members_to_wire, unix_ms_now};
use crate::membership::{Member, MembershipTransport};
use crate::volo_gen::nimbus::rpc;

/// Cached clients for one peer address.
#[derive(Clone)]
struct PeerClients {
    internal: rpc::KvInternalClient,
    membership: rpc::MembershipClient,
}

/// Connection pool over all peers, keyed by `host:port`.
pub struct PeerPool {
    rpc_timeout: Duration,
    clients: Mutex<HashMap<String, PeerClients>>,
}

impl PeerPool {
    /// Create a pool whose calls run under `rpc_timeout`.
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            rpc_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or build the clients for `addr`.
    fn clients(&self, addr: &str) -> anyhow::Result<PeerClients> {
        {
            let clients = self.clients.lock().expect("peer pool lock poisoned");
            if let Some(existing) = clients.get(addr) {
                return Ok(existing.clone());
            }
        }

        let socket: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid peer address {addr:?}"))?;
        let internal = rpc::KvInternalClientBuilder::new("nimbus.rpc.KvInternal")
            .address(volo::net::Address::from(socket))
            .build();
        let membership = rpc::MembershipClientBuilder::new("nimbus.rpc.Membership")
            .address(volo::net::Address::from(socket))
            .build();
        let built = PeerClients {
            internal,
            membership,
        };

        let mut clients = self.clients.lock().expect("peer pool lock poisoned");
        // A racing caller may have built the same clients; last write wins.
        clients.insert(addr.to_string(), built.clone());
        Ok(built)
    }

    /// Send a replica write under the pool deadline.
    pub async fn replica_put(
        &self,
        addr: &str,
        req: rpc::ReplicaPutRequest,
    ) -> anyhow::Result<rpc::ReplicaPutResponse> {
        self.replica_put_with_deadline(addr, req, self.rpc_timeout)
            .await
    }

    /// Send a replica write under an explicit deadline (read repair uses its
    /// own, detached from the client request).
    pub async fn replica_put_with_deadline(
        &self,
        addr: &str,
        req: rpc::ReplicaPutRequest,
        deadline: Duration,
    ) -> anyhow::Result<rpc::ReplicaPutResponse> {
        let clients = self.clients(addr)?;
        match time::timeout(deadline, clients.internal.replica_put(req)).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(err)) => Err(anyhow::anyhow!("replica_put rpc failed: {err}")),
            Err(_) => Err(anyhow::anyhow!("replica_put rpc timed out")),
        }
    }

    /// Fetch a replica's current versioned value.
    pub async fn replica_get(
        &self,
        addr: &str,
        req: rpc::ReplicaGetRequest,
    ) -> anyhow::Result<rpc::ReplicaGetResponse> {
        let clients = self.clients(addr)?;
        match time::timeout(self.rpc_timeout, clients.internal.replica_get(req)).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(err)) => Err(anyhow::anyhow!("replica_get rpc failed: {err}")),
            Err(_) => Err(anyhow::anyhow!("replica_get rpc timed out")),
        }
    }

    /// Send a replica delete under the pool deadline.
    pub async fn replica_delete(
        &self,
        addr: &str,
        req: rpc::ReplicaDeleteRequest,
    ) -> anyhow::Result<rpc::ReplicaDeleteResponse> {
        let clients = self.clients(addr)?;
        match time::timeout(self.rpc_timeout, clients.internal.replica_delete(req)).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(err)) => Err(anyhow::anyhow!("replica_delete rpc failed: {err}")),
            Err(_) => Err(anyhow::anyhow!("replica_delete rpc timed out")),
        }
    }
}

#[async_trait]
impl MembershipTransport for PeerPool {
    /// Failure-detection ping; the reply snapshot feeds anti-entropy.
    async fn ping(
        &self,
        addr: &str,
        from_id: &str,
        snapshot: Vec<Member>,
    ) -> anyhow::Result<Vec<Member>> {
        let clients = self.clients(addr)?;
        let req = rpc::PingRequest {
            from_id: from_id.to_string().into(),
            timestamp_ms: unix_ms_now(),
            membership: members_to_wire(&snapshot),
        };
        match time::timeout(self.rpc_timeout, clients.membership.ping(req)).await {
            Ok(Ok(resp)) => Ok(members_from_wire(&resp.into_inner().membership)),
            Ok(Err(err)) => Err(anyhow::anyhow!("ping rpc failed: {err}")),
            Err(_) => Err(anyhow::anyhow!("ping rpc timed out")),
        }
    }

    /// Full-snapshot gossip exchange.
    async fn gossip(
        &self,
        addr: &str,
        from_id: &str,
        snapshot: Vec<Member>,
    ) -> anyhow::Result<Vec<Member>> {
        let clients = self.clients(addr)?;
        let req = rpc::GossipRequest {
            from_id: from_id.to_string().into(),
            membership: members_to_wire(&snapshot),
        };
        match time::timeout(self.rpc_timeout, clients.membership.gossip(req)).await {
            Ok(Ok(resp)) => Ok(members_from_wire(&resp.into_inner().membership)),
            Ok(Err(err)) => Err(anyhow::anyhow!("gossip rpc failed: {err}")),
            Err(_) => Err(anyhow::anyhow!("gossip rpc timed out")),
        }
    }
}
