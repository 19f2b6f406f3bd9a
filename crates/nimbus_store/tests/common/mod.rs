#![allow(dead_code)]
//! Shared helpers for integration tests: spawn real node processes and talk
//! to them over gRPC.

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nimbus_store::volo_gen::nimbus::rpc;

/// Timeout for node startup.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

/// Gossip/quorum knobs for a spawned cluster. Defaults are tightened from
/// the production values so failure-detection tests finish quickly.
#[derive(Clone, Debug)]
pub struct ClusterSpec {
    pub rf: usize,
    pub r: usize,
    pub w: usize,
    pub probe_interval_ms: u64,
    pub gossip_interval_ms: u64,
    pub suspect_timeout_ms: u64,
    pub dead_timeout_ms: u64,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            rf: 3,
            r: 2,
            w: 2,
            probe_interval_ms: 200,
            gossip_interval_ms: 300,
            suspect_timeout_ms: 1000,
            dead_timeout_ms: 2000,
        }
    }
}

/// One spawned node process with captured logs.
pub struct NodeProcess {
    pub id: String,
    pub addr: SocketAddr,
    child: Child,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl NodeProcess {
    /// Best-effort read of the captured stderr log.
    pub fn read_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }

    /// Best-effort read of the captured stdout log.
    pub fn read_stdout(&self) -> String {
        std::fs::read_to_string(&self.stdout_path).unwrap_or_default()
    }

    /// Hard-kill the node, simulating a crash.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Panic if the process exited already.
    pub fn assert_running(&mut self, context: &str) {
        if let Ok(Some(status)) = self.child.try_wait() {
            let stdout = self.read_stdout();
            let stderr = self.read_stderr();
            panic!(
                "nimbus-store exited early ({context}) with status {status}\nstdout:\n{stdout}\nstderr:\n{stderr}"
            );
        }
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// A spawned multi-node cluster.
pub struct TestCluster {
    pub nodes: Vec<Option<NodeProcess>>,
    ids: Vec<String>,
    addrs: Vec<SocketAddr>,
    spec: ClusterSpec,
    log_root: PathBuf,
}

impl TestCluster {
    /// Spawn `n` nodes that all know each other as peers, and wait until
    /// every one of them answers health checks.
    pub async fn spawn(n: usize, spec: ClusterSpec) -> Self {
        let addrs: Vec<SocketAddr> = (0..n).map(|_| free_port()).collect();
        let ids: Vec<String> = (1..=n).map(|i| format!("n{i}")).collect();
        let log_root = std::env::temp_dir().join(format!(
            "nimbus-it-{}-{}",
            std::process::id(),
            addrs[0].port()
        ));
        std::fs::create_dir_all(&log_root).expect("create log dir");

        let mut cluster = Self {
            nodes: Vec::with_capacity(n),
            ids,
            addrs,
            spec,
            log_root,
        };
        for idx in 0..n {
            let node = cluster.spawn_one(idx);
            cluster.nodes.push(Some(node));
        }
        for idx in 0..n {
            cluster.wait_healthy(idx).await;
        }
        cluster
    }

    /// gRPC address of node `idx`.
    pub fn addr(&self, idx: usize) -> SocketAddr {
        self.addrs[idx]
    }

    /// Node id of node `idx` (`n1`, `n2`, ...).
    pub fn id(&self, idx: usize) -> &str {
        &self.ids[idx]
    }

    /// Kill node `idx`, simulating a crash.
    pub fn kill(&mut self, idx: usize) {
        if let Some(mut node) = self.nodes[idx].take() {
            node.kill();
        }
    }

    /// Restart node `idx` with the same id, address, and peer list.
    pub async fn restart(&mut self, idx: usize) {
        self.kill(idx);
        let node = self.spawn_one(idx);
        self.nodes[idx] = Some(node);
        self.wait_healthy(idx).await;
    }

    fn spawn_one(&self, idx: usize) -> NodeProcess {
        let peers: Vec<String> = (0..self.addrs.len())
            .filter(|i| *i != idx)
            .map(|i| format!("{}={}", self.ids[i], self.addrs[i]))
            .collect();
        spawn_node(
            &self.ids[idx],
            self.addrs[idx],
            &peers.join(","),
            &self.spec,
            &self.log_root,
        )
    }

    async fn wait_healthy(&self, idx: usize) {
        let client = membership_client(self.addrs[idx]);
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            if client.health(rpc::HealthRequest {}).await.is_ok() {
                return;
            }
            if Instant::now() > deadline {
                let logs = self.nodes[idx]
                    .as_ref()
                    .map(|n| n.read_stderr())
                    .unwrap_or_default();
                panic!(
                    "node {} never became healthy on {}\nstderr:\n{logs}",
                    self.ids[idx], self.addrs[idx]
                );
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Spawn a single nimbus-store process.
pub fn spawn_node(
    id: &str,
    addr: SocketAddr,
    peers: &str,
    spec: &ClusterSpec,
    log_root: &PathBuf,
) -> NodeProcess {
    let stdout_path = log_root.join(format!("{id}.out.log"));
    let stderr_path = log_root.join(format!("{id}.err.log"));
    let stdout_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stdout_path)
        .expect("open stdout log");
    let stderr_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stderr_path)
        .expect("open stderr log");

    let child = Command::new(env!("CARGO_BIN_EXE_nimbus-store"))
        .arg("--node-id")
        .arg(id)
        .arg("--listen")
        .arg(addr.to_string())
        .arg("--peers")
        .arg(peers)
        .arg("--rf")
        .arg(spec.rf.to_string())
        .arg("--r")
        .arg(spec.r.to_string())
        .arg("--w")
        .arg(spec.w.to_string())
        .arg("--vnodes")
        .arg("128")
        .arg("--probe-interval-ms")
        .arg(spec.probe_interval_ms.to_string())
        .arg("--gossip-interval-ms")
        .arg(spec.gossip_interval_ms.to_string())
        .arg("--suspect-timeout-ms")
        .arg(spec.suspect_timeout_ms.to_string())
        .arg("--dead-timeout-ms")
        .arg(spec.dead_timeout_ms.to_string())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .expect("failed to spawn nimbus-store");

    NodeProcess {
        id: id.to_string(),
        addr,
        child,
        stdout_path,
        stderr_path,
    }
}

/// Reserve a free loopback port.
pub fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr")
}

pub fn kv_client(addr: SocketAddr) -> rpc::KvStoreClient {
    rpc::KvStoreClientBuilder::new("nimbus.rpc.KvStore")
        .address(volo::net::Address::from(addr))
        .build()
}

pub fn internal_client(addr: SocketAddr) -> rpc::KvInternalClient {
    rpc::KvInternalClientBuilder::new("nimbus.rpc.KvInternal")
        .address(volo::net::Address::from(addr))
        .build()
}

pub fn membership_client(addr: SocketAddr) -> rpc::MembershipClient {
    rpc::MembershipClientBuilder::new("nimbus.rpc.Membership")
        .address(volo::net::Address::from(addr))
        .build()
}

/// Issue a Put and return the response.
pub async fn put(
    client: &rpc::KvStoreClient,
    key: &str,
    value: &str,
    w: u32,
    version: Option<rpc::VectorClock>,
) -> rpc::PutResponse {
    client
        .put(rpc::PutRequest {
            key: key.to_string().into(),
            value: value.as_bytes().to_vec().into(),
            consistency_w: w,
            client_id: "it".to_string().into(),
            request_id: format!("it-put-{key}").into(),
            version,
        })
        .await
        .expect("put rpc")
        .into_inner()
}

/// Issue a Get and return the response.
pub async fn get(client: &rpc::KvStoreClient, key: &str, r: u32) -> rpc::GetResponse {
    client
        .get(rpc::GetRequest {
            key: key.to_string().into(),
            consistency_r: r,
            client_id: "it".to_string().into(),
            request_id: format!("it-get-{key}").into(),
        })
        .await
        .expect("get rpc")
        .into_inner()
}

/// Issue a Delete and return the response.
pub async fn delete(
    client: &rpc::KvStoreClient,
    key: &str,
    w: u32,
    version: Option<rpc::VectorClock>,
) -> rpc::DeleteResponse {
    client
        .delete(rpc::DeleteRequest {
            key: key.to_string().into(),
            consistency_w: w,
            client_id: "it".to_string().into(),
            request_id: format!("it-del-{key}").into(),
            version,
        })
        .await
        .expect("delete rpc")
        .into_inner()
}

/// Counter for `node_id` inside a wire clock (0 when absent).
pub fn clock_counter(clock: Option<&rpc::VectorClock>, node_id: &str) -> i64 {
    clock
        .map(|c| {
            c.entries
                .iter()
                .find(|e| e.node_id.as_str() == node_id)
                .map(|e| e.counter)
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

/// Build a wire clock from (id, counter) pairs.
pub fn wire_clock(entries: &[(&str, i64)]) -> rpc::VectorClock {
    rpc::VectorClock {
        entries: entries
            .iter()
            .map(|(id, counter)| rpc::VectorClockEntry {
                node_id: id.to_string().into(),
                counter: *counter,
            })
            .collect(),
    }
}

/// Poll node `addr`'s membership view until `predicate` holds or `timeout`
/// elapses; returns the final snapshot.
pub async fn wait_for_membership(
    addr: SocketAddr,
    timeout: Duration,
    predicate: impl Fn(&[rpc::Member]) -> bool,
) -> Vec<rpc::Member> {
    let client = membership_client(addr);
    let deadline = Instant::now() + timeout;
    let mut last = Vec::new();
    loop {
        if let Ok(resp) = client.get_membership(rpc::GetMembershipRequest {}).await {
            last = resp.into_inner().members;
            if predicate(&last) {
                return last;
            }
        }
        if Instant::now() > deadline {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Status of `node_id` in a membership snapshot.
pub fn member_status(members: &[rpc::Member], node_id: &str) -> Option<rpc::MemberStatus> {
    members
        .iter()
        .find(|m| m.id.as_str() == node_id)
        .map(|m| m.status)
}
