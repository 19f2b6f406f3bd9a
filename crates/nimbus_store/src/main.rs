//! nimbus-store node binary entry point.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use nimbus_store::config::{parse_peers, NodeConfig};
use nimbus_store::node;

/// CLI options for running a node.
#[derive(Parser, Debug)]
#[command(name = "nimbus-store")]
#[command(about = "Dynamo-style replicated key-value store node", long_about = None)]
struct Args {
    /// Unique node identifier within the cluster.
    #[arg(long, env = "NIMBUS_NODE_ID")]
    node_id: String,

    /// gRPC listen address (host:port).
    #[arg(long, env = "NIMBUS_LISTEN")]
    listen: SocketAddr,

    /// Comma-separated peer list like: `n2=127.0.0.1:7002,n3=127.0.0.1:7003`
    #[arg(long, env = "NIMBUS_PEERS", default_value = "")]
    peers: String,

    /// Replication factor (replicas per key).
    #[arg(long, env = "NIMBUS_RF", default_value_t = 3)]
    rf: usize,

    /// Default read quorum; requests may override per call.
    #[arg(long, env = "NIMBUS_R", default_value_t = 2)]
    r: usize,

    /// Default write quorum; requests may override per call.
    #[arg(long, env = "NIMBUS_W", default_value_t = 2)]
    w: usize,

    /// Virtual nodes per physical node on the hash ring.
    #[arg(long, env = "NIMBUS_VNODES", default_value_t = 128)]
    vnodes: usize,

    /// Failure-detection probe interval (ms).
    #[arg(long, env = "NIMBUS_PROBE_INTERVAL_MS", default_value_t = 1000)]
    probe_interval_ms: u64,

    /// Gossip exchange interval (ms).
    #[arg(long, env = "NIMBUS_GOSSIP_INTERVAL_MS", default_value_t = 2000)]
    gossip_interval_ms: u64,

    /// How long a member stays Suspect before it is declared Dead (ms).
    #[arg(long, env = "NIMBUS_SUSPECT_TIMEOUT_MS", default_value_t = 3000)]
    suspect_timeout_ms: u64,

    /// Retention horizon for Dead members (ms).
    #[arg(long, env = "NIMBUS_DEAD_TIMEOUT_MS", default_value_t = 10_000)]
    dead_timeout_ms: u64,

    /// Per-replica RPC deadline (ms).
    #[arg(long, env = "NIMBUS_RPC_TIMEOUT_MS", default_value_t = 2000)]
    rpc_timeout_ms: u64,

    /// Deadline for each detached read-repair write (ms).
    #[arg(long, env = "NIMBUS_REPAIR_TIMEOUT_MS", default_value_t = 2000)]
    repair_timeout_ms: u64,
}

impl Args {
    fn into_config(self) -> anyhow::Result<NodeConfig> {
        let peers = parse_peers(&self.peers)?;
        Ok(NodeConfig {
            node_id: self.node_id,
            listen: self.listen,
            peers,
            replication_factor: self.rf,
            read_quorum: self.r,
            write_quorum: self.w,
            vnodes_per_node: self.vnodes,
            probe_interval: Duration::from_millis(self.probe_interval_ms.max(1)),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms.max(1)),
            suspect_timeout: Duration::from_millis(self.suspect_timeout_ms.max(1)),
            dead_timeout: Duration::from_millis(self.dead_timeout_ms.max(1)),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms.max(1)),
            repair_timeout: Duration::from_millis(self.repair_timeout_ms.max(1)),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.into_config()?;
    node::run(config).await
}
