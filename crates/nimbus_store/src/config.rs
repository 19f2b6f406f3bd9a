//! Node configuration: peer-list parsing, quorum defaults, timing knobs.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::ring::RingNode;

/// A statically configured peer (`id=addr` on the command line).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub addr: String,
}

/// Everything a node needs to come up.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: String,
    pub listen: SocketAddr,
    pub peers: Vec<Peer>,
    pub replication_factor: usize,
    pub read_quorum: usize,
    pub write_quorum: usize,
    pub vnodes_per_node: usize,
    pub probe_interval: Duration,
    pub gossip_interval: Duration,
    pub suspect_timeout: Duration,
    pub dead_timeout: Duration,
    pub rpc_timeout: Duration,
    pub repair_timeout: Duration,
}

impl NodeConfig {
    /// Self plus all configured peers, for the initial ring.
    pub fn ring_nodes(&self) -> Vec<RingNode> {
        let mut nodes = Vec::with_capacity(self.peers.len() + 1);
        nodes.push(RingNode {
            id: self.node_id.clone(),
            addr: self.listen.to_string(),
        });
        for peer in &self.peers {
            // Tolerate the node's own id showing up in the peer list.
            if peer.id != self.node_id {
                nodes.push(RingNode {
                    id: peer.id.clone(),
                    addr: peer.addr.clone(),
                });
            }
        }
        nodes
    }

    /// Configured peers as gossip seeds, excluding self.
    pub fn seed_nodes(&self) -> Vec<RingNode> {
        self.peers
            .iter()
            .filter(|peer| peer.id != self.node_id)
            .map(|peer| RingNode {
                id: peer.id.clone(),
                addr: peer.addr.clone(),
            })
            .collect()
    }
}

/// Parse a comma-separated peer list of the form `id1=addr1,id2=addr2`.
///
/// Empty input yields an empty list; blank segments are skipped.
pub fn parse_peers(raw: &str) -> anyhow::Result<Vec<Peer>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut peers = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (id, addr) = part
            .split_once('=')
            .with_context(|| format!("invalid peer {part:?} (expected id=addr)"))?;
        let id = id.trim();
        let addr = addr.trim();
        if id.is_empty() || addr.is_empty() {
            bail!("peer id and address cannot be empty: {part:?}");
        }

        peers.push(Peer {
            id: id.to_string(),
            addr: addr.to_string(),
        });
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_peers(peers: Vec<Peer>) -> NodeConfig {
        NodeConfig {
            node_id: "n1".to_string(),
            listen: "127.0.0.1:7001".parse().unwrap(),
            peers,
            replication_factor: 3,
            read_quorum: 2,
            write_quorum: 2,
            vnodes_per_node: 128,
            probe_interval: Duration::from_secs(1),
            gossip_interval: Duration::from_secs(2),
            suspect_timeout: Duration::from_secs(3),
            dead_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(2),
            repair_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn parses_peer_list() {
        let peers = parse_peers("n2=127.0.0.1:7002,n3=127.0.0.1:7003").unwrap();
        assert_eq!(
            peers,
            vec![
                Peer {
                    id: "n2".to_string(),
                    addr: "127.0.0.1:7002".to_string()
                },
                Peer {
                    id: "n3".to_string(),
                    addr: "127.0.0.1:7003".to_string()
                },
            ]
        );
    }

    #[test]
    fn empty_input_means_no_peers() {
        assert!(parse_peers("").unwrap().is_empty());
        assert!(parse_peers("   ").unwrap().is_empty());
    }

    #[test]
    fn tolerates_whitespace_and_blank_segments() {
        let peers = parse_peers(" n2 = 127.0.0.1:7002 , , n3=127.0.0.1:7003 ").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].id, "n2");
        assert_eq!(peers[0].addr, "127.0.0.1:7002");
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_peers("n2").is_err());
        assert!(parse_peers("=127.0.0.1:7002").is_err());
        assert!(parse_peers("n2=").is_err());
    }

    #[test]
    fn ring_nodes_include_self_once() {
        let config = config_with_peers(vec![
            Peer {
                id: "n1".to_string(),
                addr: "127.0.0.1:7001".to_string(),
            },
            Peer {
                id: "n2".to_string(),
                addr: "127.0.0.1:7002".to_string(),
            },
        ]);
        let nodes = config.ring_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "n1");
        assert_eq!(nodes[1].id, "n2");

        let seeds = config.seed_nodes();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, "n2");
    }
}
