//! Dynamo-style replicated key-value store.
//!
//! Every node is symmetric: any of them can coordinate a client request.
//! Data is replicated to N nodes chosen by a consistent-hash ring, reads and
//! writes complete at tunable quorums, concurrent writes surface to clients
//! as vector-clock siblings, stale replicas converge through asynchronous
//! read repair, and liveness is tracked by SWIM-style gossip.

include!(concat!(env!("OUT_DIR"), "/volo_gen.rs"));

pub mod clock;
pub mod config;
pub mod convert;
pub mod coordinator;
pub mod membership;
pub mod node;
pub mod quorum;
pub mod reconcile;
pub mod repair;
pub mod ring;
pub mod rpc_service;
pub mod store;
pub mod transport;
