//! Minimal admin client for a nimbus-store node.

use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use nimbus_store::clock::VectorClock;
use nimbus_store::convert::{clock_from_wire, clock_to_wire, unix_ms_now};
use nimbus_store::volo_gen::nimbus::rpc;

#[derive(Parser)]
#[command(name = "nimbus-ctl")]
#[command(about = "Client and admin tool for nimbus-store", long_about = None)]
struct Args {
    /// Target gRPC address of a node (host:port).
    #[arg(long, default_value = "127.0.0.1:7001")]
    target: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a key.
    Put {
        key: String,
        value: String,
        /// Write quorum override (0 = node default).
        #[arg(long, default_value_t = 0)]
        w: u32,
        /// Version context like `n1:1,n2:2` from a previous get.
        #[arg(long)]
        version: Option<String>,
    },
    /// Read a key.
    Get {
        key: String,
        /// Read quorum override (0 = node default).
        #[arg(long, default_value_t = 0)]
        r: u32,
    },
    /// Delete a key.
    Delete {
        key: String,
        /// Write quorum override (0 = node default).
        #[arg(long, default_value_t = 0)]
        w: u32,
        /// Version context like `n1:1,n2:2` from a previous get.
        #[arg(long)]
        version: Option<String>,
    },
    /// Print the member table as JSON.
    Members,
    /// Show ring placement for a key.
    Ring { key: String },
    /// Node health.
    Health,
}

/// JSON row for `members` output.
#[derive(Serialize)]
struct MemberRow {
    id: String,
    addr: String,
    status: String,
    incarnation: u64,
    last_seen_unix_ms: u64,
}

/// Parse a `n1:1,n2:2` version-context string.
fn parse_version(raw: &str) -> anyhow::Result<VectorClock> {
    let mut vc = VectorClock::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (id, counter) = part
            .split_once(':')
            .with_context(|| format!("invalid version entry {part:?} (expected id:counter)"))?;
        let counter: i64 = counter
            .trim()
            .parse()
            .with_context(|| format!("invalid counter in {part:?}"))?;
        vc.set(id.trim(), counter);
    }
    Ok(vc)
}

fn kv_client(target: SocketAddr) -> rpc::KvStoreClient {
    rpc::KvStoreClientBuilder::new("nimbus.rpc.KvStore")
        .address(volo::net::Address::from(target))
        .build()
}

fn membership_client(target: SocketAddr) -> rpc::MembershipClient {
    rpc::MembershipClientBuilder::new("nimbus.rpc.Membership")
        .address(volo::net::Address::from(target))
        .build()
}

fn display_clock(pb: Option<&rpc::VectorClock>) -> String {
    clock_from_wire(pb).unwrap_or_default().to_string()
}

fn request_id() -> String {
    format!("ctl-{}", unix_ms_now())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let target: SocketAddr = args
        .target
        .parse()
        .with_context(|| format!("invalid target address {:?}", args.target))?;

    match args.command {
        Command::Put {
            key,
            value,
            w,
            version,
        } => {
            let version = version.as_deref().map(parse_version).transpose()?;
            let client = kv_client(target);
            let resp = client
                .put(rpc::PutRequest {
                    key: key.into(),
                    value: value.into_bytes().into(),
                    consistency_w: w,
                    client_id: "nimbus-ctl".to_string().into(),
                    request_id: request_id().into(),
                    version: version.as_ref().map(clock_to_wire),
                })
                .await
                .map_err(|err| anyhow::anyhow!("put failed: {err}"))?
                .into_inner();
            if resp.status == rpc::PutStatus::PUT_STATUS_SUCCESS {
                println!("OK version={}", display_clock(resp.version.as_ref()));
            } else {
                anyhow::bail!("put error: {}", resp.error_message);
            }
        }
        Command::Get { key, r } => {
            let client = kv_client(target);
            let resp = client
                .get(rpc::GetRequest {
                    key: key.into(),
                    consistency_r: r,
                    client_id: "nimbus-ctl".to_string().into(),
                    request_id: request_id().into(),
                })
                .await
                .map_err(|err| anyhow::anyhow!("get failed: {err}"))?
                .into_inner();
            match resp.status {
                s if s == rpc::GetStatus::GET_STATUS_NOT_FOUND => println!("(not found)"),
                s if s == rpc::GetStatus::GET_STATUS_SUCCESS => {
                    if let Some(value) = resp.value.as_ref() {
                        println!(
                            "{} version={}",
                            String::from_utf8_lossy(&value.value),
                            display_clock(value.version.as_ref()),
                        );
                    } else {
                        println!("conflicts ({} siblings):", resp.conflicts.len());
                        for sibling in &resp.conflicts {
                            let rendered = if sibling.deleted {
                                "(tombstone)".to_string()
                            } else {
                                String::from_utf8_lossy(&sibling.value).to_string()
                            };
                            println!(
                                "  {rendered} version={}",
                                display_clock(sibling.version.as_ref())
                            );
                        }
                    }
                }
                _ => anyhow::bail!("get error: {}", resp.error_message),
            }
        }
        Command::Delete { key, w, version } => {
            let version = version.as_deref().map(parse_version).transpose()?;
            let client = kv_client(target);
            let resp = client
                .delete(rpc::DeleteRequest {
                    key: key.into(),
                    consistency_w: w,
                    client_id: "nimbus-ctl".to_string().into(),
                    request_id: request_id().into(),
                    version: version.as_ref().map(clock_to_wire),
                })
                .await
                .map_err(|err| anyhow::anyhow!("delete failed: {err}"))?
                .into_inner();
            if resp.status == rpc::DeleteStatus::DELETE_STATUS_SUCCESS {
                println!("OK version={}", display_clock(resp.version.as_ref()));
            } else {
                anyhow::bail!("delete error: {}", resp.error_message);
            }
        }
        Command::Members => {
            let client = membership_client(target);
            let resp = client
                .get_membership(rpc::GetMembershipRequest {})
                .await
                .map_err(|err| anyhow::anyhow!("get_membership failed: {err}"))?
                .into_inner();
            let rows: Vec<MemberRow> = resp
                .members
                .iter()
                .map(|m| MemberRow {
                    id: m.id.to_string(),
                    addr: m.addr.to_string(),
                    status: status_name(m.status).to_string(),
                    incarnation: m.incarnation,
                    last_seen_unix_ms: m.last_seen_unix_ms,
                })
                .collect();
            println!("local node: {}", resp.local_node_id);
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Ring { key } => {
            let client = membership_client(target);
            let resp = client
                .get_ring(rpc::GetRingRequest { key: key.into() })
                .await
                .map_err(|err| anyhow::anyhow!("get_ring failed: {err}"))?
                .into_inner();
            println!(
                "owner: {} ({})",
                resp.owner_id, resp.owner_addr
            );
            for (id, addr) in resp.replica_ids.iter().zip(resp.replica_addrs.iter()) {
                println!("replica: {id} ({addr})");
            }
            println!(
                "alive_members={} replication_factor={}",
                resp.alive_members, resp.replication_factor
            );
        }
        Command::Health => {
            let client = membership_client(target);
            let resp = client
                .health(rpc::HealthRequest {})
                .await
                .map_err(|err| anyhow::anyhow!("health failed: {err}"))?
                .into_inner();
            let status = if resp.status == rpc::HealthStatus::HEALTH_STATUS_OK {
                "OK"
            } else {
                "DEGRADED"
            };
            println!(
                "{status} node={} uptime={}s {}",
                resp.node_id, resp.uptime_seconds, resp.message
            );
        }
    }

    Ok(())
}

fn status_name(status: rpc::MemberStatus) -> &'static str {
    match status {
        s if s == rpc::MemberStatus::MEMBER_STATUS_SUSPECT => "SUSPECT",
        s if s == rpc::MemberStatus::MEMBER_STATUS_DEAD => "DEAD",
        _ => "ALIVE",
    }
}
