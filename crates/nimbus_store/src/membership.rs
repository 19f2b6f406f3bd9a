//! Gossip-based cluster membership and failure detection.
//!
//! SWIM-flavored: a probe task pings a random alive peer each interval, a
//! gossip task trades full member snapshots, and a sweep task ages Suspect
//! members into Dead. Disputes are settled by per-member incarnation
//! numbers; a node that hears rumors of its own death bumps its incarnation
//! so its next outgoing snapshot dominates. Dead entries are kept around
//! deliberately so late gossip cannot resurrect a recycled id.
//!
//! One mutex covers the member table, the incarnation counters, and the
//! change callback; the callback (ring rebuild) runs under it, which is safe
//! because the lock order is membership -> ring and nothing calls back in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::ring::RingNode;

/// Liveness state of a cluster member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Suspect,
    Dead,
}

impl MemberStatus {
    /// Rank used to break ties between equal incarnations.
    fn rank(self) -> u8 {
        match self {
            MemberStatus::Alive => 2,
            MemberStatus::Suspect => 1,
            MemberStatus::Dead => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Alive => "ALIVE",
            MemberStatus::Suspect => "SUSPECT",
            MemberStatus::Dead => "DEAD",
        }
    }
}

/// One cluster member as this node sees it.
#[derive(Clone, Debug)]
pub struct Member {
    pub id: String,
    pub addr: String,
    pub status: MemberStatus,
    pub incarnation: u64,
    pub last_seen: SystemTime,
}

/// Sends membership RPCs to peers. Implemented by the gRPC peer pool;
/// tests substitute in-memory transports.
#[async_trait]
pub trait MembershipTransport: Send + Sync + 'static {
    /// Ping a peer; the reply carries the peer's member snapshot.
    async fn ping(
        &self,
        addr: &str,
        from_id: &str,
        snapshot: Vec<Member>,
    ) -> anyhow::Result<Vec<Member>>;

    /// Exchange full snapshots with a peer.
    async fn gossip(
        &self,
        addr: &str,
        from_id: &str,
        snapshot: Vec<Member>,
    ) -> anyhow::Result<Vec<Member>>;
}

type ChangeCallback = Box<dyn Fn(Vec<RingNode>) + Send + Sync>;

struct Inner {
    members: HashMap<String, Member>,
    incarnations: HashMap<String, u64>,
    on_change: Option<ChangeCallback>,
}

/// Membership table plus the periodic tasks that maintain it.
pub struct Membership {
    local_id: String,
    probe_interval: Duration,
    gossip_interval: Duration,
    suspect_timeout: Duration,
    dead_timeout: Duration,
    inner: Mutex<Inner>,
}

/// Sweep cadence for suspect/dead timeouts.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

impl Membership {
    /// Create a membership table containing only the local node (Alive,
    /// incarnation 1).
    pub fn new(
        local_id: impl Into<String>,
        local_addr: impl Into<String>,
        probe_interval: Duration,
        gossip_interval: Duration,
        suspect_timeout: Duration,
        dead_timeout: Duration,
    ) -> Self {
        let local_id = local_id.into();
        let local_addr = local_addr.into();

        let mut members = HashMap::new();
        members.insert(
            local_id.clone(),
            Member {
                id: local_id.clone(),
                addr: local_addr,
                status: MemberStatus::Alive,
                incarnation: 1,
                last_seen: SystemTime::now(),
            },
        );
        let mut incarnations = HashMap::new();
        incarnations.insert(local_id.clone(), 1);

        Self {
            local_id,
            probe_interval,
            gossip_interval,
            suspect_timeout,
            dead_timeout,
            inner: Mutex::new(Inner {
                members,
                incarnations,
                on_change: None,
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Register the callback fired (with the alive set) on any status
    /// transition or newly discovered member.
    pub fn set_on_change(&self, callback: impl Fn(Vec<RingNode>) + Send + Sync + 'static) {
        let mut inner = self.lock();
        inner.on_change = Some(Box::new(callback));
    }

    /// Insert seed peers as optimistically Alive at incarnation 1. The
    /// first gossip round replaces these with authoritative entries.
    pub fn add_seeds(&self, seeds: &[RingNode]) {
        let mut inner = self.lock();
        let mut changed = false;
        for seed in seeds {
            if seed.id == self.local_id || inner.members.contains_key(&seed.id) {
                continue;
            }
            inner.members.insert(
                seed.id.clone(),
                Member {
                    id: seed.id.clone(),
                    addr: seed.addr.clone(),
                    status: MemberStatus::Alive,
                    incarnation: 1,
                    last_seen: SystemTime::now(),
                },
            );
            inner.incarnations.insert(seed.id.clone(), 1);
            changed = true;
        }
        if changed {
            Self::notify(&inner);
        }
    }

    /// Copy of the full member table.
    pub fn snapshot(&self) -> Vec<Member> {
        let inner = self.lock();
        inner.members.values().cloned().collect()
    }

    /// Alive members only, in the shape the ring consumes.
    pub fn alive_nodes(&self) -> Vec<RingNode> {
        let inner = self.lock();
        Self::alive_nodes_locked(&inner)
    }

    /// Count of Alive members (self included).
    pub fn alive_count(&self) -> usize {
        let inner = self.lock();
        inner
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Alive)
            .count()
    }

    /// Record a successful inbound contact from `id`.
    ///
    /// Suspect members recover to Alive; Dead members are ignored here
    /// because rejoining after Dead requires fresh incarnation evidence
    /// through gossip.
    pub fn mark_alive(&self, id: &str) {
        if id == self.local_id {
            return;
        }
        let mut inner = self.lock();
        let Some(member) = inner.members.get_mut(id) else {
            return;
        };
        match member.status {
            MemberStatus::Alive => member.last_seen = SystemTime::now(),
            MemberStatus::Suspect => {
                member.status = MemberStatus::Alive;
                member.last_seen = SystemTime::now();
                info!(peer = id, "member recovered to ALIVE");
                Self::notify(&inner);
            }
            MemberStatus::Dead => {}
        }
    }

    /// Merge a received membership snapshot.
    pub fn apply_gossip(&self, remote_members: Vec<Member>) {
        let mut inner = self.lock();
        let mut changed = false;

        for remote in remote_members {
            if remote.id == self.local_id {
                // Somebody is spreading rumors about us; refute if needed.
                changed |= Self::refute_if_needed(&mut inner, &self.local_id, &remote);
                continue;
            }

            if !inner.members.contains_key(&remote.id) {
                debug!(peer = %remote.id, status = remote.status.as_str(), "discovered member");
                inner
                    .incarnations
                    .insert(remote.id.clone(), remote.incarnation);
                inner.members.insert(
                    remote.id.clone(),
                    Member {
                        last_seen: SystemTime::now(),
                        ..remote
                    },
                );
                changed = true;
                continue;
            }

            let Some(local) = inner.members.get_mut(&remote.id) else {
                continue;
            };
            if remote.incarnation > local.incarnation {
                if local.status != remote.status {
                    info!(
                        peer = %remote.id,
                        from = local.status.as_str(),
                        to = remote.status.as_str(),
                        incarnation = remote.incarnation,
                        "member status updated by gossip"
                    );
                    changed = true;
                }
                local.status = remote.status;
                local.incarnation = remote.incarnation;
                local.last_seen = SystemTime::now();
                inner
                    .incarnations
                    .insert(remote.id.clone(), remote.incarnation);
            } else if remote.incarnation == local.incarnation
                && remote.status.rank() > local.status.rank()
            {
                local.status = remote.status;
                local.last_seen = SystemTime::now();
                changed = true;
            }
            // Lower incarnations carry no news.
        }

        if changed {
            Self::notify(&inner);
        }
    }

    /// Handle a rumor about the local node. Non-Alive rumors at or above
    /// our incarnation are refuted by bumping past them, so the next
    /// outgoing snapshot dominates. Returns true when the alive set
    /// (incarnation) changed.
    fn refute_if_needed(inner: &mut Inner, local_id: &str, remote: &Member) -> bool {
        if remote.status == MemberStatus::Alive {
            return false;
        }
        let current = inner.incarnations.get(local_id).copied().unwrap_or(1);
        if remote.incarnation < current {
            return false;
        }
        let bumped = remote.incarnation.max(current) + 1;
        warn!(
            rumored = remote.status.as_str(),
            rumored_incarnation = remote.incarnation,
            new_incarnation = bumped,
            "refuting rumor about local node"
        );
        inner.incarnations.insert(local_id.to_string(), bumped);
        if let Some(me) = inner.members.get_mut(local_id) {
            me.status = MemberStatus::Alive;
            me.incarnation = bumped;
            me.last_seen = SystemTime::now();
        }
        true
    }

    /// Record a failed probe of `id`: an Alive member becomes Suspect at a
    /// bumped incarnation.
    pub fn probe_failed(&self, id: &str) {
        let mut inner = self.lock();
        let incarnation = inner.incarnations.get(id).copied().unwrap_or(0) + 1;
        let Some(member) = inner.members.get_mut(id) else {
            return;
        };
        if member.status != MemberStatus::Alive {
            return;
        }
        member.status = MemberStatus::Suspect;
        member.incarnation = incarnation;
        member.last_seen = SystemTime::now();
        inner.incarnations.insert(id.to_string(), incarnation);
        warn!(peer = id, incarnation, "probe failed, member SUSPECT");
        Self::notify(&inner);
    }

    /// Record a successful probe of `id`.
    pub fn probe_succeeded(&self, id: &str) {
        self.mark_alive(id);
    }

    /// Age Suspect members into Dead. Dead entries past the dead timeout
    /// are kept; dropping them would let delayed gossip resurrect the id.
    pub fn sweep_timeouts(&self) {
        let mut inner = self.lock();
        let mut changed = false;
        let mut bumps = Vec::new();

        for (id, member) in inner.members.iter_mut() {
            if *id == self.local_id {
                continue;
            }
            let elapsed = member.last_seen.elapsed().unwrap_or_default();
            if member.status == MemberStatus::Suspect && elapsed > self.suspect_timeout {
                member.status = MemberStatus::Dead;
                member.incarnation += 1;
                bumps.push((id.clone(), member.incarnation));
                warn!(peer = %id, "suspect timeout expired, member DEAD");
                changed = true;
            } else if member.status == MemberStatus::Dead && elapsed > self.dead_timeout {
                debug!(peer = %id, "member remains DEAD past dead timeout");
            }
        }
        for (id, incarnation) in bumps {
            inner.incarnations.insert(id, incarnation);
        }

        if changed {
            Self::notify(&inner);
        }
    }

    /// Spawn the probe, gossip, and sweep loops. They run until the node
    /// process stops.
    pub fn start(self: &Arc<Self>, transport: Arc<dyn MembershipTransport>) {
        let probe = self.clone();
        let probe_transport = transport.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                probe.probe_round(probe_transport.as_ref()).await;
            }
        });

        let gossip = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gossip.gossip_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                gossip.gossip_round(transport.as_ref()).await;
            }
        });

        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                sweeper.sweep_timeouts();
            }
        });
    }

    /// One probe: ping a random Alive peer under the probe-interval
    /// deadline, merging the piggybacked snapshot on success.
    async fn probe_round(&self, transport: &dyn MembershipTransport) {
        let Some(target) = self.pick_probe_target() else {
            return;
        };

        let snapshot = self.snapshot();
        let result = tokio::time::timeout(
            self.probe_interval,
            transport.ping(&target.addr, &self.local_id, snapshot),
        )
        .await;

        match result {
            Ok(Ok(reply)) => {
                self.probe_succeeded(&target.id);
                self.apply_gossip(reply);
            }
            Ok(Err(err)) => {
                debug!(peer = %target.id, error = %err, "probe rpc failed");
                self.probe_failed(&target.id);
            }
            Err(_) => {
                debug!(peer = %target.id, "probe timed out");
                self.probe_failed(&target.id);
            }
        }
    }

    /// One gossip exchange with a random peer (any status), merging the
    /// reply snapshot.
    async fn gossip_round(&self, transport: &dyn MembershipTransport) {
        let Some(target) = self.pick_gossip_target() else {
            return;
        };

        let snapshot = self.snapshot();
        let result = tokio::time::timeout(
            self.probe_interval,
            transport.gossip(&target.addr, &self.local_id, snapshot),
        )
        .await;

        match result {
            Ok(Ok(reply)) => self.apply_gossip(reply),
            Ok(Err(err)) => debug!(peer = %target.id, error = %err, "gossip rpc failed"),
            Err(_) => debug!(peer = %target.id, "gossip timed out"),
        }
    }

    fn pick_probe_target(&self) -> Option<Member> {
        let inner = self.lock();
        let candidates: Vec<&Member> = inner
            .members
            .values()
            .filter(|m| m.id != self.local_id && m.status == MemberStatus::Alive)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    fn pick_gossip_target(&self) -> Option<Member> {
        let inner = self.lock();
        let candidates: Vec<&Member> = inner
            .members
            .values()
            .filter(|m| m.id != self.local_id)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    fn alive_nodes_locked(inner: &Inner) -> Vec<RingNode> {
        inner
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Alive)
            .map(|m| RingNode {
                id: m.id.clone(),
                addr: m.addr.clone(),
            })
            .collect()
    }

    fn notify(inner: &Inner) {
        if let Some(callback) = &inner.on_change {
            callback(Self::alive_nodes_locked(inner));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("membership lock poisoned")
    }
}
