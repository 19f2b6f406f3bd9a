//! Conversions between wire (protobuf) types and local types.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::clock::VectorClock;
use crate::membership::{Member, MemberStatus};
use crate::store::VersionedValue;
use crate::volo_gen::nimbus::rpc;

/// Local clock -> wire clock. An empty clock encodes as an empty entry list.
pub fn clock_to_wire(vc: &VectorClock) -> rpc::VectorClock {
    rpc::VectorClock {
        entries: vc
            .iter()
            .map(|(node_id, counter)| rpc::VectorClockEntry {
                node_id: node_id.to_string().into(),
                counter,
            })
            .collect(),
    }
}

/// Wire clock -> local clock. `None` stays `None` so callers can tell "no
/// version context" apart from an explicitly empty clock.
pub fn clock_from_wire(pb: Option<&rpc::VectorClock>) -> Option<VectorClock> {
    let pb = pb?;
    let mut vc = VectorClock::new();
    for entry in &pb.entries {
        vc.set(&entry.node_id, entry.counter);
    }
    Some(vc)
}

/// Local versioned value -> wire form.
pub fn value_to_wire(vv: &VersionedValue) -> rpc::VersionedValue {
    rpc::VersionedValue {
        value: vv.value.clone().into(),
        version: Some(clock_to_wire(&vv.version)),
        deleted: vv.deleted,
    }
}

/// Wire versioned value -> local form. Expiry never crosses the wire.
pub fn value_from_wire(pb: &rpc::VersionedValue) -> VersionedValue {
    VersionedValue {
        value: pb.value.to_vec(),
        version: clock_from_wire(pb.version.as_ref()).unwrap_or_default(),
        deleted: pb.deleted,
        expires_at: None,
    }
}

/// Local member status -> wire enum.
pub fn status_to_wire(status: MemberStatus) -> rpc::MemberStatus {
    match status {
        MemberStatus::Alive => rpc::MemberStatus::MEMBER_STATUS_ALIVE,
        MemberStatus::Suspect => rpc::MemberStatus::MEMBER_STATUS_SUSPECT,
        MemberStatus::Dead => rpc::MemberStatus::MEMBER_STATUS_DEAD,
    }
}

/// Wire enum -> local member status; unknown values read as Alive.
pub fn status_from_wire(status: rpc::MemberStatus) -> MemberStatus {
    match status {
        s if s == rpc::MemberStatus::MEMBER_STATUS_SUSPECT => MemberStatus::Suspect,
        s if s == rpc::MemberStatus::MEMBER_STATUS_DEAD => MemberStatus::Dead,
        _ => MemberStatus::Alive,
    }
}

/// Local member -> wire form.
pub fn member_to_wire(member: &Member) -> rpc::Member {
    rpc::Member {
        id: member.id.clone().into(),
        addr: member.addr.clone().into(),
        status: status_to_wire(member.status),
        incarnation: member.incarnation,
        last_seen_unix_ms: unix_ms(member.last_seen),
    }
}

/// Wire member -> local form.
pub fn member_from_wire(pb: &rpc::Member) -> Member {
    Member {
        id: pb.id.to_string(),
        addr: pb.addr.to_string(),
        status: status_from_wire(pb.status),
        incarnation: pb.incarnation,
        last_seen: UNIX_EPOCH + Duration::from_millis(pb.last_seen_unix_ms),
    }
}

/// Convert a full snapshot for the wire.
pub fn members_to_wire(members: &[Member]) -> Vec<rpc::Member> {
    members.iter().map(member_to_wire).collect()
}

/// Convert a received snapshot to local members.
pub fn members_from_wire(members: &[rpc::Member]) -> Vec<Member> {
    members.iter().map(member_from_wire).collect()
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch times.
pub fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Current wall-clock time in Unix milliseconds.
pub fn unix_ms_now() -> u64 {
    unix_ms(SystemTime::now())
}
