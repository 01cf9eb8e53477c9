use shard_lease::Lease;
use std::collections::{BTreeMap, HashSet};

/// Decision is the allocation controller's verdict for one tick: grow by
/// one worker, shed one, or hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Acquire,
    Shed,
    Hold,
}

/// Apply the balancing rule to this instance's live worker count and the
/// peer loads: acquire while at or below the least-loaded peer, shed when
/// more than one above it. The two inequalities leave a stable band of
/// width one around the minimum, so instances don't thrash a shard back
/// and forth.
pub fn decide(live: usize, peers: &BTreeMap<String, u32>) -> Decision {
    let Some(min_peer) = peers.values().copied().min() else {
        // No live peers: this instance is the fleet.
        return Decision::Acquire;
    };

    if live == 0 || live <= min_peer as usize {
        Decision::Acquire
    } else if live > min_peer as usize + 1 {
        Decision::Shed
    } else {
        Decision::Hold
    }
}

/// AvailableShard names a shard this instance may try to consume, and the
/// lease counter a takeover must present. None claims a fresh lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableShard {
    pub shard_id: String,
    pub lease_counter: Option<u64>,
}

/// Pick the next shard available to this instance: the first stream-ordered
/// shard with no lease row at all, else the first stored-order lease which
/// has expired and isn't finished. Ties are not otherwise broken; the
/// worker's CAS arbitrates races.
pub fn available_shard(
    shard_ids: &[String],
    leases: &[Lease],
    now_millis: i64,
) -> Option<AvailableShard> {
    let finished: HashSet<&str> = leases
        .iter()
        .filter(|lease| lease.is_finished)
        .map(|lease| lease.shard_id.as_str())
        .collect();
    let leased: HashSet<&str> = leases.iter().map(|lease| lease.shard_id.as_str()).collect();

    if let Some(shard_id) = shard_ids
        .iter()
        .find(|id| !finished.contains(id.as_str()) && !leased.contains(id.as_str()))
    {
        return Some(AvailableShard {
            shard_id: shard_id.clone(),
            lease_counter: None,
        });
    }

    leases
        .iter()
        .find(|lease| lease.is_expired(now_millis) && !lease.is_finished)
        .map(|lease| AvailableShard {
            shard_id: lease.shard_id.clone(),
            lease_counter: Some(lease.lease_counter),
        })
}
