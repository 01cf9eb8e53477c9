use coordinator::{Coordinator, StaticShards};
use shard_lease::{now_millis, Lease, LeaseUpdate, Member, MemoryStore, Store};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

mod support;

#[tokio::test(flavor = "multi_thread")]
async fn solo_bootstrap_acquires_the_only_shard() {
    let store = Arc::new(MemoryStore::default());
    let mut coordinator = Coordinator::new(
        support::config("cat"),
        store.clone(),
        StaticShards::new(["shard-000"]),
    );

    coordinator.tick_fetch().await;

    let live = coordinator.supervisor().live();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].shard_id, "shard-000");
    assert_eq!(live[0].lease_counter, None, "a fresh shard is claimed, not taken over");

    coordinator.tick_report().await;
    let members = store.scan_members().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].id, coordinator.self_id());
    assert_eq!(members[0].active_consumers, 1);

    coordinator.shutdown().await;
    assert_eq!(coordinator.supervisor().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_lease_is_offered_for_takeover() {
    let store = Arc::new(MemoryStore::default());

    // Instance A crashed holding s1 at counter 7.
    store
        .insert_lease(&Lease {
            shard_id: "s1".to_string(),
            lease_counter: 7,
            expires_at: now_millis() - 1_000,
            owner: Some("instance-a".to_string()),
            checkpoint: None,
            is_finished: false,
        })
        .await
        .unwrap();

    let mut coordinator =
        Coordinator::new(support::config("cat"), store.clone(), StaticShards::new(["s1"]));

    coordinator.tick_fetch().await;

    // The spawned worker carries counter 7, so its take_over CAS writes 8.
    let live = coordinator.supervisor().live();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].shard_id, "s1");
    assert_eq!(live[0].lease_counter, Some(7));

    coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_members_are_ignored_for_balancing() {
    let store = Arc::new(MemoryStore::default());

    store
        .put_member(&Member {
            id: "peer-live".to_string(),
            active_consumers: 3,
            expires_at: now_millis() + 60_000,
        })
        .await
        .unwrap();
    store
        .put_member(&Member {
            id: "peer-dead".to_string(),
            active_consumers: 9,
            expires_at: now_millis() - 60_000,
        })
        .await
        .unwrap();

    let mut coordinator = Coordinator::new(
        support::config("cat"),
        store.clone(),
        StaticShards::new(Vec::<String>::new()),
    );

    coordinator.tick_fetch().await;

    assert_eq!(coordinator.peers().len(), 1);
    assert!(coordinator.peers().contains_key("peer-live"));

    coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn member_gc_runs_at_most_once_per_interval() {
    let store = Arc::new(MemoryStore::default());

    let mut config = support::config("cat");
    config.gc_interval = Duration::from_millis(300);
    let mut coordinator =
        Coordinator::new(config, store.clone(), StaticShards::new(Vec::<String>::new()));

    let dead = |id: &str| Member {
        id: id.to_string(),
        active_consumers: 0,
        expires_at: now_millis() - 600_000,
    };

    store.put_member(&dead("peer-x")).await.unwrap();
    coordinator.tick_fetch().await;
    assert!(store.scan_members().await.unwrap().is_empty(), "first tick sweeps");

    // A second expired row appears, but the sweep just ran: it survives
    // this tick.
    store.put_member(&dead("peer-y")).await.unwrap();
    coordinator.tick_fetch().await;
    assert_eq!(store.scan_members().await.unwrap().len(), 1);

    // Once the interval has elapsed the next tick sweeps again.
    tokio::time::sleep(Duration::from_millis(350)).await;
    coordinator.tick_fetch().await;
    assert!(store.scan_members().await.unwrap().is_empty());

    coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_failure_is_fatal() {
    let err = coordinator::run(
        support::config("cat"),
        Arc::new(support::UnreachableStore::default()),
        StaticShards::new(Vec::<String>::new()),
        std::future::pending::<()>(),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("backing table"));
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_latch_blocks_later_ticks() {
    let store = Arc::new(MemoryStore::default());
    let mut coordinator =
        Coordinator::new(support::config("cat"), store.clone(), StaticShards::new(["s1"]));

    coordinator.shutdown().await;

    // Ticks already in flight at reset time complete and observe the
    // latch: no new worker may start.
    coordinator.tick_fetch().await;
    assert_eq!(coordinator.supervisor().count(), 0);

    // The reset is one-shot; calling it again is a no-op.
    coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_table_errors_do_not_stop_the_loops() {
    let store = Arc::new(support::FlakyStore::default());
    let mut coordinator = Coordinator::new(
        support::config("cat"),
        store.clone(),
        StaticShards::new(Vec::<String>::new()),
    );

    // A throttled report is logged and dropped; the next one lands.
    store.fail_next_member_put();
    coordinator.tick_report().await;
    assert!(store.scan_members().await.unwrap().is_empty());

    coordinator.tick_report().await;
    assert_eq!(store.scan_members().await.unwrap().len(), 1);

    // A throttled fetch skips the tick without touching the peer view.
    store.fail_next_member_scan();
    coordinator.tick_fetch().await;
    coordinator.tick_fetch().await;
    assert!(coordinator.peers().is_empty());

    coordinator.shutdown().await;
}

// Convergence: instances share one table, tick round-robin, and the test
// emulates each spawned worker's lease CAS (a worker here is `cat`, which
// holds no real lease). A stopped worker's lease is force-expired at the
// end of the round, standing in for the passage of lease_duration.

struct Instance {
    coordinator: Coordinator<MemoryStore, StaticShards>,
    claimed: HashSet<coordinator::Handle>,
}

fn instance(store: &Arc<MemoryStore>, shards: &StaticShards) -> Instance {
    Instance {
        coordinator: Coordinator::new(support::config("cat"), store.clone(), shards.clone()),
        claimed: HashSet::new(),
    }
}

async fn emulate_worker_claims(store: &Arc<MemoryStore>, instance: &mut Instance) {
    let owner = instance.coordinator.self_id().to_string();

    for info in instance.coordinator.supervisor().live() {
        if instance.claimed.contains(&info.handle) {
            continue;
        }

        let outcome = match info.lease_counter {
            None => store
                .insert_lease(&Lease {
                    shard_id: info.shard_id.clone(),
                    lease_counter: 0,
                    expires_at: now_millis() + 3_600_000,
                    owner: Some(owner.clone()),
                    checkpoint: None,
                    is_finished: false,
                })
                .await
                .map(|_| ()),
            Some(expect) => store
                .update_lease(
                    &info.shard_id,
                    expect,
                    LeaseUpdate {
                        lease_counter: expect + 1,
                        expires_at: now_millis() + 3_600_000,
                        owner: Some(owner.clone()),
                        ..Default::default()
                    },
                )
                .await
                .map(|_| ()),
        };

        match outcome {
            Ok(()) => {
                instance.claimed.insert(info.handle);
            }
            Err(err) if err.is_conflict() => {
                // The losing worker exits non-zero and is pruned.
                instance.coordinator.supervisor().stop(info.handle).await;
            }
            Err(err) => panic!("unexpected store error: {err:?}"),
        }
    }
}

async fn expire_orphaned_leases(store: &Arc<MemoryStore>, instances: &[Instance]) {
    let mut live_shards = HashSet::new();
    for instance in instances {
        for info in instance.coordinator.supervisor().live() {
            if instance.claimed.contains(&info.handle) {
                live_shards.insert(info.shard_id.clone());
            }
        }
    }

    let now = now_millis();
    for lease in store.scan_leases().await.unwrap() {
        if !live_shards.contains(&lease.shard_id) && !lease.is_finished && !lease.is_expired(now) {
            store
                .update_lease(
                    &lease.shard_id,
                    lease.lease_counter,
                    LeaseUpdate {
                        lease_counter: lease.lease_counter,
                        expires_at: now - 1_000,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
    }
}

async fn round(store: &Arc<MemoryStore>, instances: &mut [Instance]) {
    for instance in instances.iter() {
        instance.coordinator.tick_report().await;
    }
    for instance in instances.iter_mut() {
        instance.coordinator.tick_fetch().await;
        emulate_worker_claims(store, instance).await;
    }

    // Give detached shed-stops a moment to complete before accounting.
    tokio::time::sleep(Duration::from_millis(75)).await;
    expire_orphaned_leases(store, instances).await;
}

fn counts(instances: &[Instance]) -> Vec<usize> {
    instances
        .iter()
        .map(|instance| {
            instance
                .coordinator
                .supervisor()
                .live()
                .iter()
                .filter(|info| instance.claimed.contains(&info.handle))
                .count()
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn fleet_converges_and_rebalances_when_an_instance_joins() {
    support::init_tracing();

    let store = Arc::new(MemoryStore::default());
    let shards = StaticShards::new(["s1", "s2", "s3", "s4"]);

    let mut instances = vec![instance(&store, &shards), instance(&store, &shards)];
    for _ in 0..8 {
        round(&store, &mut instances).await;
    }

    let mut got = counts(&instances);
    got.sort();
    assert_eq!(got, vec![2, 2], "two instances split four shards evenly");

    // A third instance joins: someone sheds, and the newcomer takes the
    // expired leases over until the spread is within one.
    instances.push(instance(&store, &shards));
    for _ in 0..10 {
        round(&store, &mut instances).await;
    }

    let mut got = counts(&instances);
    got.sort();
    assert_eq!(got.iter().sum::<usize>(), 4, "all shards stay covered: {got:?}");
    assert!(got[2] - got[0] <= 1, "spread exceeds one: {got:?}");

    // Every shard is held, unexpired, across the fleet.
    let leases = store.scan_leases().await.unwrap();
    assert_eq!(leases.len(), 4);
    let now = now_millis();
    for lease in &leases {
        assert!(!lease.is_expired(now), "{} expired", lease.shard_id);
    }

    for instance in instances.iter_mut() {
        instance.coordinator.shutdown().await;
    }
}
