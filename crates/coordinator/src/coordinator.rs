use crate::allocation::{self, AvailableShard, Decision};
use crate::stream::StreamClient;
use crate::supervisor::Supervisor;
use crate::Config;
use shard_lease::{now_millis, ClusterClient, LeaseClient, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Coordinator is one instance's coordination engine. All of its state is
/// owned by whichever task drives the tick methods; the serve loop in
/// [`crate::run`] is that task, and integration tests drive ticks directly.
pub struct Coordinator<S, C> {
    config: Config,
    self_id: String,
    leases: LeaseClient<S>,
    cluster: ClusterClient<S>,
    stream: C,
    supervisor: Arc<Supervisor>,
    // Last fetched peer loads, excluding self and expired members.
    peers: BTreeMap<String, u32>,
    has_started_reset: bool,
    last_gc: Option<Instant>,
}

impl<S: Store, C: StreamClient> Coordinator<S, C> {
    pub fn new(config: Config, store: Arc<S>, stream: C) -> Self {
        let self_id = uuid::Uuid::new_v4().to_string();
        let supervisor = Arc::new(Supervisor::new(&config));

        let lease_duration = config.lease_duration;
        let member_ttl = config.member_ttl;

        Self {
            self_id: self_id.clone(),
            leases: LeaseClient::new(store.clone(), self_id, lease_duration),
            cluster: ClusterClient::new(store, member_ttl),
            stream,
            supervisor,
            peers: BTreeMap::new(),
            has_started_reset: false,
            last_gc: None,
            config,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn peers(&self) -> &BTreeMap<String, u32> {
        &self.peers
    }

    /// Report this instance's load to the cluster registry. Failures are
    /// logged and the next tick tries again.
    pub async fn tick_report(&self) {
        let count = self.supervisor.count() as u32;

        if let Err(err) = self.cluster.report(&self.self_id, count).await {
            tracing::error!(?err, "failed to report cluster liveness (will retry)");
        }
    }

    /// One membership fetch tick: refresh the peer view, sweep expired
    /// members at most once per GC interval, and run the allocation pass.
    pub async fn tick_fetch(&mut self) {
        let members = match self.cluster.fetch_all().await {
            Ok(members) => members,
            Err(err) => {
                tracing::error!(?err, "failed to fetch cluster members (will retry)");
                return;
            }
        };

        let now = now_millis();
        self.peers = members
            .into_iter()
            .filter(|member| member.id != self.self_id && !member.is_expired(now))
            .map(|member| (member.id, member.active_consumers))
            .collect();

        self.maybe_garbage_collect().await;
        self.update_network().await;
    }

    async fn maybe_garbage_collect(&mut self) {
        let due = match self.last_gc {
            None => true,
            Some(at) => at.elapsed() >= self.config.gc_interval,
        };
        if !due {
            return;
        }
        self.last_gc = Some(Instant::now());

        match self.cluster.garbage_collect().await {
            Ok(0) => (),
            Ok(removed) => tracing::info!(removed, "garbage-collected expired cluster members"),
            Err(err) => tracing::error!(?err, "failed to garbage-collect cluster members"),
        }
    }

    /// Apply the balancing rule to the current peer and worker view,
    /// taking at most one acquire or shed action.
    pub async fn update_network(&mut self) {
        if self.has_started_reset {
            return;
        }

        let live = self.supervisor.count();
        match allocation::decide(live, &self.peers) {
            Decision::Acquire => {
                let Some(available) = self.fetch_available_shard().await else {
                    return;
                };
                tracing::info!(
                    shard = %available.shard_id,
                    counter = ?available.lease_counter,
                    "acquiring shard"
                );

                if let Err(err) = self
                    .supervisor
                    .spawn(&available.shard_id, available.lease_counter)
                {
                    tracing::error!(?err, shard = %available.shard_id, "failed to spawn shard worker");
                }
            }
            Decision::Shed => {
                let Some(handle) = self.supervisor.oldest() else {
                    return;
                };
                tracing::info!(handle, live, "shedding one worker to rebalance");

                // The stop's grace window must not stall the tick loop.
                let supervisor = self.supervisor.clone();
                tokio::spawn(async move { supervisor.stop(handle).await });
            }
            Decision::Hold => tracing::debug!(live, "allocation holding steady"),
        }
    }

    /// Concurrently list stream shards and scan leases, then pick the next
    /// shard available to this instance. Any fetch error skips the tick.
    async fn fetch_available_shard(&self) -> Option<AvailableShard> {
        let (shard_ids, leases) = match futures::try_join!(
            self.stream.list_shards(&self.config.stream_name),
            async { self.leases.fetch_all().await.map_err(anyhow::Error::new) },
        ) {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::error!(?err, "failed to fetch shards and leases; skipping this tick");
                return None;
            }
        };

        allocation::available_shard(&shard_ids, &leases, now_millis())
    }

    /// Latch the reset and stop every worker. The latch is one-shot:
    /// later calls (and ticks already in flight) observe it and do
    /// nothing.
    pub async fn shutdown(&mut self) {
        if self.has_started_reset {
            return;
        }
        self.has_started_reset = true;

        self.supervisor.stop_all().await;
    }
}
