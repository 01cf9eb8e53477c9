use shard_lease::Store;
use std::sync::Arc;
use std::time::Duration;

mod allocation;
mod coordinator;
mod health;
mod stream;
mod supervisor;

pub use allocation::{available_shard, decide, AvailableShard, Decision};
pub use coordinator::Coordinator;
pub use stream::{StaticShards, StreamClient};
pub use supervisor::{
    Handle, Message, StartingIterator, Supervisor, WorkerInfo, WorkerOptions, OPTIONS_ENV,
};

/// Config of one coordinator instance. Durations deserialize from
/// humantime strings ("40s", "5m").
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Stream whose shards are being consumed.
    pub stream_name: String,
    /// Backing table name, forwarded opaquely to workers.
    pub table_name: String,
    /// Opaque stream connection blob (endpoint, credentials, region),
    /// forwarded to workers untouched.
    #[serde(default)]
    pub stream_config: Option<serde_json::Value>,
    /// Worker executable spawned once per acquired shard.
    pub worker_program: std::path::PathBuf,
    #[serde(default)]
    pub worker_args: Vec<String>,
    #[serde(default)]
    pub starting_iterator: StartingIterator,

    /// How long a claimed or renewed lease remains valid.
    #[serde(with = "humantime_serde", default = "defaults::lease_duration")]
    pub lease_duration: Duration,
    /// Cadence of liveness reports to the cluster registry.
    #[serde(with = "humantime_serde", default = "defaults::report_period")]
    pub report_period: Duration,
    /// Cadence of peer fetches, which drive allocation decisions.
    #[serde(with = "humantime_serde", default = "defaults::fetch_period")]
    pub fetch_period: Duration,
    /// Minimum spacing between sweeps of expired member rows.
    #[serde(with = "humantime_serde", default = "defaults::gc_interval")]
    pub gc_interval: Duration,
    /// Lifetime of a liveness report. At least twice the report period, so
    /// one missed report doesn't kill a live member.
    #[serde(with = "humantime_serde", default = "defaults::member_ttl")]
    pub member_ttl: Duration,
    /// How long a stopping worker gets between the shutdown message and a
    /// kill.
    #[serde(with = "humantime_serde", default = "defaults::stop_grace")]
    pub stop_grace: Duration,

    /// Provisioned capacity used if the backing table must be created.
    #[serde(default = "defaults::capacity")]
    pub read_capacity: u32,
    #[serde(default = "defaults::capacity")]
    pub write_capacity: u32,

    /// Port of the worker-count health endpoint, if any.
    #[serde(default)]
    pub health_port: Option<u16>,
}

mod defaults {
    use std::time::Duration;

    pub fn lease_duration() -> Duration {
        Duration::from_secs(10)
    }
    pub fn report_period() -> Duration {
        Duration::from_secs(1)
    }
    pub fn fetch_period() -> Duration {
        Duration::from_secs(5)
    }
    pub fn gc_interval() -> Duration {
        Duration::from_secs(60)
    }
    pub fn member_ttl() -> Duration {
        Duration::from_secs(5)
    }
    pub fn stop_grace() -> Duration {
        Duration::from_secs(40)
    }
    pub fn capacity() -> u32 {
        10
    }
}

impl Config {
    /// A Config with the given identities and every tunable at its default.
    pub fn new(
        stream_name: impl Into<String>,
        table_name: impl Into<String>,
        worker_program: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            table_name: table_name.into(),
            stream_config: None,
            worker_program: worker_program.into(),
            worker_args: Vec::new(),
            starting_iterator: StartingIterator::default(),
            lease_duration: defaults::lease_duration(),
            report_period: defaults::report_period(),
            fetch_period: defaults::fetch_period(),
            gc_interval: defaults::gc_interval(),
            member_ttl: defaults::member_ttl(),
            stop_grace: defaults::stop_grace(),
            read_capacity: defaults::capacity(),
            write_capacity: defaults::capacity(),
            health_port: None,
        }
    }
}

/// Run one coordinator instance against the given table store and stream
/// client until `shutdown` resolves. Only a bootstrap failure is fatal;
/// it stops any started workers and surfaces the terminal error once, as
/// this function's return.
pub async fn run<S, C>(
    config: Config,
    store: Arc<S>,
    stream: C,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()>
where
    S: Store,
    C: StreamClient,
{
    let mut coordinator = Coordinator::new(config.clone(), store.clone(), stream);
    tracing::info!(
        instance = %coordinator.self_id(),
        stream = %config.stream_name,
        "coordinator starting"
    );

    // Bootstrap: the backing table must exist before any loop runs.
    if let Err(err) = store
        .ensure_tables(config.read_capacity, config.write_capacity)
        .await
    {
        let err = anyhow::Error::new(err).context("failed to ensure the backing table exists");
        tracing::error!(?err, "bootstrap failed; stopping all consumers");
        coordinator.shutdown().await;
        return Err(err);
    }

    let health = config.health_port.map(|port| {
        let supervisor = coordinator.supervisor().clone();
        tokio::spawn(async move {
            if let Err(err) = health::serve(port, supervisor).await {
                tracing::error!(?err, "health endpoint failed");
            }
        })
    });

    let mut report = tokio::time::interval(config.report_period);
    report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Jitter the fetch cadence by 10% in either direction, so instance
    // scans don't align fleet-wide.
    let jitter = 0.9 + rand::random::<f64>() * 0.2;
    let mut fetch = tokio::time::interval(config.fetch_period.mul_f64(jitter));
    fetch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = report.tick() => coordinator.tick_report().await,
            _ = fetch.tick() => coordinator.tick_fetch().await,
            () = &mut shutdown => break,
        }
    }

    tracing::info!(instance = %coordinator.self_id(), "coordinator stopping");
    coordinator.shutdown().await;

    if let Some(health) = health {
        health.abort();
    }
    Ok(())
}
