use anyhow::Context;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Environment variable carrying the serialized WorkerOptions record to a
/// spawned worker process.
pub const OPTIONS_ENV: &str = "SHARD_WORKER_OPTIONS";

/// StartingIterator selects where a fresh worker begins reading its shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartingIterator {
    #[default]
    Latest,
    TrimHorizon,
    AtSequenceNumber,
    AfterSequenceNumber,
}

/// WorkerOptions is the record handed to a worker through OPTIONS_ENV.
/// The worker uses it to locate its shard and to run the lease protocol:
/// a None counter means "claim a fresh lease", Some means "take over at
/// this counter".
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOptions {
    pub table_name: String,
    pub stream_name: String,
    /// Opaque stream connection blob, forwarded untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_config: Option<serde_json::Value>,
    pub starting_iterator: StartingIterator,
    pub shard_id: String,
    pub initial_lease_counter: Option<u64>,
}

/// Message is the structured control message written to a worker's stdin.
/// Today there is only `{"type":"shutdown"}`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Shutdown,
}

/// Handle identifies one live worker of this supervisor. Handles are
/// allocated monotonically, so the smallest handle is the oldest worker.
pub type Handle = u64;

/// WorkerInfo is a point-in-time snapshot of one live worker.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub handle: Handle,
    pub shard_id: String,
    pub lease_counter: Option<u64>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

struct Worker {
    shard_id: String,
    lease_counter: Option<u64>,
    started_at: chrono::DateTime<chrono::Utc>,
    child: Arc<shared_child::SharedChild>,
    // Piped stdin of the child, taken by the first stop.
    stdin: Option<tokio::fs::File>,
    exited: tokio::sync::watch::Receiver<bool>,
}

/// Supervisor spawns and stops one isolated OS process per acquired shard.
/// Process isolation is a requirement of the design: a crashing worker
/// cannot corrupt this state or pin resources in this address space. The
/// supervisor observes exit codes but doesn't interpret them beyond log
/// severity.
pub struct Supervisor {
    program: PathBuf,
    args: Vec<String>,
    table_name: String,
    stream_name: String,
    stream_config: Option<serde_json::Value>,
    starting_iterator: StartingIterator,
    grace: Duration,
    next_handle: AtomicU64,
    reset: AtomicBool,
    workers: Arc<Mutex<BTreeMap<Handle, Worker>>>,
}

impl Supervisor {
    pub fn new(config: &crate::Config) -> Self {
        Self {
            program: config.worker_program.clone(),
            args: config.worker_args.clone(),
            table_name: config.table_name.clone(),
            stream_name: config.stream_name.clone(),
            stream_config: config.stream_config.clone(),
            starting_iterator: config.starting_iterator,
            grace: config.stop_grace,
            next_handle: AtomicU64::new(0),
            reset: AtomicBool::new(false),
            workers: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Start a worker for `shard_id`, returning its handle immediately.
    /// The child performs the lease CAS itself; if it loses the race it
    /// exits non-zero and its handle is pruned by the monitor.
    pub fn spawn(&self, shard_id: &str, lease_counter: Option<u64>) -> anyhow::Result<Handle> {
        if self.reset.load(Ordering::SeqCst) {
            anyhow::bail!("supervisor is resetting and won't start new workers");
        }

        let options = WorkerOptions {
            table_name: self.table_name.clone(),
            stream_name: self.stream_name.clone(),
            stream_config: self.stream_config.clone(),
            starting_iterator: self.starting_iterator,
            shard_id: shard_id.to_string(),
            initial_lease_counter: lease_counter,
        };
        let options = serde_json::to_string(&options).context("failed to encode worker options")?;

        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args)
            .env(OPTIONS_ENV, options)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker {:?}", self.program))?;
        let stdin = map_stdio(child.stdin.take());
        let child = Arc::new(
            shared_child::SharedChild::new(child).context("failed to wrap spawned worker")?,
        );

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, exit_rx) = tokio::sync::watch::channel(false);

        tracing::info!(
            handle,
            shard = shard_id,
            counter = ?lease_counter,
            pid = child.id(),
            "spawned shard worker"
        );

        self.workers.lock().unwrap().insert(
            handle,
            Worker {
                shard_id: shard_id.to_string(),
                lease_counter,
                started_at: chrono::Utc::now(),
                child: child.clone(),
                stdin,
                exited: exit_rx,
            },
        );

        // Monitor: reap the child and prune its handle once it exits.
        let workers = self.workers.clone();
        let shard = shard_id.to_string();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait())
                .await
                .expect("wait does not panic");

            match status {
                Ok(status) if status.success() => {
                    tracing::info!(handle, shard = %shard, "worker exited cleanly")
                }
                Ok(status) => {
                    tracing::error!(handle, shard = %shard, %status, "worker exited with error")
                }
                Err(err) => {
                    tracing::error!(handle, shard = %shard, ?err, "failed to await worker exit")
                }
            }

            workers.lock().unwrap().remove(&handle);
            let _ = exit_tx.send(true);
        });

        Ok(handle)
    }

    /// Stop one worker: send the structured shutdown message, close its
    /// stdin, and kill it if it hasn't exited within the grace period.
    /// Resolves once the child exits or the kill is issued. Stopping an
    /// unknown (already exited) handle is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, handle: Handle) {
        let (child, stdin, mut exited) = {
            let mut workers = self.workers.lock().unwrap();
            let Some(worker) = workers.get_mut(&handle) else {
                return;
            };
            (worker.child.clone(), worker.stdin.take(), worker.exited.clone())
        };

        // Write the shutdown message and close the pipe, so workers may key
        // off either the message or stdin EOF. A worker that already died
        // has closed its end; that's not an error here.
        if let Some(mut stdin) = stdin {
            let mut line = serde_json::to_vec(&Message::Shutdown).expect("message serializes");
            line.push(b'\n');

            if let Err(err) = stdin.write_all(&line).await {
                tracing::debug!(handle, ?err, "failed to write shutdown message");
            }
            if let Err(err) = stdin.flush().await {
                tracing::debug!(handle, ?err, "failed to flush shutdown message");
            }
        }

        let stop_result = tokio::time::timeout(self.grace, exited.wait_for(|exited| *exited)).await;
        match stop_result {
            Ok(_) => tracing::debug!(handle, "worker stopped within the grace period"),
            Err(_elapsed) => {
                tracing::warn!(handle, grace = ?self.grace, "worker outlived the grace period; killing");
                if let Err(err) = child.kill() {
                    tracing::error!(handle, ?err, "failed to kill worker");
                }
            }
        }
    }

    /// Latch against new spawns and stop every live worker concurrently.
    /// Resolves when the last stop does.
    pub async fn stop_all(&self) {
        self.reset.store(true, Ordering::SeqCst);

        let handles: Vec<Handle> = self.workers.lock().unwrap().keys().copied().collect();
        tracing::info!(count = handles.len(), "stopping all workers");

        let stops = handles.into_iter().map(|handle| self.stop(handle));
        let _: Vec<()> = futures::future::join_all(stops).await;
    }

    /// Number of live workers.
    pub fn count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Snapshot of every live worker.
    pub fn live(&self) -> Vec<WorkerInfo> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .map(|(handle, worker)| WorkerInfo {
                handle: *handle,
                shard_id: worker.shard_id.clone(),
                lease_counter: worker.lease_counter,
                started_at: worker.started_at,
            })
            .collect()
    }

    /// Handle of the longest-running worker, the deterministic choice when
    /// shedding load.
    pub fn oldest(&self) -> Option<Handle> {
        self.workers.lock().unwrap().keys().next().copied()
    }
}

// Map the child's piped stdin into a tokio File for async writes, routing
// through an OwnedFd so no raw descriptor is leaked.
fn map_stdio(f: Option<std::process::ChildStdin>) -> Option<tokio::fs::File> {
    let f: Option<std::os::fd::OwnedFd> = f.map(Into::into);
    let f: Option<std::fs::File> = f.map(Into::into);
    f.map(Into::into)
}
