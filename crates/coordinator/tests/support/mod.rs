use shard_lease::{Error, Lease, LeaseUpdate, Member, MemoryStore, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn config(worker: &str) -> coordinator::Config {
    let mut config = coordinator::Config::new("events", "events-leases", worker);
    config.stop_grace = Duration::from_millis(400);
    config
}

/// A Store whose bootstrap probe always fails, as when the backing table
/// can't be created or reached.
#[derive(Default)]
pub struct UnreachableStore(MemoryStore);

#[async_trait::async_trait]
impl Store for UnreachableStore {
    async fn ensure_tables(&self, _read_capacity: u32, _write_capacity: u32) -> Result<(), Error> {
        Err(Error::Storage(anyhow::anyhow!("table probe timed out")))
    }

    async fn scan_leases(&self) -> Result<Vec<Lease>, Error> {
        self.0.scan_leases().await
    }

    async fn insert_lease(&self, lease: &Lease) -> Result<(), Error> {
        self.0.insert_lease(lease).await
    }

    async fn update_lease(
        &self,
        shard_id: &str,
        expect: u64,
        update: LeaseUpdate,
    ) -> Result<Lease, Error> {
        self.0.update_lease(shard_id, expect, update).await
    }

    async fn scan_members(&self) -> Result<Vec<Member>, Error> {
        self.0.scan_members().await
    }

    async fn put_member(&self, member: &Member) -> Result<(), Error> {
        self.0.put_member(member).await
    }

    async fn delete_expired_members(&self, now_millis: i64) -> Result<usize, Error> {
        self.0.delete_expired_members(now_millis).await
    }
}

/// A Store with one-shot fault injection on the membership operations,
/// modeling a transient table throttle.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_next_member_scan: AtomicBool,
    fail_next_member_put: AtomicBool,
}

impl FlakyStore {
    pub fn fail_next_member_scan(&self) {
        self.fail_next_member_scan.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_member_put(&self) {
        self.fail_next_member_put.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Store for FlakyStore {
    async fn ensure_tables(&self, read_capacity: u32, write_capacity: u32) -> Result<(), Error> {
        self.inner.ensure_tables(read_capacity, write_capacity).await
    }

    async fn scan_leases(&self) -> Result<Vec<Lease>, Error> {
        self.inner.scan_leases().await
    }

    async fn insert_lease(&self, lease: &Lease) -> Result<(), Error> {
        self.inner.insert_lease(lease).await
    }

    async fn update_lease(
        &self,
        shard_id: &str,
        expect: u64,
        update: LeaseUpdate,
    ) -> Result<Lease, Error> {
        self.inner.update_lease(shard_id, expect, update).await
    }

    async fn scan_members(&self) -> Result<Vec<Member>, Error> {
        if self.fail_next_member_scan.swap(false, Ordering::SeqCst) {
            return Err(Error::Storage(anyhow::anyhow!("throttled")));
        }
        self.inner.scan_members().await
    }

    async fn put_member(&self, member: &Member) -> Result<(), Error> {
        if self.fail_next_member_put.swap(false, Ordering::SeqCst) {
            return Err(Error::Storage(anyhow::anyhow!("throttled")));
        }
        self.inner.put_member(member).await
    }

    async fn delete_expired_members(&self, now_millis: i64) -> Result<usize, Error> {
        self.inner.delete_expired_members(now_millis).await
    }
}
