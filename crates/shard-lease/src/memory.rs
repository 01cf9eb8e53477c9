use crate::store::{LeaseUpdate, Store};
use crate::{Error, Lease, Member};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// MemoryStore is an in-process Store with the same conditional-write
/// semantics as a real table. It backs tests and local development, and
/// may be shared across simulated instances to exercise the protocol.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    leases: BTreeMap<String, Lease>,
    members: BTreeMap<String, Member>,
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn ensure_tables(&self, _read_capacity: u32, _write_capacity: u32) -> Result<(), Error> {
        Ok(())
    }

    async fn scan_leases(&self) -> Result<Vec<Lease>, Error> {
        Ok(self.inner.lock().unwrap().leases.values().cloned().collect())
    }

    async fn insert_lease(&self, lease: &Lease) -> Result<(), Error> {
        let mut tables = self.inner.lock().unwrap();

        if tables.leases.contains_key(&lease.shard_id) {
            return Err(Error::Conflict(lease.shard_id.clone()));
        }
        tables.leases.insert(lease.shard_id.clone(), lease.clone());
        Ok(())
    }

    async fn update_lease(
        &self,
        shard_id: &str,
        expect: u64,
        update: LeaseUpdate,
    ) -> Result<Lease, Error> {
        let mut tables = self.inner.lock().unwrap();

        let row = tables
            .leases
            .get_mut(shard_id)
            .ok_or_else(|| Error::NotFound(shard_id.to_string()))?;

        if row.lease_counter != expect {
            return Err(Error::Conflict(shard_id.to_string()));
        }

        row.lease_counter = update.lease_counter;
        row.expires_at = update.expires_at;
        if let Some(owner) = update.owner {
            row.owner = Some(owner);
        }
        if let Some(checkpoint) = update.checkpoint {
            row.checkpoint = Some(checkpoint);
        }
        if let Some(is_finished) = update.is_finished {
            row.is_finished = is_finished;
        }

        Ok(row.clone())
    }

    async fn scan_members(&self) -> Result<Vec<Member>, Error> {
        Ok(self.inner.lock().unwrap().members.values().cloned().collect())
    }

    async fn put_member(&self, member: &Member) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap()
            .members
            .insert(member.id.clone(), member.clone());
        Ok(())
    }

    async fn delete_expired_members(&self, now_millis: i64) -> Result<usize, Error> {
        let mut tables = self.inner.lock().unwrap();

        let before = tables.members.len();
        tables.members.retain(|_, member| !member.is_expired(now_millis));
        Ok(before - tables.members.len())
    }
}
