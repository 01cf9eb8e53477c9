use crate::store::{LeaseUpdate, Store};
use crate::{now_millis, Error};
use std::sync::Arc;
use std::time::Duration;

/// Lease is one shard's ownership row: a monotonic counter arbitrating
/// writes, the current owner, and an absolute expiry after which any
/// instance may take the shard over.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub shard_id: String,
    pub lease_counter: u64,
    pub expires_at: i64,
    pub owner: Option<String>,
    /// Opaque cursor persisted by the worker. The coordinator never
    /// interprets it.
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub is_finished: bool,
}

impl Lease {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at < now_millis
    }
}

/// LeaseClient speaks the compare-and-swap protocol over one shard's lease
/// row on behalf of a single owner. Every successful write increments the
/// row's counter; a Conflict means another party wrote first, and the
/// caller is expected to re-read and re-decide rather than retry here.
#[derive(Clone)]
pub struct LeaseClient<S> {
    store: Arc<S>,
    owner: String,
    lease_duration: Duration,
}

impl<S: Store> LeaseClient<S> {
    pub fn new(store: Arc<S>, owner: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            lease_duration,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Scan every lease row of the table.
    pub async fn fetch_all(&self) -> Result<Vec<Lease>, Error> {
        self.store.scan_leases().await
    }

    /// Claim a shard which has never been leased, conditioned on its row
    /// being absent.
    #[tracing::instrument(level = "debug", skip(self), fields(owner = %self.owner))]
    pub async fn claim_unheld(&self, shard_id: &str) -> Result<Lease, Error> {
        let lease = Lease {
            shard_id: shard_id.to_string(),
            lease_counter: 0,
            expires_at: self.fresh_expiry(),
            owner: Some(self.owner.clone()),
            checkpoint: None,
            is_finished: false,
        };
        self.store.insert_lease(&lease).await?;
        Ok(lease)
    }

    /// Take over a shard from its current (presumed expired) holder.
    /// Exactly one of two racing takeovers succeeds; the loser observes
    /// Conflict and abandons.
    #[tracing::instrument(level = "debug", skip(self), fields(owner = %self.owner))]
    pub async fn take_over(&self, shard_id: &str, expected_counter: u64) -> Result<Lease, Error> {
        self.store
            .update_lease(
                shard_id,
                expected_counter,
                LeaseUpdate {
                    lease_counter: expected_counter + 1,
                    expires_at: self.fresh_expiry(),
                    owner: Some(self.owner.clone()),
                    ..Default::default()
                },
            )
            .await
    }

    /// Extend this owner's hold on a shard. The write is identical to
    /// `take_over`; that the caller already owns the row is caller
    /// discipline, as the counter alone arbitrates.
    pub async fn renew(&self, shard_id: &str, expected_counter: u64) -> Result<Lease, Error> {
        self.take_over(shard_id, expected_counter).await
    }

    /// Renew while also persisting the worker's checkpoint cursor.
    #[tracing::instrument(level = "debug", skip(self, cursor), fields(owner = %self.owner))]
    pub async fn checkpoint(
        &self,
        shard_id: &str,
        expected_counter: u64,
        cursor: impl Into<String>,
    ) -> Result<Lease, Error> {
        self.store
            .update_lease(
                shard_id,
                expected_counter,
                LeaseUpdate {
                    lease_counter: expected_counter + 1,
                    expires_at: self.fresh_expiry(),
                    owner: Some(self.owner.clone()),
                    checkpoint: Some(cursor.into()),
                    ..Default::default()
                },
            )
            .await
    }

    /// Mark a fully-drained shard as finished. A finished row is never
    /// reclaimed.
    #[tracing::instrument(level = "debug", skip(self), fields(owner = %self.owner))]
    pub async fn mark_finished(&self, shard_id: &str, expected_counter: u64) -> Result<Lease, Error> {
        self.store
            .update_lease(
                shard_id,
                expected_counter,
                LeaseUpdate {
                    lease_counter: expected_counter + 1,
                    expires_at: self.fresh_expiry(),
                    owner: Some(self.owner.clone()),
                    is_finished: Some(true),
                    ..Default::default()
                },
            )
            .await
    }

    fn fresh_expiry(&self) -> i64 {
        now_millis() + self.lease_duration.as_millis() as i64
    }
}
