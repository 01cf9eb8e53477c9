use crate::{Error, Lease, Member};

/// LeaseUpdate is the attribute set written by one conditional lease update.
/// `lease_counter` and `expires_at` are always written; the remaining
/// attributes only when set, leaving stored values untouched otherwise.
#[derive(Debug, Clone, Default)]
pub struct LeaseUpdate {
    pub lease_counter: u64,
    pub expires_at: i64,
    pub owner: Option<String>,
    pub checkpoint: Option<String>,
    pub is_finished: Option<bool>,
}

/// Store is the strongly-consistent key/value table backing shard leases
/// and cluster membership. Implementations surface a failed write
/// precondition as [`Error::Conflict`] and an absent row as
/// [`Error::NotFound`]; everything else maps to [`Error::Storage`].
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Probe for the backing table(s) and create them with the given
    /// provisioned capacity if absent. Must be idempotent.
    async fn ensure_tables(&self, read_capacity: u32, write_capacity: u32) -> Result<(), Error>;

    /// Scan every lease row. Pagination is hidden by the implementation,
    /// and rows are returned in stored order.
    async fn scan_leases(&self) -> Result<Vec<Lease>, Error>;

    /// Insert `lease`, conditioned on no row existing for its shard.
    async fn insert_lease(&self, lease: &Lease) -> Result<(), Error>;

    /// Update the row for `shard_id`, conditioned on its stored counter
    /// equalling `expect`, and return the row as written.
    async fn update_lease(
        &self,
        shard_id: &str,
        expect: u64,
        update: LeaseUpdate,
    ) -> Result<Lease, Error>;

    /// Scan every cluster-member row.
    async fn scan_members(&self) -> Result<Vec<Member>, Error>;

    /// Unconditionally upsert a cluster-member row.
    async fn put_member(&self, member: &Member) -> Result<(), Error>;

    /// Delete member rows whose expiry precedes `now_millis`, in batches,
    /// returning how many were removed.
    async fn delete_expired_members(&self, now_millis: i64) -> Result<usize, Error>;
}
