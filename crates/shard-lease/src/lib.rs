mod lease;
mod member;
mod memory;
mod store;

pub use lease::{Lease, LeaseClient};
pub use member::{ClusterClient, Member};
pub use memory::MemoryStore;
pub use store::{LeaseUpdate, Store};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The row's stored counter didn't match the caller's expectation, or a
    /// conditional insert found the row already present. This is a normal
    /// outcome of the protocol: the caller re-reads and re-decides.
    #[error("conditional write for shard '{0}' failed: the row changed concurrently")]
    Conflict(String),
    #[error("no row exists for shard '{0}'")]
    NotFound(String),
    #[error("table access failed")]
    Storage(#[from] anyhow::Error),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// Current wall-clock time as milliseconds since the epoch, the resolution
/// and representation of every `expires_at` stored in the table.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
