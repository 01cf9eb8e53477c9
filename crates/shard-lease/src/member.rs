use crate::store::Store;
use crate::{now_millis, Error};
use std::sync::Arc;
use std::time::Duration;

/// Member is one coordinator instance's liveness row: its generated id,
/// the worker count it last reported, and an expiry after which peers
/// treat it as dead.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    pub active_consumers: u32,
    pub expires_at: i64,
}

impl Member {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at < now_millis
    }
}

/// ClusterClient publishes and reads instance liveness rows.
#[derive(Clone)]
pub struct ClusterClient<S> {
    store: Arc<S>,
    member_ttl: Duration,
}

impl<S: Store> ClusterClient<S> {
    pub fn new(store: Arc<S>, member_ttl: Duration) -> Self {
        Self { store, member_ttl }
    }

    /// Unconditionally upsert this instance's row with a fresh expiry.
    pub async fn report(&self, id: &str, active_consumers: u32) -> Result<(), Error> {
        self.store
            .put_member(&Member {
                id: id.to_string(),
                active_consumers,
                expires_at: now_millis() + self.member_ttl.as_millis() as i64,
            })
            .await
    }

    /// Scan all member rows, including the caller's own. Callers filter.
    pub async fn fetch_all(&self) -> Result<Vec<Member>, Error> {
        self.store.scan_members().await
    }

    /// Delete rows whose expiry has passed. Any peer may sweep.
    pub async fn garbage_collect(&self) -> Result<usize, Error> {
        self.store.delete_expired_members(now_millis()).await
    }
}
