/// StreamClient enumerates the shards of a named stream. The stream API
/// itself is an external collaborator; embedding hosts implement this for
/// their transport, and errors propagate unchanged so the allocation
/// controller can skip the tick.
#[async_trait::async_trait]
pub trait StreamClient: Send + Sync + 'static {
    async fn list_shards(&self, stream_name: &str) -> anyhow::Result<Vec<String>>;
}

/// StaticShards serves a fixed shard topology, for tests and local use.
#[derive(Debug, Clone)]
pub struct StaticShards(pub Vec<String>);

impl StaticShards {
    pub fn new<I, S>(shard_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(shard_ids.into_iter().map(Into::into).collect())
    }
}

#[async_trait::async_trait]
impl StreamClient for StaticShards {
    async fn list_shards(&self, _stream_name: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}
