use async_trait::async_trait;

/// Checks freshly written configuration before it is committed.
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    async fn validate(&self) -> anyhow::Result<()>;
}
