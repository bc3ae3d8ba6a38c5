use crate::domain::config_apply::Manifest;
use async_trait::async_trait;

#[async_trait]
pub trait ManifestRepository: Send + Sync {
    async fn load(&self) -> anyhow::Result<Manifest>;
    async fn store(&self, manifest: &Manifest) -> anyhow::Result<()>;
}
