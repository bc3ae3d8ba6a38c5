use super::local_fs::write_atomic;
use crate::domain::config_apply::Manifest;
use crate::ports::config_apply::ManifestRepository;
use anyhow::Context;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Manifest kept as pretty JSON on disk.
pub struct FileManifestRepository {
    path: PathBuf,
}

impl FileManifestRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ManifestRepository for FileManifestRepository {
    async fn load(&self) -> anyhow::Result<Manifest> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading manifest {}", self.path.display()))
            }
        };
        if data.is_empty() {
            return Ok(Manifest::default());
        }
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing manifest {}", self.path.display()))
    }

    async fn store(&self, manifest: &Manifest) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.path, &json, None).await
    }
}
