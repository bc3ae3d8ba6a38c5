use crate::domain::config_apply::BundleFile;
use async_trait::async_trait;
use std::path::Path;

/// Digest and permission bits of a file as it currently sits on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnDiskFile {
    pub digest: String,
    pub mode: Option<u32>,
}

impl OnDiskFile {
    pub fn matches(&self, file: &BundleFile) -> bool {
        self.digest == file.digest() && file.mode.map_or(true, |mode| Some(mode) == self.mode)
    }
}

#[async_trait]
pub trait ConfigFileSystem: Send + Sync {
    async fn write(&self, file: &BundleFile) -> anyhow::Result<()>;

    /// `None` when nothing exists at `path`.
    async fn inspect(&self, path: &Path) -> anyhow::Result<Option<OnDiskFile>>;

    /// Reads a managed file back into bundle form, keeping its mode.
    async fn read(&self, path: &Path) -> anyhow::Result<BundleFile>;
}
