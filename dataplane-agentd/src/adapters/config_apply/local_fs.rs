use crate::domain::config_apply::snapshot::{file_mode, set_file_mode};
use crate::domain::config_apply::BundleFile;
use crate::ports::config_apply::{ConfigFileSystem, OnDiskFile};
use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const TMP_SUFFIX: &str = ".tmp";

/// Sibling path used while a file is being replaced.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Writes `bytes` next to `path` and renames it into place, so readers see
/// either the old or the new contents.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp)
        .await
        .with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    file.sync_all().await?;
    drop(file);

    if let Some(mode) = mode {
        set_file_mode(&tmp, mode)
            .await
            .with_context(|| format!("setting mode {mode:o} on {}", tmp.display()))?;
    }
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err).with_context(|| format!("renaming into {}", path.display()));
    }
    Ok(())
}

/// Writes managed files straight to the local disk.
#[derive(Debug, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConfigFileSystem for LocalFileSystem {
    async fn write(&self, file: &BundleFile) -> anyhow::Result<()> {
        // Without an explicit mode the replaced file keeps its permissions.
        let mode = match file.mode {
            Some(mode) => Some(mode),
            None => match fs::metadata(&file.path).await {
                Ok(metadata) => file_mode(&metadata),
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("reading metadata of {}", file.path.display()))
                }
            },
        };
        write_atomic(&file.path, &file.contents, mode).await
    }

    async fn inspect(&self, path: &Path) -> anyhow::Result<Option<OnDiskFile>> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading metadata of {}", path.display()))
            }
        };
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let contents = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(OnDiskFile {
            digest: hex::encode(Sha256::digest(&contents)),
            mode: file_mode(&metadata),
        }))
    }

    async fn read(&self, path: &Path) -> anyhow::Result<BundleFile> {
        let metadata = fs::metadata(path)
            .await
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let contents = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file = BundleFile::new(path, contents);
        Ok(match file_mode(&metadata) {
            Some(mode) => file.with_mode(mode),
            None => file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_creates_parents_and_leaves_no_temp_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conf.d/site.conf");
        let fs = LocalFileSystem::new();
        fs.write(&BundleFile::new(&path, "server {}\n")).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "server {}\n");
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("site.conf")]);
    }

    #[tokio::test]
    async fn inspect_reports_digest_and_absence() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nginx.conf");
        let fs = LocalFileSystem::new();
        assert_eq!(fs.inspect(&path).await.unwrap(), None);

        let file = BundleFile::new(&path, "events {}\n");
        fs.write(&file).await.unwrap();
        let on_disk = fs.inspect(&path).await.unwrap().unwrap();
        assert!(on_disk.matches(&file));
        assert!(!on_disk.matches(&BundleFile::new(&path, "events { }\n")));
        assert!(fs.inspect(temp.path()).await.is_err());
    }

    #[tokio::test]
    async fn read_returns_what_write_stored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mime.types");
        let fs = LocalFileSystem::new();
        assert!(fs.read(&path).await.is_err());

        let file = BundleFile::new(&path, "types { text/html html; }\n");
        fs.write(&file).await.unwrap();
        let read = fs.read(&path).await.unwrap();
        assert_eq!(read.path, path);
        assert_eq!(read.contents, file.contents);
        assert!(fs.inspect(&path).await.unwrap().unwrap().matches(&read));
        assert!(fs.read(temp.path()).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn explicit_mode_is_applied_and_existing_mode_kept() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.sh");
        let fs = LocalFileSystem::new();
        fs.write(&BundleFile::new(&path, "#!/bin/sh\n").with_mode(0o750))
            .await
            .unwrap();
        let mode = |path: &Path| std::fs::metadata(path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode(&path), 0o750);

        fs.write(&BundleFile::new(&path, "#!/bin/sh\nexit 0\n"))
            .await
            .unwrap();
        assert_eq!(mode(&path), 0o750);
        assert_eq!(
            fs.inspect(&path).await.unwrap().unwrap().mode,
            Some(0o750)
        );
    }
}
