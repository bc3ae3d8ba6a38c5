use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

const COMPRESSION_LEVEL: i32 = 3;

/// Permission bits worth restoring, if the platform has them.
#[cfg(unix)]
pub fn file_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn file_mode(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
pub async fn set_file_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
pub async fn set_file_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Pre-apply copy of one file.
#[derive(Clone, Debug)]
pub struct FileSnapshot {
    compressed: Vec<u8>,
    original_len: usize,
    mode: Option<u32>,
}

impl FileSnapshot {
    pub fn contents(&self) -> io::Result<Vec<u8>> {
        zstd::decode_all(&self.compressed[..])
    }

    pub fn original_len(&self) -> usize {
        self.original_len
    }

    pub fn compressed_len(&self) -> usize {
        self.compressed.len()
    }

    /// Unix permission bits captured alongside the bytes.
    pub fn mode(&self) -> Option<u32> {
        self.mode
    }
}

/// Append-only store of file snapshots keyed by their original path.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    entries: BTreeMap<PathBuf, FileSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `bytes` for `path`. The first snapshot of a path wins; later
    /// inserts return `false` and leave it untouched.
    pub fn insert(&mut self, path: &Path, bytes: &[u8], mode: Option<u32>) -> io::Result<bool> {
        if self.entries.contains_key(path) {
            return Ok(false);
        }
        let compressed = zstd::encode_all(bytes, COMPRESSION_LEVEL)?;
        self.entries.insert(
            path.to_path_buf(),
            FileSnapshot {
                compressed,
                original_len: bytes.len(),
                mode,
            },
        );
        Ok(true)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<&FileSnapshot> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &FileSnapshot)> {
        self.entries
            .iter()
            .map(|(path, snapshot)| (path.as_path(), snapshot))
    }
}
