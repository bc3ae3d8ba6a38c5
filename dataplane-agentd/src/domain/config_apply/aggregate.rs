use super::snapshot::{file_mode, set_file_mode, FileSnapshot, SnapshotStore};
use super::value_object::{AllowedDirectories, PathPolicyError};
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error(transparent)]
    Policy(#[from] PathPolicyError),
    #[error("failed to stat {}: {source}", path.display())]
    Stat { path: PathBuf, source: io::Error },
    #[error("failed to snapshot {}: {source}", path.display())]
    Snapshot { path: PathBuf, source: io::Error },
    #[error("{} exists but is not a regular file", .0.display())]
    NotAFile(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOperation {
    Delete,
    Restore,
    SetPermissions,
    RemoveDir,
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileOperation::Delete => "delete",
            FileOperation::Restore => "restore",
            FileOperation::SetPermissions => "set permissions on",
            FileOperation::RemoveDir => "remove directory",
        })
    }
}

/// A single filesystem step that failed while the transaction kept going.
#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub operation: FileOperation,
    pub error: io::Error,
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to {} {}: {}",
            self.operation,
            self.path.display(),
            self.error
        )
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub purged: Vec<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
#[error("commit could not purge {} orphaned file(s)", failures.len())]
pub struct CommitError {
    pub purged: Vec<PathBuf>,
    pub failures: Vec<FileFailure>,
}

/// Returned by every rollback. `failures` is empty when the prior on-disk
/// state was restored completely.
#[derive(Debug)]
pub struct RollbackError {
    pub cause: anyhow::Error,
    pub failures: Vec<FileFailure>,
}

impl RollbackError {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            write!(f, "rolled back after: {:#}", self.cause)
        } else {
            write!(
                f,
                "rollback incomplete ({} failure(s)) after: {:#}",
                self.failures.len(),
                self.cause
            )?;
            for failure in &self.failures {
                write!(f, "; {failure}")?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for RollbackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.cause)
    }
}

enum PathKind {
    File(std::fs::Metadata),
    Absent,
    Other,
}

async fn stat(path: &Path) -> Result<PathKind, TransactionError> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(PathKind::File(metadata)),
        Ok(_) => Ok(PathKind::Other),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PathKind::Absent),
        Err(source) => Err(TransactionError::Stat {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Tracks the on-disk state of managed files across one configuration apply.
///
/// Every observed path sits in exactly one of `existing`, `not_exists` or the
/// snapshot store. `commit` purges what is still `existing`; `rollback`
/// replays snapshots and deletes whatever did not exist before.
#[derive(Debug)]
pub struct ConfigApplyTransaction {
    allowed: AllowedDirectories,
    existing: BTreeSet<PathBuf>,
    not_exists: BTreeSet<PathBuf>,
    not_exist_dirs: BTreeSet<PathBuf>,
    marked_absent: BTreeSet<PathBuf>,
    snapshots: SnapshotStore,
}

impl ConfigApplyTransaction {
    /// Inspects the currently managed `paths`. Paths outside `allowed` are
    /// skipped and never touched.
    pub async fn open<I, P>(paths: I, allowed: AllowedDirectories) -> Result<Self, TransactionError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut transaction = Self {
            allowed,
            existing: BTreeSet::new(),
            not_exists: BTreeSet::new(),
            not_exist_dirs: BTreeSet::new(),
            marked_absent: BTreeSet::new(),
            snapshots: SnapshotStore::new(),
        };

        for path in paths {
            let path = path.as_ref();
            if !transaction.allowed.contains(path) {
                warn!(path = %path.display(), "managed path outside allowed directories, not tracking");
                continue;
            }
            match stat(path).await? {
                PathKind::File(_) => {
                    transaction.existing.insert(path.to_path_buf());
                }
                PathKind::Absent => {
                    transaction.not_exists.insert(path.to_path_buf());
                }
                PathKind::Other => return Err(TransactionError::NotAFile(path.to_path_buf())),
            }
        }

        debug!(
            existing = transaction.existing.len(),
            not_exists = transaction.not_exists.len(),
            "config apply transaction opened"
        );
        Ok(transaction)
    }

    pub fn existing(&self) -> &BTreeSet<PathBuf> {
        &self.existing
    }

    pub fn not_exists(&self) -> &BTreeSet<PathBuf> {
        &self.not_exists
    }

    pub fn not_exist_dirs(&self) -> &BTreeSet<PathBuf> {
        &self.not_exist_dirs
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn allowed(&self) -> &AllowedDirectories {
        &self.allowed
    }

    /// Declares that `path` is about to be written.
    pub async fn mark_and_save(&mut self, path: &Path) -> Result<(), TransactionError> {
        self.allowed.check(path)?;
        if self.snapshots.contains(path) || self.marked_absent.contains(path) {
            return Ok(());
        }

        match stat(path).await? {
            PathKind::File(metadata) => {
                let bytes = fs::read(path)
                    .await
                    .map_err(|source| TransactionError::Snapshot {
                        path: path.to_path_buf(),
                        source,
                    })?;
                self.snapshots
                    .insert(path, &bytes, file_mode(&metadata))
                    .map_err(|source| TransactionError::Snapshot {
                        path: path.to_path_buf(),
                        source,
                    })?;
                self.existing.remove(path);
                self.not_exists.remove(path);
                debug!(path = %path.display(), bytes = bytes.len(), "snapshotted file");
            }
            PathKind::Absent => {
                self.existing.remove(path);
                self.not_exists.insert(path.to_path_buf());
                self.marked_absent.insert(path.to_path_buf());
                self.record_missing_parent(path).await?;
                debug!(path = %path.display(), "marked absent file");
            }
            PathKind::Other => return Err(TransactionError::NotAFile(path.to_path_buf())),
        }
        Ok(())
    }

    // Records the topmost ancestor below the allowed root that does not exist
    // yet, so rollback can remove the whole subtree the apply created.
    async fn record_missing_parent(&mut self, path: &Path) -> Result<(), TransactionError> {
        let Some(root) = self.allowed.root_for(path).map(Path::to_path_buf) else {
            return Ok(());
        };
        let mut topmost = None;
        for dir in path.ancestors().skip(1) {
            if dir == root || !dir.starts_with(&root) {
                break;
            }
            match fs::metadata(dir).await {
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::NotFound => topmost = Some(dir),
                Err(source) => {
                    return Err(TransactionError::Stat {
                        path: dir.to_path_buf(),
                        source,
                    })
                }
            }
        }
        if let Some(dir) = topmost {
            self.not_exist_dirs.insert(dir.to_path_buf());
        }
        Ok(())
    }

    /// Accepts the new state: deletes every managed file that was never
    /// marked and drops the snapshots.
    pub async fn commit(self) -> Result<CommitSummary, CommitError> {
        let mut purged = Vec::new();
        let mut failures = Vec::new();
        for path in self.existing {
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "purged orphaned file");
                    purged.push(path);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(error) => failures.push(FileFailure {
                    path,
                    operation: FileOperation::Delete,
                    error,
                }),
            }
        }

        if failures.is_empty() {
            Ok(CommitSummary { purged })
        } else {
            Err(CommitError { purged, failures })
        }
    }

    /// Restores the pre-apply state. Always yields a `RollbackError` carrying
    /// `cause`; secondary failures are collected rather than aborting.
    pub async fn rollback(self, cause: anyhow::Error) -> RollbackError {
        let mut failures = Vec::new();

        for (path, snapshot) in self.snapshots.iter() {
            if let Err(failure) = restore(path, snapshot).await {
                failures.push(failure);
            }
        }

        for path in &self.not_exists {
            match fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "removed file created by apply"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(error) => failures.push(FileFailure {
                    path: path.clone(),
                    operation: FileOperation::Delete,
                    error,
                }),
            }
        }

        for dir in &self.not_exist_dirs {
            match fs::remove_dir_all(dir).await {
                Ok(()) => debug!(path = %dir.display(), "removed directory created by apply"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(error) => failures.push(FileFailure {
                    path: dir.clone(),
                    operation: FileOperation::RemoveDir,
                    error,
                }),
            }
        }

        if !failures.is_empty() {
            warn!(failures = failures.len(), "rollback left files in an inconsistent state");
        }
        RollbackError { cause, failures }
    }
}

async fn restore(path: &Path, snapshot: &FileSnapshot) -> Result<(), FileFailure> {
    let failed = |operation, error| FileFailure {
        path: path.to_path_buf(),
        operation,
        error,
    };
    let bytes = snapshot
        .contents()
        .map_err(|err| failed(FileOperation::Restore, err))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| failed(FileOperation::Restore, err))?;
    }
    fs::write(path, bytes)
        .await
        .map_err(|err| failed(FileOperation::Restore, err))?;
    if let Some(mode) = snapshot.mode() {
        set_file_mode(path, mode)
            .await
            .map_err(|err| failed(FileOperation::SetPermissions, err))?;
    }
    debug!(path = %path.display(), "restored snapshot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONF: &str = "daemon off;\nworker_processes 2;\ninclude default.conf;\n";
    const DEFAULT_CONF: &str = "http { server { listen 127.0.0.1:80; root /srv/root; } }\n";

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        conf: PathBuf,
        default_conf: PathBuf,
        docroot_files: Vec<PathBuf>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().to_path_buf();
            let docroot = root.join("root");
            std::fs::create_dir(&docroot).unwrap();
            let docroot_files: Vec<PathBuf> = (1..=3)
                .map(|n| docroot.join(format!("root{n}.html")))
                .collect();
            for file in &docroot_files {
                std::fs::write(file, b"").unwrap();
            }
            let conf = root.join("nginx.conf");
            let default_conf = root.join("default_nginx.conf");
            std::fs::write(&conf, CONF).unwrap();
            std::fs::write(&default_conf, DEFAULT_CONF).unwrap();
            Self {
                _temp: temp,
                root,
                conf,
                default_conf,
                docroot_files,
            }
        }

        fn allowed(&self) -> AllowedDirectories {
            AllowedDirectories::new([&self.root]).unwrap()
        }

        fn managed(&self) -> Vec<PathBuf> {
            let mut paths = vec![self.conf.clone(), self.default_conf.clone()];
            paths.extend(self.docroot_files.iter().cloned());
            paths
        }
    }

    #[tokio::test]
    async fn open_classifies_paths() {
        let fixture = Fixture::new();
        let missing = fixture.root.join("missing.conf");
        let mut paths = fixture.managed();
        paths.push(missing.clone());
        paths.push(PathBuf::from("/outside/allowed.conf"));

        let tx = ConfigApplyTransaction::open(&paths, fixture.allowed())
            .await
            .unwrap();
        assert_eq!(tx.existing().len(), 5);
        assert_eq!(tx.not_exists().iter().collect::<Vec<_>>(), vec![&missing]);
        assert!(tx.not_exist_dirs().is_empty());
        assert!(tx.snapshots().is_empty());
    }

    #[tokio::test]
    async fn mark_and_save_records_state() {
        let fixture = Fixture::new();
        let mut tx = ConfigApplyTransaction::open(Vec::<PathBuf>::new(), fixture.allowed())
            .await
            .unwrap();

        let unknown = fixture.root.join("unknown.conf");
        tx.mark_and_save(&unknown).await.unwrap();
        assert!(tx.not_exists().contains(&unknown));
        assert!(tx.not_exist_dirs().is_empty());

        tx.mark_and_save(&fixture.conf).await.unwrap();
        assert!(tx.snapshots().contains(&fixture.conf));
        assert!(!tx.existing().contains(&fixture.conf));

        let nested = fixture.root.join("unknown/nested/unknown.conf");
        tx.mark_and_save(&nested).await.unwrap();
        assert!(tx.not_exists().contains(&nested));
        assert_eq!(
            tx.not_exist_dirs().iter().collect::<Vec<_>>(),
            vec![&fixture.root.join("unknown")]
        );
    }

    #[tokio::test]
    async fn mark_and_save_rejects_paths_outside_allow_list() {
        let fixture = Fixture::new();
        let mut tx = ConfigApplyTransaction::open(fixture.managed(), fixture.allowed())
            .await
            .unwrap();
        let err = tx
            .mark_and_save(Path::new("/etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Policy(PathPolicyError::OutsideAllowed(_))
        ));
        let err = tx
            .mark_and_save(&fixture.root.join("root"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::NotAFile(_)));
    }

    #[tokio::test]
    async fn marking_twice_keeps_first_snapshot() {
        let fixture = Fixture::new();
        let mut tx = ConfigApplyTransaction::open(fixture.managed(), fixture.allowed())
            .await
            .unwrap();
        tx.mark_and_save(&fixture.conf).await.unwrap();
        std::fs::write(&fixture.conf, "rewritten").unwrap();
        tx.mark_and_save(&fixture.conf).await.unwrap();

        let err = tx.rollback(anyhow::anyhow!("validation failed")).await;
        assert!(err.is_complete());
        assert_eq!(std::fs::read_to_string(&fixture.conf).unwrap(), CONF);
    }

    #[tokio::test]
    async fn commit_keeps_marked_and_purges_unmarked() {
        let fixture = Fixture::new();
        let mut tx = ConfigApplyTransaction::open(fixture.managed(), fixture.allowed())
            .await
            .unwrap();
        tx.mark_and_save(&fixture.default_conf).await.unwrap();
        tx.mark_and_save(&fixture.conf).await.unwrap();

        let unknown = fixture.root.join("unknown.conf");
        tx.mark_and_save(&unknown).await.unwrap();
        std::fs::write(&unknown, b"").unwrap();

        let summary = tx.commit().await.unwrap();
        assert_eq!(summary.purged.len(), 3);
        assert!(fixture.conf.exists());
        assert!(fixture.default_conf.exists());
        assert!(unknown.exists());
        for file in &fixture.docroot_files {
            assert!(!file.exists(), "{} should be purged", file.display());
        }
    }

    #[tokio::test]
    async fn rollback_restores_marked_without_resurrecting_purged() {
        let fixture = Fixture::new();
        let mut tx = ConfigApplyTransaction::open(fixture.managed(), fixture.allowed())
            .await
            .unwrap();
        tx.mark_and_save(&fixture.default_conf).await.unwrap();
        tx.mark_and_save(&fixture.conf).await.unwrap();
        let unknown = fixture.root.join("unknown.conf");
        tx.mark_and_save(&unknown).await.unwrap();
        std::fs::write(&unknown, b"").unwrap();

        std::fs::remove_file(&fixture.conf).unwrap();
        std::fs::remove_file(&fixture.default_conf).unwrap();
        for file in &fixture.docroot_files {
            std::fs::remove_file(file).unwrap();
        }

        let err = tx.rollback(anyhow::anyhow!("error")).await;
        assert!(err.is_complete(), "unexpected failures: {err}");
        assert_eq!(std::fs::read_to_string(&fixture.conf).unwrap(), CONF);
        assert_eq!(
            std::fs::read_to_string(&fixture.default_conf).unwrap(),
            DEFAULT_CONF
        );
        assert!(!unknown.exists());
        for file in &fixture.docroot_files {
            assert!(!file.exists());
        }
    }

    #[tokio::test]
    async fn rollback_removes_created_directories() {
        let fixture = Fixture::new();
        let mut tx = ConfigApplyTransaction::open(Vec::<PathBuf>::new(), fixture.allowed())
            .await
            .unwrap();
        let nested = fixture.root.join("sites/enabled/app.conf");
        tx.mark_and_save(&nested).await.unwrap();
        std::fs::create_dir_all(nested.parent().unwrap()).unwrap();
        std::fs::write(&nested, b"server {}").unwrap();

        let err = tx.rollback(anyhow::anyhow!("nginx -t failed")).await;
        assert!(err.is_complete());
        assert!(!nested.exists());
        assert!(!fixture.root.join("sites").exists());
        assert!(fixture.root.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rollback_restores_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = Fixture::new();
        std::fs::set_permissions(&fixture.conf, std::fs::Permissions::from_mode(0o600)).unwrap();
        let mut tx = ConfigApplyTransaction::open(fixture.managed(), fixture.allowed())
            .await
            .unwrap();
        tx.mark_and_save(&fixture.conf).await.unwrap();
        std::fs::write(&fixture.conf, "changed").unwrap();
        std::fs::set_permissions(&fixture.conf, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = tx.rollback(anyhow::anyhow!("boom")).await;
        assert!(err.is_complete());
        let mode = std::fs::metadata(&fixture.conf).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn commit_purges_what_it_can_and_reports_the_rest() {
        let fixture = Fixture::new();
        let mut tx = ConfigApplyTransaction::open(fixture.managed(), fixture.allowed())
            .await
            .unwrap();
        tx.mark_and_save(&fixture.conf).await.unwrap();
        tx.mark_and_save(&fixture.default_conf).await.unwrap();

        // A non-empty directory where an orphan used to be cannot be unlinked.
        let stuck = &fixture.docroot_files[0];
        std::fs::remove_file(stuck).unwrap();
        std::fs::create_dir(stuck).unwrap();
        std::fs::write(stuck.join("index.html"), b"<html/>").unwrap();

        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.failures.len(), 1, "{err}");
        assert_eq!(&err.failures[0].path, stuck);
        assert_eq!(err.failures[0].operation, FileOperation::Delete);
        assert_eq!(err.purged.len(), 2);
        for file in &fixture.docroot_files[1..] {
            assert!(err.purged.contains(file));
            assert!(!file.exists());
        }
        assert!(stuck.join("index.html").exists());
        assert!(fixture.conf.exists());
    }

    #[tokio::test]
    async fn rollback_keeps_restoring_after_a_failed_restore() {
        let fixture = Fixture::new();
        let sites = fixture.root.join("sites");
        std::fs::create_dir(&sites).unwrap();
        let app = sites.join("app.conf");
        std::fs::write(&app, "server { listen 8080; }").unwrap();

        let mut paths = fixture.managed();
        paths.push(app.clone());
        let mut tx = ConfigApplyTransaction::open(&paths, fixture.allowed())
            .await
            .unwrap();
        tx.mark_and_save(&app).await.unwrap();
        tx.mark_and_save(&fixture.conf).await.unwrap();
        tx.mark_and_save(&fixture.default_conf).await.unwrap();
        std::fs::write(&fixture.conf, "broken").unwrap();
        std::fs::write(&fixture.default_conf, "broken").unwrap();

        // A plain file where the parent directory was blocks the restore.
        std::fs::remove_dir_all(&sites).unwrap();
        std::fs::write(&sites, b"not a directory").unwrap();

        let err = tx.rollback(anyhow::anyhow!("validation failed")).await;
        assert!(!err.is_complete());
        assert_eq!(err.failures.len(), 1, "{err}");
        assert_eq!(err.failures[0].path, app);
        assert_eq!(err.failures[0].operation, FileOperation::Restore);
        assert!(err.to_string().contains("rollback incomplete"));

        assert_eq!(std::fs::read_to_string(&fixture.conf).unwrap(), CONF);
        assert_eq!(
            std::fs::read_to_string(&fixture.default_conf).unwrap(),
            DEFAULT_CONF
        );
        for file in &fixture.docroot_files {
            assert!(file.exists(), "unmarked files stay on rollback");
        }
    }

    #[tokio::test]
    async fn rollback_error_wraps_cause() {
        let fixture = Fixture::new();
        let tx = ConfigApplyTransaction::open(fixture.managed(), fixture.allowed())
            .await
            .unwrap();
        let err = tx.rollback(anyhow::anyhow!("validator exited with 1")).await;
        assert!(err.to_string().contains("validator exited with 1"));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "validator exited with 1");
    }
}
