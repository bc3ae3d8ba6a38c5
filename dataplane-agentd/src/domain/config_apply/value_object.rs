use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathPolicyError {
    #[error("path {} is not absolute", .0.display())]
    Relative(PathBuf),
    #[error("path {} contains a parent directory component", .0.display())]
    ParentTraversal(PathBuf),
    #[error("path {} is outside the allowed directories", .0.display())]
    OutsideAllowed(PathBuf),
    #[error("path {} appears more than once in the bundle", .0.display())]
    Duplicate(PathBuf),
    #[error("no allowed directories configured")]
    Empty,
}

/// Directory allow-list bounding every filesystem mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowedDirectories(Vec<PathBuf>);

impl AllowedDirectories {
    pub fn new<I, P>(dirs: I) -> Result<Self, PathPolicyError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut normalized = Vec::new();
        for dir in dirs {
            let dir = normalize(&dir.into())?;
            if !normalized.contains(&dir) {
                normalized.push(dir);
            }
        }
        if normalized.is_empty() {
            return Err(PathPolicyError::Empty);
        }
        Ok(Self(normalized))
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.0
    }

    /// Returns the allowed directory containing `path`, compared component
    /// by component. The directory itself is not considered contained.
    pub fn root_for(&self, path: &Path) -> Option<&Path> {
        let path = normalize(path).ok()?;
        self.0
            .iter()
            .filter(|dir| path.starts_with(dir) && path != **dir)
            .max_by_key(|dir| dir.components().count())
            .map(PathBuf::as_path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.root_for(path).is_some()
    }

    pub fn check(&self, path: &Path) -> Result<(), PathPolicyError> {
        normalize(path)?;
        if self.contains(path) {
            Ok(())
        } else {
            Err(PathPolicyError::OutsideAllowed(path.to_path_buf()))
        }
    }
}

fn normalize(path: &Path) -> Result<PathBuf, PathPolicyError> {
    if !path.is_absolute() {
        return Err(PathPolicyError::Relative(path.to_path_buf()));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(PathPolicyError::ParentTraversal(path.to_path_buf()));
    }
    Ok(path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}

/// Result of one configuration apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    NoChange,
    RolledBack,
    RollbackFailed,
    Rejected,
}

impl ApplyOutcome {
    pub const ALL: [ApplyOutcome; 5] = [
        ApplyOutcome::Applied,
        ApplyOutcome::NoChange,
        ApplyOutcome::RolledBack,
        ApplyOutcome::RollbackFailed,
        ApplyOutcome::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::NoChange => "no_change",
            ApplyOutcome::RolledBack => "rolled_back",
            ApplyOutcome::RollbackFailed => "rollback_failed",
            ApplyOutcome::Rejected => "rejected",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Applied | ApplyOutcome::NoChange)
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single file of a configuration bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    pub path: PathBuf,
    #[serde(serialize_with = "encode_base64", deserialize_with = "decode_base64")]
    pub contents: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl BundleFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.contents))
    }
}

impl fmt::Debug for BundleFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleFile")
            .field("path", &self.path)
            .field("len", &self.contents.len())
            .field("mode", &self.mode)
            .finish()
    }
}

fn encode_base64<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn decode_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    STANDARD
        .decode(value.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// Complete desired state for the managed files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub config_id: String,
    pub files: Vec<BundleFile>,
}

impl ConfigBundle {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|file| file.path.as_path())
    }

    /// Rejects bundles that would touch anything outside `allowed`.
    pub fn preflight(&self, allowed: &AllowedDirectories) -> Result<(), PathPolicyError> {
        let mut seen = BTreeSet::new();
        for file in &self.files {
            allowed.check(&file.path)?;
            if !seen.insert(normalize(&file.path)?) {
                return Err(PathPolicyError::Duplicate(file.path.clone()));
            }
        }
        Ok(())
    }
}

/// Files owned by the currently applied configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub config_id: Option<String>,
    pub files: BTreeSet<PathBuf>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn from_bundle(bundle: &ConfigBundle) -> Self {
        Self {
            config_id: Some(bundle.config_id.clone()),
            files: bundle.paths().map(Path::to_path_buf).collect(),
            applied_at: Some(Utc::now()),
        }
    }

    /// Managed files the bundle no longer references.
    pub fn orphans<'a>(&'a self, bundle: &'a ConfigBundle) -> impl Iterator<Item = &'a PathBuf> {
        let wanted: BTreeSet<&Path> = bundle.paths().collect();
        self.files
            .iter()
            .filter(move |path| !wanted.contains(path.as_path()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> AllowedDirectories {
        AllowedDirectories::new(["/etc/nginx", "/var/www/./html"]).unwrap()
    }

    #[test]
    fn containment_is_component_wise() {
        let allowed = allowed();
        assert!(allowed.contains(Path::new("/etc/nginx/nginx.conf")));
        assert!(allowed.contains(Path::new("/var/www/html/index.html")));
        assert!(!allowed.contains(Path::new("/etc/nginx-evil/nginx.conf")));
        assert!(!allowed.contains(Path::new("/etc/nginx")));
        assert!(!allowed.contains(Path::new("/etc/nginx/../passwd")));
        assert!(!allowed.contains(Path::new("etc/nginx/nginx.conf")));
    }

    #[test]
    fn rejects_relative_allow_list_entries() {
        assert_eq!(
            AllowedDirectories::new(["conf"]).unwrap_err(),
            PathPolicyError::Relative(PathBuf::from("conf"))
        );
        assert_eq!(
            AllowedDirectories::new(Vec::<PathBuf>::new()).unwrap_err(),
            PathPolicyError::Empty
        );
    }

    #[test]
    fn preflight_reports_offending_path() {
        let bundle = ConfigBundle {
            config_id: "cfg".into(),
            files: vec![
                BundleFile::new("/etc/nginx/nginx.conf", "a"),
                BundleFile::new("/etc/shadow", "b"),
            ],
        };
        assert_eq!(
            bundle.preflight(&allowed()).unwrap_err(),
            PathPolicyError::OutsideAllowed(PathBuf::from("/etc/shadow"))
        );

        let traversal = ConfigBundle {
            config_id: "cfg".into(),
            files: vec![BundleFile::new("/etc/nginx/../shadow", "b")],
        };
        assert!(matches!(
            traversal.preflight(&allowed()),
            Err(PathPolicyError::ParentTraversal(_))
        ));

        let duplicate = ConfigBundle {
            config_id: "cfg".into(),
            files: vec![
                BundleFile::new("/etc/nginx/a.conf", "1"),
                BundleFile::new("/etc/nginx/a.conf", "2"),
            ],
        };
        assert!(matches!(
            duplicate.preflight(&allowed()),
            Err(PathPolicyError::Duplicate(_))
        ));
    }

    #[test]
    fn preflight_spots_duplicates_spelled_differently() {
        for alias in ["/etc/nginx/./a.conf", "/etc/nginx//a.conf"] {
            let bundle = ConfigBundle {
                config_id: "cfg".into(),
                files: vec![
                    BundleFile::new("/etc/nginx/a.conf", "1"),
                    BundleFile::new(alias, "2"),
                ],
            };
            assert_eq!(
                bundle.preflight(&allowed()),
                Err(PathPolicyError::Duplicate(PathBuf::from(alias))),
                "{alias}"
            );
        }
    }

    #[test]
    fn bundle_contents_serialize_as_base64() {
        let bundle = ConfigBundle {
            config_id: "cfg".into(),
            files: vec![BundleFile::new("/etc/nginx/a.conf", vec![0u8, 159, 146, 150]).with_mode(0o640)],
        };
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["files"][0]["contents"], "AJ+Slg==");
        assert_eq!(json["files"][0]["mode"], 0o640);
        let parsed: ConfigBundle = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, bundle);
    }

    #[test]
    fn manifest_orphans_exclude_bundle_paths() {
        let manifest = Manifest {
            config_id: Some("old".into()),
            files: ["/etc/nginx/a.conf", "/etc/nginx/b.conf"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            applied_at: None,
        };
        let bundle = ConfigBundle {
            config_id: "new".into(),
            files: vec![BundleFile::new("/etc/nginx/a.conf", "x")],
        };
        let orphans: Vec<_> = manifest.orphans(&bundle).collect();
        assert_eq!(orphans, vec![&PathBuf::from("/etc/nginx/b.conf")]);
    }
}
