pub mod filesystem;
pub mod manifest_repo;
pub mod validator;

pub use filesystem::{ConfigFileSystem, OnDiskFile};
pub use manifest_repo::ManifestRepository;
pub use validator::ConfigValidator;
