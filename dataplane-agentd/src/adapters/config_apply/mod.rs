pub mod local_fs;
pub mod repo_file;
pub mod validator;

pub use local_fs::LocalFileSystem;
pub use repo_file::FileManifestRepository;
pub use validator::ShellValidator;
