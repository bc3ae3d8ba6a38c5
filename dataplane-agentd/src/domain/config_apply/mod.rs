pub mod aggregate;
pub mod events;
pub mod snapshot;
pub mod value_object;

pub use aggregate::{
    CommitError, CommitSummary, ConfigApplyTransaction, FileFailure, FileOperation,
    RollbackError, TransactionError,
};
pub use events::{ApplyEvent, ApplyEventEnvelope};
pub use snapshot::SnapshotStore;
pub use value_object::{
    AllowedDirectories, ApplyOutcome, BundleFile, ConfigBundle, Manifest, PathPolicyError,
};
