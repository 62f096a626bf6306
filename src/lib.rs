// ============================================================================
// StackStore Library
// ============================================================================

pub mod blob;
pub mod checkpoint;
pub mod core;
pub mod encoding;
pub mod facade;
pub mod lock;
pub mod meta;
pub mod migrate;
pub mod refstore;
pub mod update;

// Re-export main types for convenience
pub use core::{
    ConfigMap, ConfigValue, Decrypter, NopDecrypter, ResourceChanges, Result, StoreError,
    UpdateInfo, UpdateKind, UpdateResult,
};
pub use facade::{StackSummary, StateStore, StoreOptions};

pub use blob::{Bucket, FileBucket, MemoryBucket};
pub use checkpoint::{Checkpoint, Resource, Snapshot, UntypedDeployment, Urn};
pub use migrate::UpgradeSummary;
pub use refstore::{ORGANIZATION_NAME, StackRef};
pub use update::{EngineEvent, Executor, SnapshotPersister, UpdateOperation, UpdateTarget};
