use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid stack reference: {0}")]
    InvalidReference(String),

    #[error("Stack '{0}' already exists")]
    StackExists(String),

    #[error("Refusing to remove stack because it still contains resources")]
    StackNotEmpty,

    #[error(
        "State store unsupported: metadata version ({0}) is not supported by this version of stackstore"
    )]
    UnsupportedStoreVersion(u64),

    #[error("Unsupported store URL '{0}': expected one of: {1}")]
    UnsupportedScheme(String, String),

    #[error("The stack is currently locked by {holder} since {since}: {entry}")]
    StackLocked {
        holder: String,
        since: String,
        entry: String,
    },

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("No previous deployment")]
    NoPreviousDeployment,

    #[error("State upgrade failed")]
    UpgradeFailed,

    #[error("Provided project name '{0}' doesn't match the current workspace project")]
    ProjectMismatch(String),

    #[error("Blob '{0}' not found")]
    BlobNotFound(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Whether this error means "the object does not exist", as opposed to a
    /// transport failure. Callers that treat missing blobs as absence rather
    /// than failure branch on this.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::BlobNotFound(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
