//! Thin abstraction over a hierarchical key-value blob namespace.
//!
//! Everything above this layer is storage-scheme-agnostic: keys use forward
//! slashes regardless of host OS, and "directories" are purely a naming
//! convention. Transport errors are surfaced as-is; retry policy belongs to
//! the caller.

pub mod file;
pub mod location;
pub mod memory;

use crate::core::{Result, StoreError};
use async_trait::async_trait;

pub use file::FileBucket;
pub use location::{is_store_url, massage_store_url};
pub use memory::MemoryBucket;

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobItem {
    /// Full key, relative to the bucket root.
    pub key: String,
    /// Whether this entry is a directory marker rather than an object.
    pub is_dir: bool,
}

/// A hierarchical blob namespace. Implementations wrap a concrete transport
/// (local filesystem, object store); hosted object-store transports are
/// supplied by callers through [`crate::StateStore::open_with_bucket`].
#[async_trait]
pub trait Bucket: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Reads an object. Missing keys are `Ok(None)`, not an error.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Deletes an object. A missing key is a [`StoreError::BlobNotFound`]
    /// error, distinguishable via [`StoreError::is_not_found`].
    async fn delete(&self, key: &str) -> Result<()>;

    /// Flat listing of all objects whose key starts with `prefix`. No
    /// delimiter handling: nested objects are returned directly.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobItem>>;

    /// Best-effort signed URL for an object. Transports without the notion
    /// report [`StoreError::UnsupportedOperation`].
    async fn signed_url(&self, _key: &str) -> Result<String> {
        Err(StoreError::UnsupportedOperation(
            "signed URLs are not supported by this storage transport".to_string(),
        ))
    }
}

/// Copies `src` to `dst` within the same bucket.
pub async fn copy_object(bucket: &dyn Bucket, src: &str, dst: &str) -> Result<()> {
    let data = bucket
        .read(src)
        .await?
        .ok_or_else(|| StoreError::BlobNotFound(src.to_string()))?;
    bucket.write(dst, &data).await
}
