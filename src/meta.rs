//! The store metadata record that selects the storage layout version.

use crate::blob::Bucket;
use crate::core::{Result, StoreError};
use crate::refstore::BOOKKEEPING_DIR;
use serde::{Deserialize, Serialize};

/// Bucket key of the metadata record.
pub const META_PATH: &str = ".stackstore/meta.json";

/// Current (project-scoped) layout version.
pub const CURRENT_VERSION: u64 = 1;

/// A single record at a well-known path selecting which reference store
/// governs the whole store. Version 0 (or an absent file) is the legacy flat
/// layout, version 1 the project-scoped layout. Written once and immutable
/// afterwards except through the explicit upgrade operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub version: u64,
}

impl StoreMeta {
    pub async fn write_to(&self, bucket: &dyn Bucket) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        bucket.write(META_PATH, &data).await
    }

    pub async fn read_from(bucket: &dyn Bucket) -> Result<Option<StoreMeta>> {
        let Some(data) = bucket.read(META_PATH).await? else {
            return Ok(None);
        };
        let meta: StoreMeta = serde_json::from_slice(&data)?;
        Ok(Some(meta))
    }
}

/// Resolves the layout version governing `bucket`, initializing it lazily.
///
/// - An existing metadata record wins.
/// - A store with prior contents but no record predates versioning: legacy.
/// - A brand-new store starts at the current version (unless the caller
///   forces the legacy layout), and the choice is persisted immediately so
///   concurrent openers agree.
pub async fn ensure_meta(bucket: &dyn Bucket, force_legacy: bool) -> Result<StoreMeta> {
    if let Some(meta) = StoreMeta::read_from(bucket).await? {
        if meta.version > CURRENT_VERSION {
            return Err(StoreError::UnsupportedStoreVersion(meta.version));
        }
        return Ok(meta);
    }

    let prior = bucket.list(&format!("{}/", BOOKKEEPING_DIR)).await?;
    if !prior.is_empty() {
        return Ok(StoreMeta { version: 0 });
    }

    let meta = StoreMeta { version: if force_legacy { 0 } else { CURRENT_VERSION } };
    meta.write_to(bucket).await?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBucket;

    #[tokio::test]
    async fn test_fresh_store_initializes_current_version() {
        let bucket = MemoryBucket::new();
        let meta = ensure_meta(&bucket, false).await.unwrap();
        assert_eq!(meta.version, CURRENT_VERSION);
        // Persisted, so a second open agrees.
        assert_eq!(StoreMeta::read_from(&bucket).await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn test_fresh_store_can_force_legacy() {
        let bucket = MemoryBucket::new();
        let meta = ensure_meta(&bucket, true).await.unwrap();
        assert_eq!(meta.version, 0);
    }

    #[tokio::test]
    async fn test_existing_store_without_meta_is_legacy() {
        let bucket = MemoryBucket::new();
        bucket.write(".stackstore/stacks/dev.json", b"{}").await.unwrap();
        let meta = ensure_meta(&bucket, false).await.unwrap();
        assert_eq!(meta.version, 0);
        // Not persisted: the record stays absent until an explicit upgrade.
        assert_eq!(StoreMeta::read_from(&bucket).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_version_is_fatal() {
        let bucket = MemoryBucket::new();
        StoreMeta { version: 7 }.write_to(&bucket).await.unwrap();
        let err = ensure_meta(&bucket, false).await.unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedStoreVersion(7)));
    }
}
