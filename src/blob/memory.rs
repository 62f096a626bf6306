//! In-memory bucket for tests and ephemeral stores.

use crate::blob::{BlobItem, Bucket};
use crate::core::{Result, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// A [`Bucket`] backed by a `BTreeMap`. Cheap, ordered, and shared freely
/// between tasks.
#[derive(Default)]
pub struct MemoryBucket {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read()?.contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read()?.get(key).cloned())
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.objects.write()?.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.objects.write()?.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::BlobNotFound(key.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobItem>> {
        Ok(self
            .objects
            .read()?
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| BlobItem { key: key.clone(), is_dir: false })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bucket_basics() {
        let bucket = MemoryBucket::new();
        bucket.write("stacks/dev.json", b"{}").await.unwrap();
        assert!(bucket.exists("stacks/dev.json").await.unwrap());
        assert_eq!(bucket.read("stacks/dev.json").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(bucket.read("stacks/prod.json").await.unwrap(), None);

        bucket.delete("stacks/dev.json").await.unwrap();
        assert!(bucket.delete("stacks/dev.json").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_memory_bucket_list_prefix() {
        let bucket = MemoryBucket::new();
        bucket.write("stacks/a.json", b"1").await.unwrap();
        bucket.write("stacks/b.json", b"2").await.unwrap();
        bucket.write("stale/c.json", b"3").await.unwrap();

        let keys: Vec<_> = bucket
            .list("stacks/")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.key)
            .collect();
        assert_eq!(keys, vec!["stacks/a.json", "stacks/b.json"]);
    }
}
