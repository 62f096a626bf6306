//! Local filesystem bucket.

use crate::blob::{BlobItem, Bucket};
use crate::core::{Result, StoreError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A [`Bucket`] rooted at a local directory. Keys map to paths under the
/// root; forward slashes in keys are converted to host separators on the way
/// down and back on the way up.
pub struct FileBucket {
    root: PathBuf,
}

impl FileBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    fn key_of(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Depth-first walk collecting every file under `dir`.
    async fn walk(&self, dir: PathBuf, out: &mut Vec<BlobItem>) -> Result<()> {
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else {
                    out.push(BlobItem { key: self.key_of(&path), is_dir: false });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Bucket for FileBucket {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(key)).await?)
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.full_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.full_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::BlobNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobItem>> {
        // The prefix may end mid-segment ("stacks/de" matching "stacks/dev"),
        // so walk from the deepest full directory and filter on the key.
        let dir = match prefix.rfind('/') {
            Some(idx) => self.full_path(&prefix[..idx]),
            None => self.root.clone(),
        };
        let mut items = Vec::new();
        self.walk(dir, &mut items).await?;
        items.retain(|item| item.key.starts_with(prefix));
        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }
}
