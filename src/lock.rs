//! Advisory per-stack locking over the blob store.
//!
//! A lock is the presence of any object under the stack's lock directory.
//! Each backend instance writes a uniquely named marker there; contention is
//! reported, never retried (callers wanting blocking semantics poll). The
//! lock is advisory only: it does not fence writers that bypass it.

use crate::blob::Bucket;
use crate::core::{Result, StoreError};
use crate::refstore::{LOCKS_DIR, StackRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Contents of a lock marker, recorded to make contention errors actionable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockContent {
    pub pid: u32,
    pub username: String,
    pub timestamp: DateTime<Utc>,
}

impl LockContent {
    fn for_this_process() -> Self {
        Self {
            pid: std::process::id(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            timestamp: Utc::now(),
        }
    }
}

pub struct LockManager {
    bucket: Arc<dyn Bucket>,
    /// Unique per backend instance; names this instance's lock markers.
    lock_id: String,
}

/// Releases the lock entry written by [`LockManager::acquire`]. Dropping
/// without calling [`release`](LockGuard::release) leaves the marker behind,
/// exactly like a crashed process would; `cancel_current_update` exists to
/// clear those.
#[must_use = "the lock entry stays in storage until released"]
pub struct LockGuard {
    bucket: Arc<dyn Bucket>,
    key: String,
}

impl LockGuard {
    pub async fn release(self) -> Result<()> {
        match self.bucket.delete(&self.key).await {
            Ok(()) => Ok(()),
            // Already cleared by a force release; not an error.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl LockManager {
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self { bucket, lock_id: Uuid::new_v4().to_string() }
    }

    /// Lock directory for a stack, keyed by its fully qualified name.
    pub fn lock_dir(stack: &StackRef) -> String {
        format!("{}/{}", LOCKS_DIR, stack.fully_qualified())
    }

    fn own_entry(&self, stack: &StackRef) -> String {
        format!("{}/{}.json", Self::lock_dir(stack), self.lock_id)
    }

    /// Acquires the advisory lock for `stack`, failing immediately if any
    /// other lock entry exists.
    pub async fn acquire(&self, stack: &StackRef) -> Result<LockGuard> {
        self.check_for_lock(stack).await?;

        let content = LockContent::for_this_process();
        let key = self.own_entry(stack);
        self.bucket.write(&key, &serde_json::to_vec(&content)?).await?;
        debug!(stack = %stack, key = %key, "acquired stack lock");

        Ok(LockGuard { bucket: Arc::clone(&self.bucket), key })
    }

    /// Errors with the holder's details if another process holds the lock.
    async fn check_for_lock(&self, stack: &StackRef) -> Result<()> {
        let prefix = format!("{}/", Self::lock_dir(stack));
        for item in self.bucket.list(&prefix).await? {
            if item.is_dir || item.key == self.own_entry(stack) {
                continue;
            }
            let (holder, since) = match self.bucket.read(&item.key).await? {
                Some(data) => match serde_json::from_slice::<LockContent>(&data) {
                    Ok(content) => (
                        format!("{} (pid {})", content.username, content.pid),
                        content.timestamp.to_rfc3339(),
                    ),
                    Err(_) => ("unknown".to_string(), "unknown".to_string()),
                },
                None => continue, // raced with a release
            };
            return Err(StoreError::StackLocked { holder, since, entry: item.key });
        }
        Ok(())
    }

    /// Force-deletes every lock entry for `stack`. Races with concurrent
    /// releases are tolerated: a missing entry is success.
    pub async fn force_release(&self, stack: &StackRef) -> Result<()> {
        let prefix = format!("{}/", Self::lock_dir(stack));
        for item in self.bucket.list(&prefix).await? {
            if item.is_dir {
                continue;
            }
            match self.bucket.delete(&item.key).await {
                Ok(()) => debug!(stack = %stack, key = %item.key, "removed stack lock entry"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
