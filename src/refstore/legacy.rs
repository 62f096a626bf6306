//! The original flat layout, without project scoping.
//!
//! This is the format self-managed stores used before layout versioning was
//! introduced; it is still honored so old stores keep working unchanged.

use crate::blob::Bucket;
use crate::core::{Result, StoreError, is_name};
use crate::encoding;
use crate::refstore::{BACKUPS_DIR, HISTORY_DIR, ReferenceStore, STACKS_DIR, StackRef};
use async_trait::async_trait;
use std::sync::Arc;

pub struct LegacyReferenceStore {
    bucket: Arc<dyn Bucket>,
}

impl LegacyReferenceStore {
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self { bucket }
    }
}

#[async_trait]
impl ReferenceStore for LegacyReferenceStore {
    fn parse_reference(&self, reference: &str) -> Result<StackRef> {
        if !is_name(reference) {
            return Err(StoreError::InvalidReference(format!(
                "stack names are limited to 100 characters and may only contain \
                 alphanumerics, hyphens, underscores, or periods: {:?}",
                reference
            )));
        }
        Ok(StackRef::legacy(reference))
    }

    fn validate_reference(&self, stack: &StackRef) -> Result<()> {
        if stack.project().is_some() {
            return Err(StoreError::InvalidReference(
                "bad stack reference, project was set".to_string(),
            ));
        }
        Ok(())
    }

    fn stack_base_path(&self, stack: &StackRef) -> String {
        debug_assert!(stack.project().is_none());
        format!("{}/{}", STACKS_DIR, stack.name())
    }

    fn history_dir(&self, stack: &StackRef) -> String {
        debug_assert!(stack.project().is_none());
        format!("{}/{}", HISTORY_DIR, stack.name())
    }

    fn backup_dir(&self, stack: &StackRef) -> String {
        debug_assert!(stack.project().is_none());
        format!("{}/{}", BACKUPS_DIR, stack.name())
    }

    async fn list_references(&self) -> Result<Vec<StackRef>> {
        let prefix = format!("{}/", STACKS_DIR);
        let items = self.bucket.list(&prefix).await?;

        let mut stacks = Vec::with_capacity(items.len());
        for item in items {
            if item.is_dir {
                continue;
            }
            let suffix = &item.key[prefix.len()..];
            // Nested keys belong to the project-scoped layout; the legacy
            // layout only owns objects directly under the stacks root.
            if suffix.contains('/') {
                continue;
            }
            let Some(name) = encoding::stack_file_name(suffix) else {
                continue;
            };
            if !is_name(name) {
                continue;
            }
            stacks.push(StackRef::legacy(name));
        }
        Ok(stacks)
    }
}
