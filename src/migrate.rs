//! One-shot migration of a legacy-layout store to the project-scoped layout.
//!
//! The new metadata record is written before any stack is touched: if that
//! write fails the whole operation aborts, since a half-migrated store with
//! ambiguous metadata is worse than no migration. Individual stacks migrate
//! concurrently and independently; a per-stack failure is a warning, not an
//! abort. At-least-once, no global rollback.

use crate::core::{Result, StoreError};
use crate::facade::StateStore;
use crate::meta::{CURRENT_VERSION, StoreMeta};
use crate::refstore::{
    CurrentProject, LegacyReferenceStore, ProjectReferenceStore, ReferenceStore, StackRef,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{error, info, warn};

/// Outcome of [`StateStore::upgrade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeSummary {
    /// Stacks found under the legacy layout.
    pub total: u64,
    /// Stacks successfully re-homed into the project-scoped layout.
    pub migrated: u64,
}

impl StateStore {
    /// Migrates every legacy-layout stack into the project-scoped layout and
    /// switches this store instance to project mode.
    pub async fn upgrade(self: &Arc<Self>) -> Result<UpgradeSummary> {
        self.upgrade_with_workers(
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        )
        .await
    }

    /// Like [`upgrade`](StateStore::upgrade) with an explicit worker-pool
    /// bound.
    pub async fn upgrade_with_workers(self: &Arc<Self>, workers: usize) -> Result<UpgradeSummary> {
        // Enumerate with a fresh legacy view rather than the live store: the
        // live store may already be project-scoped with stray legacy files
        // introduced to it afterwards.
        let legacy = LegacyReferenceStore::new(Arc::clone(&self.bucket));
        let olds = Arc::new(legacy.list_references().await?);

        // Write the new metadata before touching any stack. If permissions
        // are broken this fails the whole upgrade up front instead of
        // leaving the bucket in a state no layout version can claim.
        let meta = StoreMeta { version: CURRENT_VERSION };
        if let Err(e) = meta.write_to(self.bucket.as_ref()).await {
            error!(error = %e, "could not write new store metadata; verify the storage is writable and try again");
            return Err(StoreError::UpgradeFailed);
        }

        let new_store = Arc::new(ProjectReferenceStore::new(
            Arc::clone(&self.bucket),
            self.current_project.clone(),
        ));

        // Bounded pool of workers, never more workers than stacks. Workers
        // claim the next unclaimed index from a shared counter until it is
        // exhausted; they share nothing else mutable.
        let worker_count = workers.max(1).min(olds.len().max(1));
        let next_idx = Arc::new(AtomicUsize::new(0));
        let migrated = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let store = Arc::clone(self);
            let olds = Arc::clone(&olds);
            let new_store = Arc::clone(&new_store);
            let next_idx = Arc::clone(&next_idx);
            let migrated = Arc::clone(&migrated);

            handles.push(tokio::spawn(async move {
                loop {
                    let idx = next_idx.fetch_add(1, Ordering::Relaxed);
                    if idx >= olds.len() {
                        return;
                    }
                    let old = &olds[idx];
                    match store.upgrade_stack(&new_store, old).await {
                        Ok(()) => {
                            migrated.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(stack = %old, error = %e, "skipping stack during upgrade");
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| StoreError::ExecutionError(format!("upgrade worker panicked: {}", e)))?;
        }

        self.swap_refs(new_store as Arc<dyn ReferenceStore>);

        let summary =
            UpgradeSummary { total: olds.len() as u64, migrated: migrated.load(Ordering::Relaxed) };
        info!(migrated = summary.migrated, total = summary.total, "upgraded stacks to project mode");
        Ok(summary)
    }

    /// Re-homes one legacy stack: recover its project from any resource URN,
    /// then rename it into the project-scoped layout. A stack with no
    /// resources cannot reveal its project and is skipped.
    async fn upgrade_stack(
        &self,
        new_store: &ProjectReferenceStore,
        old: &StackRef,
    ) -> Result<()> {
        debug_assert!(old.project().is_none());

        let checkpoint = self
            .load_checkpoint_legacy(old)
            .await?
            .ok_or_else(|| StoreError::BlobNotFound(old.fully_qualified()))?;

        let project = checkpoint
            .latest
            .as_ref()
            .and_then(|snap| snap.resources.first())
            .and_then(|res| res.urn.project())
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let Some(project) = project else {
            return Err(StoreError::ExecutionError("no project found".to_string()));
        };

        let new_ref = new_store.new_reference(&project, old.name());
        self.migrate_stack_files(old, &new_ref, checkpoint).await
    }
}

// Separate impl block: migration must address legacy paths explicitly even
// after the live store has flipped to project mode.
impl StateStore {
    async fn load_checkpoint_legacy(
        &self,
        stack: &StackRef,
    ) -> Result<Option<crate::checkpoint::Checkpoint>> {
        let legacy = LegacyReferenceStore::new(Arc::clone(&self.bucket));
        self.load_checkpoint_at(&legacy, stack).await
    }

    async fn migrate_stack_files(
        &self,
        old: &StackRef,
        new_ref: &StackRef,
        mut checkpoint: crate::checkpoint::Checkpoint,
    ) -> Result<()> {
        let legacy = LegacyReferenceStore::new(Arc::clone(&self.bucket));
        let project_store = ProjectReferenceStore::new(
            Arc::clone(&self.bucket),
            CurrentProject::new(new_ref.project()),
        );

        let guard = self.locks.acquire(old).await?;
        let result = async {
            if self.checkpoint_exists_at(&project_store, new_ref).await? {
                return Err(StoreError::StackExists(new_ref.fully_qualified()));
            }

            if let Some(snap) = checkpoint.latest.as_mut() {
                snap.rename(new_ref.name(), new_ref.project());
            }
            checkpoint.stack = new_ref.fully_qualified();
            self.save_checkpoint_at(&project_store, new_ref, &checkpoint).await?;

            self.backup_target_at(&legacy, old, false).await?;
            self.move_history(&legacy, old, &project_store, new_ref).await?;
            Ok(())
        }
        .await;
        self.release_quietly(guard, old).await;
        result
    }
}
