//! The backend facade: composes the bucket, reference store, and lock
//! manager into the stack CRUD / history / rename / export surface.

use crate::blob::{self, Bucket, FileBucket, MemoryBucket};
use crate::checkpoint::{Checkpoint, Snapshot, UntypedDeployment};
use crate::core::{ConfigMap, Result, StoreError, UpdateInfo, UpdateResult};
use crate::lock::{LockGuard, LockManager};
use crate::meta;
use crate::refstore::{
    CurrentProject, LegacyReferenceStore, ProjectReferenceStore, ReferenceStore, StackRef,
};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Env var enabling transparent gzip compression of newly written state.
pub const GZIP_ENV_VAR: &str = "STACKSTORE_GZIP";

/// Env var forcing the legacy flat layout when initializing an empty store.
pub const LEGACY_LAYOUT_ENV_VAR: &str = "STACKSTORE_LEGACY_LAYOUT";

/// Env var suppressing the one-time warning about unmigrated legacy stacks.
pub const NO_LEGACY_WARNING_ENV_VAR: &str = "STACKSTORE_NO_LEGACY_WARNING";

fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Behavior toggles resolved at open time. `None` fields fall back to the
/// corresponding environment variable.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub gzip: Option<bool>,
    pub force_legacy_layout: Option<bool>,
    pub suppress_legacy_warning: Option<bool>,
}

/// One row of [`StateStore::list_stacks`]: the reference enriched with the
/// checkpoint's resource count and the most recent history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSummary {
    pub stack: StackRef,
    /// Live resources in the checkpoint; pending-deletes are excluded, the
    /// same way `remove_stack` ignores them.
    pub resource_count: Option<usize>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_result: Option<UpdateResult>,
}

/// The persistent-state backend for a single store location.
///
/// All mutating operations serialize per stack through the advisory
/// [`LockManager`]; reads and dry runs do not take the lock.
pub struct StateStore {
    original_url: String,
    url: String,
    pub(crate) bucket: Arc<dyn Bucket>,
    pub(crate) locks: LockManager,
    pub(crate) gzip: bool,
    pub(crate) current_project: CurrentProject,
    refs: RwLock<Arc<dyn ReferenceStore>>,
}

impl StateStore {
    /// Opens the store at `url`, constructing the storage transport from the
    /// URL scheme (`file://` or `mem://`; hosted object-store schemes go
    /// through [`StateStore::open_with_bucket`]).
    pub async fn open(url: &str, current_project: Option<&str>) -> Result<StateStore> {
        Self::open_with_options(url, current_project, StoreOptions::default()).await
    }

    pub async fn open_with_options(
        url: &str,
        current_project: Option<&str>,
        options: StoreOptions,
    ) -> Result<StateStore> {
        if !blob::is_store_url(url) {
            return Err(StoreError::UnsupportedScheme(
                url.to_string(),
                blob::location::KNOWN_SCHEMES.join(", "),
            ));
        }

        let canonical = blob::massage_store_url(url)?;
        let bucket: Arc<dyn Bucket> = if let Some(root) = blob::location::file_url_root(&canonical)
        {
            Arc::new(FileBucket::new(root))
        } else if canonical.starts_with(blob::location::MEMORY_SCHEME_PREFIX) {
            Arc::new(MemoryBucket::new())
        } else {
            return Err(StoreError::UnsupportedScheme(
                url.to_string(),
                "no transport linked for this scheme; supply one via open_with_bucket".to_string(),
            ));
        };

        Self::open_bucket(bucket, url.to_string(), canonical, current_project, options).await
    }

    /// Opens the store over a caller-supplied transport (hosted object
    /// stores). The URL is recorded for permalinks only.
    pub async fn open_with_bucket(
        bucket: Arc<dyn Bucket>,
        url: &str,
        current_project: Option<&str>,
        options: StoreOptions,
    ) -> Result<StateStore> {
        Self::open_bucket(bucket, url.to_string(), url.to_string(), current_project, options).await
    }

    async fn open_bucket(
        bucket: Arc<dyn Bucket>,
        original_url: String,
        url: String,
        current_project: Option<&str>,
        options: StoreOptions,
    ) -> Result<StateStore> {
        let gzip = options.gzip.unwrap_or_else(|| env_truthy(GZIP_ENV_VAR));
        let force_legacy = options
            .force_legacy_layout
            .unwrap_or_else(|| env_truthy(LEGACY_LAYOUT_ENV_VAR));

        let meta = meta::ensure_meta(bucket.as_ref(), force_legacy).await?;

        let current_project = CurrentProject::new(current_project);
        let refs: Arc<dyn ReferenceStore> = match meta.version {
            0 => Arc::new(LegacyReferenceStore::new(Arc::clone(&bucket))),
            1 => Arc::new(ProjectReferenceStore::new(
                Arc::clone(&bucket),
                current_project.clone(),
            )),
            version => return Err(StoreError::UnsupportedStoreVersion(version)),
        };

        let store = StateStore {
            original_url,
            url,
            locks: LockManager::new(Arc::clone(&bucket)),
            bucket,
            gzip,
            current_project,
            refs: RwLock::new(refs),
        };

        let suppress = options
            .suppress_legacy_warning
            .unwrap_or_else(|| env_truthy(NO_LEGACY_WARNING_ENV_VAR));
        if meta.version >= 1 && !suppress {
            store.warn_about_legacy_stacks().await;
        }

        Ok(store)
    }

    /// A project-scoped store may still contain flat stack files, written by
    /// an older tool against the same storage. Warn once at open; failures
    /// to list never fail the open.
    async fn warn_about_legacy_stacks(&self) {
        let legacy = LegacyReferenceStore::new(Arc::clone(&self.bucket));
        let refs = match legacy.list_references().await {
            Ok(refs) => refs,
            Err(_) => return,
        };
        if refs.is_empty() {
            return;
        }
        let names: Vec<&str> = refs.iter().map(|r| r.name()).collect();
        warn!(
            stacks = ?names,
            "found legacy stack files in the state store; run the store upgrade to migrate them \
             (set {}=1 to silence this warning)",
            NO_LEGACY_WARNING_ENV_VAR
        );
    }

    /// The URL this store was opened with, before canonicalization.
    pub fn url(&self) -> &str {
        &self.original_url
    }

    pub(crate) fn canonical_url(&self) -> &str {
        &self.url
    }

    /// Snapshot of the active reference store. Upgrade swaps this once
    /// migration finishes.
    pub(crate) fn refs(&self) -> Arc<dyn ReferenceStore> {
        Arc::clone(&self.refs.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub(crate) fn swap_refs(&self, refs: Arc<dyn ReferenceStore>) {
        *self.refs.write().unwrap_or_else(|p| p.into_inner()) = refs;
    }

    pub fn parse_stack_reference(&self, reference: &str) -> Result<StackRef> {
        self.refs().parse_reference(reference)
    }

    /// Replaces the ambient current project used for reference inference and
    /// workspace-contradiction checks.
    pub fn set_current_project(&self, project: Option<&str>) {
        self.current_project.set(project);
    }

    /// Errors when the stack's project contradicts the ambient project: a
    /// stack `organization/web/dev` must not be operated on from workspace
    /// project `infra`.
    pub(crate) fn check_project_consistency(&self, stack: &StackRef) -> Result<()> {
        let (Some(project), Some(current)) = (stack.project(), self.current_project.get()) else {
            return Ok(());
        };
        if project != current.as_ref() {
            return Err(StoreError::ProjectMismatch(project.to_string()));
        }
        Ok(())
    }

    pub(crate) async fn release_quietly(&self, guard: LockGuard, stack: &StackRef) {
        if let Err(e) = guard.release().await {
            warn!(stack = %stack, error = %e, "failed to release stack lock");
        }
    }

    // ========================================================================
    // Stack CRUD
    // ========================================================================

    /// Creates `stack` with an empty checkpoint. Fails if a checkpoint
    /// already exists at the target path. The existence check is not a
    /// transactional guard; races are excluded by the lock taken here.
    pub async fn create_stack(&self, stack: &StackRef) -> Result<()> {
        self.refs().validate_reference(stack)?;

        let guard = self.locks.acquire(stack).await?;
        let result = self.create_stack_locked(stack).await;
        self.release_quietly(guard, stack).await;
        result
    }

    async fn create_stack_locked(&self, stack: &StackRef) -> Result<()> {
        self.check_project_consistency(stack)?;

        if self.load_checkpoint(stack).await?.is_some() {
            return Err(StoreError::StackExists(stack.fully_qualified()));
        }

        let checkpoint = Checkpoint { stack: stack.fully_qualified(), latest: None };
        self.save_checkpoint(stack, &checkpoint).await?;
        info!(stack = %stack, "created stack");
        Ok(())
    }

    /// Reads the stack's checkpoint. A missing stack is `Ok(None)`.
    pub async fn get_stack(&self, stack: &StackRef) -> Result<Option<Checkpoint>> {
        self.refs().validate_reference(stack)?;
        self.load_checkpoint(stack).await
    }

    /// Flat scan of every stack, enriched with checkpoint and last-history
    /// summaries.
    pub async fn list_stacks(&self) -> Result<Vec<StackSummary>> {
        let refs = self.refs();
        let mut summaries = Vec::new();
        for stack in refs.list_references().await? {
            let resource_count = self
                .load_checkpoint(&stack)
                .await?
                .and_then(|chk| chk.latest)
                .map(|snap| snap.resources.iter().filter(|r| !r.delete).count());
            let last = self.get_history(&stack, 1, 1).await?.into_iter().next();
            summaries.push(StackSummary {
                stack,
                resource_count,
                last_update: last
                    .as_ref()
                    .and_then(|info| Utc.timestamp_opt(info.end_time, 0).single()),
                last_result: last.map(|info| info.result),
            });
        }
        Ok(summaries)
    }

    /// Removes the stack's checkpoint. Refuses while live resources remain
    /// unless `force` is set. Writes no backup; history and backups are left
    /// untouched.
    pub async fn remove_stack(&self, stack: &StackRef, force: bool) -> Result<()> {
        self.refs().validate_reference(stack)?;

        let guard = self.locks.acquire(stack).await?;
        let result = self.remove_stack_locked(stack, force).await;
        self.release_quietly(guard, stack).await;
        result
    }

    async fn remove_stack_locked(&self, stack: &StackRef, force: bool) -> Result<()> {
        let checkpoint = self.load_checkpoint(stack).await?;
        let live = checkpoint
            .and_then(|chk| chk.latest)
            .map(|snap| snap.has_live_resources())
            .unwrap_or(false);
        if live && !force {
            return Err(StoreError::StackNotEmpty);
        }
        self.delete_checkpoint(stack).await
    }

    /// Renames `stack` to `new_reference`, rewriting resource URNs in the
    /// snapshot. The old checkpoint becomes a timestamped backup rather than
    /// being deleted, and the history directory moves along.
    pub async fn rename_stack(&self, stack: &StackRef, new_reference: &str) -> Result<StackRef> {
        let refs = self.refs();
        refs.validate_reference(stack)?;
        let new_stack = refs.parse_reference(new_reference)?;

        let guard = self.locks.acquire(stack).await?;
        let result = self.rename_stack_locked(stack, &new_stack).await;
        self.release_quietly(guard, stack).await;
        result.map(|()| new_stack)
    }

    pub(crate) async fn rename_stack_locked(
        &self,
        stack: &StackRef,
        new_stack: &StackRef,
    ) -> Result<()> {
        let checkpoint = self.load_checkpoint(stack).await?;

        if self.checkpoint_exists(new_stack).await? {
            return Err(StoreError::StackExists(new_stack.fully_qualified()));
        }

        let mut snapshot = checkpoint.and_then(|chk| chk.latest);
        if let Some(snap) = snapshot.as_mut() {
            let new_project = match (stack.project(), new_stack.project()) {
                (old, new) if old != new => new,
                _ => None,
            };
            snap.rename(new_stack.name(), new_project);
        }

        let new_checkpoint =
            Checkpoint { stack: new_stack.fully_qualified(), latest: snapshot };
        self.save_checkpoint(new_stack, &new_checkpoint).await?;

        // The old checkpoint becomes a backup, not a delete, so recovery
        // remains possible.
        self.backup_target(stack, false).await?;
        self.rename_history(stack, new_stack).await?;
        info!(from = %stack, to = %new_stack, "renamed stack");
        Ok(())
    }

    // ========================================================================
    // Export / import
    // ========================================================================

    /// Serializes the stack's deployment as a versioned envelope. A round
    /// trip through [`StateStore::import_deployment`] reproduces the
    /// checkpoint exactly.
    pub async fn export_deployment(&self, stack: &StackRef) -> Result<UntypedDeployment> {
        self.refs().validate_reference(stack)?;
        let checkpoint = self
            .load_checkpoint(stack)
            .await?
            .ok_or_else(|| StoreError::BlobNotFound(stack.fully_qualified()))?;
        UntypedDeployment::from_snapshot(&checkpoint.latest)
    }

    pub async fn import_deployment(
        &self,
        stack: &StackRef,
        deployment: UntypedDeployment,
    ) -> Result<()> {
        self.refs().validate_reference(stack)?;

        let guard = self.locks.acquire(stack).await?;
        let result = async {
            let snapshot: Option<Snapshot> = deployment.into_snapshot()?;
            let checkpoint = Checkpoint { stack: stack.fully_qualified(), latest: snapshot };
            self.save_checkpoint(stack, &checkpoint).await?;
            Ok(())
        }
        .await;
        self.release_quietly(guard, stack).await;
        result
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Reads history entries newest-first. Pages are 1-based; `page_size` of
    /// zero returns everything.
    pub async fn get_history(
        &self,
        stack: &StackRef,
        page_size: usize,
        page: usize,
    ) -> Result<Vec<UpdateInfo>> {
        self.refs().validate_reference(stack)?;
        self.read_history_page(stack, page_size, page).await
    }

    /// The configuration used by the most recent deployment.
    pub async fn get_latest_configuration(&self, stack: &StackRef) -> Result<ConfigMap> {
        let history = self.get_history(stack, 1, 1).await?;
        match history.into_iter().next() {
            Some(info) => Ok(info.config),
            None => Err(StoreError::NoPreviousDeployment),
        }
    }

    // ========================================================================
    // Lock administration
    // ========================================================================

    /// Force-deletes every lock entry for `stack`, recovering from crashed
    /// holders. Always succeeds when the entries are already gone.
    pub async fn cancel_current_update(&self, stack: &StackRef) -> Result<()> {
        self.locks.force_release(stack).await
    }
}
