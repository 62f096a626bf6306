//! Orchestration of a single deployment operation against a stack.
//!
//! The orchestrator owns everything around the actual resource engine: it
//! takes the stack lock, builds the execution target, fans progress events
//! out to the display and an optional caller sink, scopes cancellation, and
//! records history and a backup once the engine finishes. The engine itself
//! is an opaque [`Executor`] capability supplied by the caller.

use crate::checkpoint::{Checkpoint, Snapshot};
use crate::core::{
    ConfigMap, Decrypter, ResourceChanges, Result, StoreError, UpdateInfo, UpdateKind,
    UpdateResult,
};
use crate::facade::StateStore;
use crate::refstore::StackRef;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One progress event produced by the execution capability. Opaque to the
/// backend; it only forwards them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self { event_type: event_type.into(), payload: Value::Null }
    }
}

/// Everything the execution capability needs to run against a stack,
/// including the write handle its mutations land through.
pub struct UpdateTarget {
    pub stack: StackRef,
    pub snapshot: Option<Snapshot>,
    pub config: ConfigMap,
    pub decrypter: Arc<dyn Decrypter>,
    pub persister: SnapshotPersister,
}

/// Checkpoint write handle scoped to one stack. The orchestrator already
/// holds the stack lock when the engine runs, so saves go straight to
/// storage without re-acquiring it. Dry runs receive one too but must not
/// call it.
#[derive(Clone)]
pub struct SnapshotPersister {
    store: Arc<StateStore>,
    stack: StackRef,
}

impl SnapshotPersister {
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let checkpoint = Checkpoint {
            stack: self.stack.fully_qualified(),
            latest: Some(snapshot.clone()),
        };
        self.store.save_checkpoint(&self.stack, &checkpoint).await?;
        Ok(())
    }
}

/// The resource-provisioning engine, consumed as an opaque capability. It
/// emits progress events into `events` (dropping the sender when done) and
/// should stop early when `cancel` fires.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        kind: UpdateKind,
        target: UpdateTarget,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> (ResourceChanges, Result<()>);
}

/// A single deployment operation, fully resolved by the caller.
pub struct UpdateOperation {
    pub executor: Arc<dyn Executor>,
    pub config: ConfigMap,
    pub decrypter: Arc<dyn Decrypter>,
    pub message: String,
    pub environment: BTreeMap<String, String>,
    /// Display sink; every event lands here in production order.
    pub display: mpsc::Sender<EngineEvent>,
    /// Optional second consumer, fed the same events in the same order.
    pub caller_events: Option<mpsc::Sender<EngineEvent>>,
    /// External interrupt signal. Only honored while the operation is in
    /// flight; ignored once the engine has returned.
    pub cancel: CancellationToken,
    pub show_permalink: bool,
}

// ============================================================================
// Cancellation scope
// ============================================================================

/// The boundary within which the external interrupt reaches the engine.
/// `close` severs the forwarding so a still-asserted signal cannot disturb
/// the final history/backup writes.
struct CancellationScope {
    token: CancellationToken,
    forwarder: JoinHandle<()>,
}

impl CancellationScope {
    fn new(external: CancellationToken) -> Self {
        let token = CancellationToken::new();
        let inner = token.clone();
        let forwarder = tokio::spawn(async move {
            external.cancelled().await;
            inner.cancel();
        });
        Self { token, forwarder }
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn close(self) {
        self.forwarder.abort();
    }
}

// ============================================================================
// Orchestration
// ============================================================================

impl StateStore {
    /// Dry run; takes no lock and records nothing.
    pub async fn preview(
        self: &Arc<Self>,
        stack: &StackRef,
        op: UpdateOperation,
    ) -> (ResourceChanges, Result<Option<String>>) {
        self.apply(UpdateKind::Preview, stack, op).await
    }

    pub async fn update(
        self: &Arc<Self>,
        stack: &StackRef,
        op: UpdateOperation,
    ) -> (ResourceChanges, Result<Option<String>>) {
        self.apply_locked(UpdateKind::Update, stack, op).await
    }

    pub async fn import(
        self: &Arc<Self>,
        stack: &StackRef,
        op: UpdateOperation,
    ) -> (ResourceChanges, Result<Option<String>>) {
        self.apply_locked(UpdateKind::Import, stack, op).await
    }

    pub async fn refresh(
        self: &Arc<Self>,
        stack: &StackRef,
        op: UpdateOperation,
    ) -> (ResourceChanges, Result<Option<String>>) {
        self.apply_locked(UpdateKind::Refresh, stack, op).await
    }

    pub async fn destroy(
        self: &Arc<Self>,
        stack: &StackRef,
        op: UpdateOperation,
    ) -> (ResourceChanges, Result<Option<String>>) {
        self.apply_locked(UpdateKind::Destroy, stack, op).await
    }

    pub async fn watch(
        self: &Arc<Self>,
        stack: &StackRef,
        op: UpdateOperation,
    ) -> (ResourceChanges, Result<Option<String>>) {
        self.apply_locked(UpdateKind::Watch, stack, op).await
    }

    async fn apply_locked(
        self: &Arc<Self>,
        kind: UpdateKind,
        stack: &StackRef,
        op: UpdateOperation,
    ) -> (ResourceChanges, Result<Option<String>>) {
        let guard = match self.locks.acquire(stack).await {
            Ok(guard) => guard,
            Err(e) => return (ResourceChanges::new(), Err(e)),
        };
        let result = self.apply(kind, stack, op).await;
        self.release_quietly(guard, stack).await;
        result
    }

    /// Performs one operation of the given kind. Returns the resource
    /// changes alongside the outcome so callers can render partial progress
    /// even on failure; the `Ok` value is the permalink, when one exists.
    async fn apply(
        self: &Arc<Self>,
        kind: UpdateKind,
        stack: &StackRef,
        op: UpdateOperation,
    ) -> (ResourceChanges, Result<Option<String>>) {
        match self.apply_inner(kind, stack, op).await {
            Ok((changes, permalink)) => (changes, Ok(permalink)),
            Err((changes, e)) => (changes, Err(e)),
        }
    }

    async fn apply_inner(
        self: &Arc<Self>,
        kind: UpdateKind,
        stack: &StackRef,
        op: UpdateOperation,
    ) -> std::result::Result<(ResourceChanges, Option<String>), (ResourceChanges, StoreError)> {
        let fail = |e: StoreError| (ResourceChanges::new(), e);

        self.refs().validate_reference(stack).map_err(fail)?;
        self.check_project_consistency(stack).map_err(fail)?;

        let snapshot = self
            .load_checkpoint(stack)
            .await
            .map_err(fail)?
            .and_then(|chk| chk.latest);
        let target = UpdateTarget {
            stack: stack.clone(),
            snapshot,
            config: op.config.clone(),
            decrypter: Arc::clone(&op.decrypter),
            persister: SnapshotPersister { store: Arc::clone(self), stack: stack.clone() },
        };

        // One producer (the engine), two consumers. The forwarding task owns
        // the receiving end and pushes every event to both sinks in
        // production order; backpressure from a slow consumer flows back to
        // the engine through the bounded channel.
        let (events_tx, mut events_rx) = mpsc::channel::<EngineEvent>(128);
        let display = op.display.clone();
        let caller = op.caller_events.clone();
        let fan_out: JoinHandle<()> = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if display.send(event.clone()).await.is_err() {
                    // Display went away; keep the caller stream alive.
                }
                if let Some(caller) = &caller {
                    let _ = caller.send(event).await;
                }
            }
        });

        let scope = CancellationScope::new(op.cancel.clone());
        let start_time = Utc::now().timestamp();
        let (changes, exec_result) =
            op.executor.execute(kind, target, events_tx, scope.token()).await;
        let end_time = Utc::now().timestamp();

        // Don't take any cancellations anymore; we're shutting down.
        scope.close();

        // The engine dropped its sender, so the fan-out drains and exits.
        // Everything must be delivered before we finish the operation.
        if let Err(e) = fan_out.await {
            warn!(stack = %stack, error = %e, "event fan-out task failed");
        }

        let (history_result, backup_result) = if kind.is_dry_run() {
            (Ok(()), Ok(()))
        } else {
            let info = UpdateInfo {
                kind,
                start_time,
                end_time,
                message: op.message.clone(),
                environment: op.environment.clone(),
                config: op.config.clone(),
                result: if exec_result.is_ok() {
                    UpdateResult::Succeeded
                } else {
                    UpdateResult::Failed
                },
                resource_changes: changes.clone(),
            };
            (self.add_to_history(stack, &info).await, self.backup_stack(stack).await)
        };

        // Error priority: engine failure first, then the history write, then
        // the backup write. Lower-priority failures are logged, never
        // silently dropped.
        if let Err(e) = exec_result {
            if let Err(save) = history_result {
                warn!(stack = %stack, error = %save, "failed to save update history");
            }
            if let Err(backup) = backup_result {
                warn!(stack = %stack, error = %backup, "failed to back up stack state");
            }
            return Err((changes, e));
        }
        if let Err(save) = history_result {
            if let Err(backup) = backup_result {
                warn!(stack = %stack, error = %backup, "failed to back up stack state");
            }
            return Err((changes, StoreError::IoError(format!("saving update info: {}", save))));
        }
        if let Err(backup) = backup_result {
            return Err((changes, StoreError::IoError(format!("saving backup: {}", backup))));
        }

        let permalink = if op.show_permalink { self.permalink(stack).await } else { None };
        Ok((changes, permalink))
    }

    /// A human-followable link to the stack's checkpoint. Synthesized
    /// locally for filesystem stores; otherwise a signed URL, whose failure
    /// is only a warning.
    async fn permalink(&self, stack: &StackRef) -> Option<String> {
        let path = self.stack_path(stack);
        if let Some(rest) = self.canonical_url().strip_prefix("file://") {
            return Some(format!("file://{}/{}", rest.trim_end_matches('/'), path));
        }
        match self.bucket.signed_url(&path).await {
            Ok(link) => Some(link),
            Err(e) => {
                warn!(
                    stack = %stack,
                    error = %e,
                    "unable to create a signed url for the stack permalink"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Resource, Urn};
    use crate::core::NopDecrypter;
    use crate::facade::StoreOptions;

    async fn project_store() -> Arc<StateStore> {
        let options = StoreOptions {
            gzip: Some(false),
            force_legacy_layout: Some(false),
            suppress_legacy_warning: Some(true),
        };
        Arc::new(StateStore::open_with_options("mem://", Some("infra"), options).await.unwrap())
    }

    /// Executor that emits a fixed event sequence and reports a scripted
    /// outcome.
    struct ScriptedExecutor {
        events: Vec<EngineEvent>,
        changes: ResourceChanges,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(
            &self,
            _kind: UpdateKind,
            _target: UpdateTarget,
            events: mpsc::Sender<EngineEvent>,
            _cancel: CancellationToken,
        ) -> (ResourceChanges, Result<()>) {
            for event in &self.events {
                if events.send(event.clone()).await.is_err() {
                    break;
                }
            }
            let result = match &self.fail_with {
                Some(msg) => Err(StoreError::ExecutionError(msg.clone())),
                None => Ok(()),
            };
            (self.changes.clone(), result)
        }
    }

    fn operation(
        executor: Arc<dyn Executor>,
        display: mpsc::Sender<EngineEvent>,
        caller_events: Option<mpsc::Sender<EngineEvent>>,
    ) -> UpdateOperation {
        UpdateOperation {
            executor,
            config: ConfigMap::new(),
            decrypter: Arc::new(NopDecrypter),
            message: "test deploy".to_string(),
            environment: BTreeMap::new(),
            display,
            caller_events,
            cancel: CancellationToken::new(),
            show_permalink: false,
        }
    }

    fn scripted(n: usize, fail_with: Option<&str>) -> Arc<ScriptedExecutor> {
        let events = (0..n)
            .map(|i| EngineEvent::new(format!("resource-{}", i)))
            .collect();
        let mut changes = ResourceChanges::new();
        changes.insert("create".to_string(), n as i64);
        Arc::new(ScriptedExecutor { events, changes, fail_with: fail_with.map(str::to_string) })
    }

    async fn drain(mut rx: mpsc::Receiver<EngineEvent>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event.event_type);
        }
        seen
    }

    #[tokio::test]
    async fn test_update_records_history_and_backup() {
        let store = project_store().await;
        let stack = store.parse_stack_reference("dev").unwrap();
        store.create_stack(&stack).await.unwrap();

        let (display_tx, display_rx) = mpsc::channel(16);
        let (changes, result) =
            store.update(&stack, operation(scripted(3, None), display_tx, None)).await;
        result.unwrap();
        assert_eq!(changes.get("create"), Some(&3));

        let history = store.get_history(&stack, 0, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result, UpdateResult::Succeeded);
        assert_eq!(history[0].message, "test deploy");

        let backups = store.bucket.list(".stackstore/backups/").await.unwrap();
        assert_eq!(backups.len(), 1);

        assert_eq!(drain(display_rx).await.len(), 3);
    }

    /// Executor that appends one resource and writes the result through the
    /// target's persister, like a real engine would.
    struct PersistOne;

    #[async_trait]
    impl Executor for PersistOne {
        async fn execute(
            &self,
            _kind: UpdateKind,
            target: UpdateTarget,
            _events: mpsc::Sender<EngineEvent>,
            _cancel: CancellationToken,
        ) -> (ResourceChanges, Result<()>) {
            let mut snapshot = target.snapshot.clone().unwrap_or_default();
            let urn = Urn::new(
                target.stack.name(),
                target.stack.project().unwrap_or(""),
                "aws:s3:Bucket",
                &format!("bucket-{}", snapshot.resources.len()),
            );
            snapshot.resources.push(Resource::new(urn, "aws:s3:Bucket"));

            let mut changes = ResourceChanges::new();
            changes.insert("create".to_string(), 1);
            match target.persister.save(&snapshot).await {
                Ok(()) => (changes, Ok(())),
                Err(e) => (changes, Err(e)),
            }
        }
    }

    #[tokio::test]
    async fn test_update_persists_checkpoint_through_target() {
        let store = project_store().await;
        let stack = store.parse_stack_reference("dev").unwrap();
        store.create_stack(&stack).await.unwrap();

        let (display_tx, _rx) = mpsc::channel(16);
        let (changes, result) =
            store.update(&stack, operation(Arc::new(PersistOne), display_tx, None)).await;
        result.unwrap();
        assert_eq!(changes.get("create"), Some(&1));

        let chk = store.get_stack(&stack).await.unwrap().unwrap();
        let resources = chk.latest.unwrap().resources;
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].urn.stack(), Some("dev"));
        assert_eq!(resources[0].urn.project(), Some("infra"));

        // The next update starts from the persisted checkpoint.
        let (display_tx, _rx) = mpsc::channel(16);
        let (_, result) =
            store.update(&stack, operation(Arc::new(PersistOne), display_tx, None)).await;
        result.unwrap();
        let chk = store.get_stack(&stack).await.unwrap().unwrap();
        assert_eq!(chk.latest.unwrap().resources.len(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order_for_both_consumers() {
        let store = project_store().await;
        let stack = store.parse_stack_reference("dev").unwrap();
        store.create_stack(&stack).await.unwrap();

        let (display_tx, display_rx) = mpsc::channel(256);
        let (caller_tx, caller_rx) = mpsc::channel(256);
        let (_, result) = store
            .update(&stack, operation(scripted(100, None), display_tx, Some(caller_tx)))
            .await;
        result.unwrap();

        let expected: Vec<String> = (0..100).map(|i| format!("resource-{}", i)).collect();
        assert_eq!(drain(display_rx).await, expected);
        assert_eq!(drain(caller_rx).await, expected);
    }

    #[tokio::test]
    async fn test_preview_takes_no_lock_and_writes_nothing() {
        let store = project_store().await;
        let stack = store.parse_stack_reference("dev").unwrap();
        store.create_stack(&stack).await.unwrap();

        // Hold the lock for the whole preview; a mutating op would fail.
        let guard = store.locks.acquire(&stack).await.unwrap();

        let (display_tx, _display_rx) = mpsc::channel(16);
        let (_, result) =
            store.preview(&stack, operation(scripted(1, None), display_tx, None)).await;
        result.unwrap();

        assert!(store.get_history(&stack, 0, 0).await.unwrap().is_empty());
        assert!(store.bucket.list(".stackstore/backups/").await.unwrap().is_empty());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_execution_failure_takes_precedence_and_is_recorded() {
        let store = project_store().await;
        let stack = store.parse_stack_reference("dev").unwrap();
        store.create_stack(&stack).await.unwrap();

        let (display_tx, _display_rx) = mpsc::channel(16);
        let (changes, result) =
            store.update(&stack, operation(scripted(2, Some("provider exploded")), display_tx, None)).await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("provider exploded"));
        // Changes are still reported alongside the failure.
        assert_eq!(changes.get("create"), Some(&2));

        // The failed attempt still lands in history.
        let history = store.get_history(&stack, 1, 1).await.unwrap();
        assert_eq!(history[0].result, UpdateResult::Failed);
    }

    #[tokio::test]
    async fn test_update_on_locked_stack_fails() {
        let store = project_store().await;
        let stack = store.parse_stack_reference("dev").unwrap();
        store.create_stack(&stack).await.unwrap();

        let other = crate::lock::LockManager::new(Arc::clone(&store.bucket));
        let guard = other.acquire(&stack).await.unwrap();

        let (display_tx, _display_rx) = mpsc::channel(16);
        let (_, result) =
            store.update(&stack, operation(scripted(1, None), display_tx, None)).await;
        assert!(matches!(result.unwrap_err(), StoreError::StackLocked { .. }));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_project_mismatch_rejected() {
        let store = project_store().await;
        let stack = store.parse_stack_reference("organization/web/dev").unwrap();

        let (display_tx, _display_rx) = mpsc::channel(16);
        let (_, result) =
            store.update(&stack, operation(scripted(1, None), display_tx, None)).await;
        assert!(matches!(result.unwrap_err(), StoreError::ProjectMismatch(_)));
    }

    /// Executor that observes whether cancellation reaches it.
    struct CancelProbe {
        saw_cancel: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Executor for CancelProbe {
        async fn execute(
            &self,
            _kind: UpdateKind,
            _target: UpdateTarget,
            _events: mpsc::Sender<EngineEvent>,
            cancel: CancellationToken,
        ) -> (ResourceChanges, Result<()>) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.saw_cancel.store(true, std::sync::atomic::Ordering::SeqCst);
                    (ResourceChanges::new(), Err(StoreError::ExecutionError("canceled".to_string())))
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {
                    (ResourceChanges::new(), Ok(()))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_cancellation_reaches_executor_through_scope() {
        let store = project_store().await;
        let stack = store.parse_stack_reference("dev").unwrap();
        store.create_stack(&stack).await.unwrap();

        let saw_cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let executor = Arc::new(CancelProbe { saw_cancel: Arc::clone(&saw_cancel) });

        let (display_tx, _display_rx) = mpsc::channel(16);
        let mut op = operation(executor, display_tx, None);
        let cancel = CancellationToken::new();
        op.cancel = cancel.clone();
        cancel.cancel(); // interrupt before the engine even starts

        let (_, result) = store.update(&stack, op).await;
        assert!(result.is_err());
        assert!(saw_cancel.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_permalink_for_file_stores() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("file://{}", dir.path().display());
        let options = StoreOptions {
            gzip: Some(false),
            force_legacy_layout: Some(false),
            suppress_legacy_warning: Some(true),
        };
        let store =
            Arc::new(StateStore::open_with_options(&url, Some("infra"), options).await.unwrap());
        let stack = store.parse_stack_reference("dev").unwrap();
        store.create_stack(&stack).await.unwrap();

        let (display_tx, _display_rx) = mpsc::channel(16);
        let mut op = operation(scripted(1, None), display_tx, None);
        op.show_permalink = true;

        let (_, result) = store.update(&stack, op).await;
        let link = result.unwrap().unwrap();
        assert!(link.starts_with("file://"));
        assert!(link.ends_with(".stackstore/stacks/infra/dev.json"));
    }
}
