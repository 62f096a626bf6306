/// Store layout upgrade tests
///
/// Migrating a legacy flat-layout store to the project-scoped layout
/// Run with: cargo test --test store_upgrade_tests

use stackstore::{
    Resource, Snapshot, StateStore, StoreOptions, UntypedDeployment, UpgradeSummary, Urn,
};
use std::sync::Arc;
use tempfile::TempDir;

async fn open_legacy(dir: &TempDir) -> Arc<StateStore> {
    let url = format!("file://{}", dir.path().display());
    let options = StoreOptions {
        gzip: Some(false),
        force_legacy_layout: Some(true),
        suppress_legacy_warning: Some(true),
    };
    Arc::new(StateStore::open_with_options(&url, None, options).await.unwrap())
}

async fn seed(store: &StateStore, name: &str, project: &str) {
    let stack = store.parse_stack_reference(name).unwrap();
    store.create_stack(&stack).await.unwrap();

    let snapshot = Snapshot {
        resources: vec![Resource::new(
            Urn::new(name, project, "aws:ec2:Instance", "server"),
            "aws:ec2:Instance",
        )],
    };
    let deployment = UntypedDeployment::from_snapshot(&Some(snapshot)).unwrap();
    store.import_deployment(&stack, deployment).await.unwrap();
}

#[tokio::test]
async fn test_upgrade_moves_stacks_and_switches_layout() {
    let dir = TempDir::new().unwrap();
    let store = open_legacy(&dir).await;

    seed(&store, "dev", "infra").await;
    seed(&store, "prod", "web").await;

    let summary = store.upgrade().await.unwrap();
    assert_eq!(summary, UpgradeSummary { total: 2, migrated: 2 });

    // Files moved to the project-scoped locations.
    assert!(dir.path().join(".stackstore/stacks/infra/dev.json").exists());
    assert!(dir.path().join(".stackstore/stacks/web/prod.json").exists());
    assert!(!dir.path().join(".stackstore/stacks/dev.json").exists());

    // The live store instance now speaks project-scoped references.
    let dev = store.parse_stack_reference("organization/infra/dev").unwrap();
    let chk = store.get_stack(&dev).await.unwrap().unwrap();
    assert_eq!(chk.latest.unwrap().resources[0].urn.project(), Some("infra"));
}

#[tokio::test]
async fn test_upgrade_is_durable_across_reopens() {
    let dir = TempDir::new().unwrap();
    let store = open_legacy(&dir).await;
    seed(&store, "dev", "infra").await;
    store.upgrade().await.unwrap();
    drop(store);

    let url = format!("file://{}", dir.path().display());
    let options = StoreOptions {
        gzip: Some(false),
        force_legacy_layout: Some(false),
        suppress_legacy_warning: Some(true),
    };
    let reopened = StateStore::open_with_options(&url, Some("infra"), options).await.unwrap();

    let dev = reopened.parse_stack_reference("dev").unwrap();
    assert!(reopened.get_stack(&dev).await.unwrap().is_some());

    let stacks = reopened.list_stacks().await.unwrap();
    assert_eq!(stacks.len(), 1);
    assert_eq!(stacks[0].resource_count, Some(1));
}

#[tokio::test]
async fn test_never_deployed_stack_is_left_behind() {
    let dir = TempDir::new().unwrap();
    let store = open_legacy(&dir).await;
    seed(&store, "dev", "infra").await;

    // A stack with no resources carries no project and cannot be migrated.
    let empty = store.parse_stack_reference("scratch").unwrap();
    store.create_stack(&empty).await.unwrap();

    let summary = store.upgrade().await.unwrap();
    assert_eq!(summary, UpgradeSummary { total: 2, migrated: 1 });
    assert!(dir.path().join(".stackstore/stacks/scratch.json").exists());
    assert!(dir.path().join(".stackstore/stacks/infra/dev.json").exists());
}
