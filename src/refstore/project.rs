//! The project-scoped layout, version 1 of the stack storage format.
//!
//! Stacks nest one level under their project: `stacks/<project>/<name>.json`.
//! Identity strings accept one, two, or three slash-separated segments
//! (`name`, `org/name`, `org/project/name`); the org segment must equal the
//! fixed organization literal and an omitted project is inferred from the
//! ambient current project.

use crate::blob::Bucket;
use crate::core::{MAX_NAME_LENGTH, Result, StoreError, is_name};
use crate::encoding;
use crate::refstore::{
    BACKUPS_DIR, CurrentProject, HISTORY_DIR, ORGANIZATION_NAME, ReferenceStore, STACKS_DIR,
    StackRef,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct ProjectReferenceStore {
    bucket: Arc<dyn Bucket>,
    current_project: CurrentProject,
}

impl ProjectReferenceStore {
    pub fn new(bucket: Arc<dyn Bucket>, current_project: CurrentProject) -> Self {
        Self { bucket, current_project }
    }

    /// Builds a reference without consulting storage. Used by migration to
    /// synthesize the destination identity of a legacy stack.
    pub fn new_reference(&self, project: &str, name: &str) -> StackRef {
        StackRef::scoped(project, name)
    }

    /// Every project that has at least one object under the stacks root.
    pub async fn list_projects(&self) -> Result<Vec<String>> {
        let prefix = format!("{}/", STACKS_DIR);
        let items = self.bucket.list(&prefix).await?;

        let mut projects = BTreeSet::new();
        for item in items {
            if item.is_dir {
                continue;
            }
            let suffix = &item.key[prefix.len()..];
            if let Some((project, _)) = suffix.split_once('/') {
                if is_name(project) {
                    projects.insert(project.to_string());
                }
            }
        }
        Ok(projects.into_iter().collect())
    }
}

#[async_trait]
impl ReferenceStore for ProjectReferenceStore {
    fn parse_reference(&self, reference: &str) -> Result<StackRef> {
        if reference.is_empty() {
            return Err(StoreError::InvalidReference("stack name must not be empty".to_string()));
        }

        // Accepted forms:
        //   <stack-name>
        //   <org-name>/<stack-name>
        //   <org-name>/<project-name>/<stack-name>
        let split: Vec<&str> = reference.split('/').collect();
        let (org, project, name) = match split.as_slice() {
            [name] => (None, None, *name),
            [org, name] => (Some(*org), None, *name),
            [org, project, name] => (Some(*org), Some((*project).to_string()), *name),
            _ => {
                return Err(StoreError::InvalidReference(format!(
                    "could not parse stack reference '{}': expected 'name', \
                     'organization/name', or 'organization/project/name'",
                    reference
                )));
            }
        };

        if let Some(org) = org {
            if org != ORGANIZATION_NAME {
                return Err(StoreError::InvalidReference(format!(
                    "organization name must be '{}'",
                    ORGANIZATION_NAME
                )));
            }
        }

        let project = match project {
            Some(project) => project,
            None => match self.current_project.get() {
                Some(current) => current.to_string(),
                None => {
                    return Err(StoreError::InvalidReference(
                        "no current project found; pass the fully qualified name \
                         (organization/project/stack)"
                            .to_string(),
                    ));
                }
            },
        };

        if project.len() > MAX_NAME_LENGTH {
            return Err(StoreError::InvalidReference(format!(
                "project names are limited to {} characters",
                MAX_NAME_LENGTH
            )));
        }
        if !is_name(&project) {
            return Err(StoreError::InvalidReference(format!(
                "project names may only contain alphanumerics, hyphens, underscores, \
                 and periods: {}",
                project
            )));
        }
        if !is_name(name) {
            return Err(StoreError::InvalidReference(format!(
                "stack names are limited to {} characters and may only contain \
                 alphanumerics, hyphens, underscores, or periods: {}",
                MAX_NAME_LENGTH, name
            )));
        }

        Ok(StackRef::scoped(project, name))
    }

    fn validate_reference(&self, stack: &StackRef) -> Result<()> {
        if stack.project().is_none() {
            return Err(StoreError::InvalidReference(
                "bad stack reference, project was not set".to_string(),
            ));
        }
        Ok(())
    }

    fn stack_base_path(&self, stack: &StackRef) -> String {
        let project = stack.project().unwrap_or_default();
        debug_assert!(!project.is_empty());
        format!("{}/{}/{}", STACKS_DIR, project, stack.name())
    }

    fn history_dir(&self, stack: &StackRef) -> String {
        let project = stack.project().unwrap_or_default();
        debug_assert!(!project.is_empty());
        format!("{}/{}/{}", HISTORY_DIR, project, stack.name())
    }

    fn backup_dir(&self, stack: &StackRef) -> String {
        let project = stack.project().unwrap_or_default();
        debug_assert!(!project.is_empty());
        format!("{}/{}/{}", BACKUPS_DIR, project, stack.name())
    }

    async fn list_references(&self) -> Result<Vec<StackRef>> {
        let prefix = format!("{}/", STACKS_DIR);
        let items = self.bucket.list(&prefix).await?;

        let mut stacks = Vec::with_capacity(items.len());
        for item in items {
            if item.is_dir {
                continue;
            }

            // Keys have the form stacks/<project>/<name>.json[.gz]; anything
            // shallower or deeper is not a stack under this layout.
            let parts: Vec<&str> = item.key[prefix.len()..].split('/').collect();
            let [project, file] = parts.as_slice() else {
                continue;
            };
            if !is_name(project) {
                continue;
            }
            let Some(name) = encoding::stack_file_name(file) else {
                continue;
            };
            if !is_name(name) {
                continue;
            }
            stacks.push(StackRef::scoped(*project, name));
        }
        Ok(stacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBucket;

    fn store(current: Option<&str>) -> ProjectReferenceStore {
        ProjectReferenceStore::new(Arc::new(MemoryBucket::new()), CurrentProject::new(current))
    }

    #[test]
    fn test_parse_forms() {
        let store = store(Some("infra"));

        let stack = store.parse_reference("dev").unwrap();
        assert_eq!(stack, StackRef::scoped("infra", "dev"));

        let stack = store.parse_reference("organization/dev").unwrap();
        assert_eq!(stack, StackRef::scoped("infra", "dev"));

        let stack = store.parse_reference("organization/web/dev").unwrap();
        assert_eq!(stack, StackRef::scoped("web", "dev"));
    }

    #[test]
    fn test_parse_round_trip() {
        let store = store(Some("infra"));
        for input in ["dev", "organization/dev", "organization/web/dev"] {
            let stack = store.parse_reference(input).unwrap();
            assert_eq!(store.parse_reference(&stack.fully_qualified()).unwrap(), stack);
        }
    }

    #[test]
    fn test_parse_rejects_wrong_org() {
        let store = store(Some("infra"));
        let err = store.parse_reference("acme/dev").unwrap_err();
        assert!(err.to_string().contains("organization"));
    }

    #[test]
    fn test_parse_requires_ambient_project_when_omitted() {
        let store = store(None);
        let err = store.parse_reference("dev").unwrap_err();
        assert!(err.to_string().contains("fully qualified"));

        // Fully qualified still works without an ambient project.
        assert!(store.parse_reference("organization/web/dev").is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_segments() {
        let store = store(Some("infra"));
        assert!(store.parse_reference("").is_err());
        assert!(store.parse_reference("organization/bad proj/dev").is_err());
        assert!(store.parse_reference("organization/web/bad name").is_err());
        assert!(store.parse_reference("organization/web/dev/extra").is_err());
        assert!(store.parse_reference(&format!("organization/{}/dev", "p".repeat(101))).is_err());
    }

    #[test]
    fn test_validate_rejects_legacy_refs() {
        let store = store(Some("infra"));
        assert!(store.validate_reference(&StackRef::scoped("infra", "dev")).is_ok());
        assert!(store.validate_reference(&StackRef::legacy("dev")).is_err());
    }

    #[test]
    fn test_paths_are_project_namespaced() {
        let store = store(Some("infra"));
        let stack = StackRef::scoped("infra", "dev");
        assert_eq!(store.stack_base_path(&stack), ".stackstore/stacks/infra/dev");
        assert_eq!(store.history_dir(&stack), ".stackstore/history/infra/dev");
        assert_eq!(store.backup_dir(&stack), ".stackstore/backups/infra/dev");
    }

    #[tokio::test]
    async fn test_list_requires_exactly_two_segments() {
        let bucket = Arc::new(MemoryBucket::new());
        bucket.write(".stackstore/stacks/infra/dev.json", b"{}").await.unwrap();
        bucket.write(".stackstore/stacks/infra/prod.json.gz", b"{}").await.unwrap();
        bucket.write(".stackstore/stacks/shallow.json", b"{}").await.unwrap();
        bucket.write(".stackstore/stacks/infra/deep/nested.json", b"{}").await.unwrap();
        bucket.write(".stackstore/stacks/infra/notes.txt", b"").await.unwrap();
        bucket.write(".stackstore/stacks/bad proj/dev.json", b"{}").await.unwrap();

        let store =
            ProjectReferenceStore::new(bucket, CurrentProject::new(Some("infra")));
        let stacks = store.list_references().await.unwrap();
        assert_eq!(
            stacks,
            vec![StackRef::scoped("infra", "dev"), StackRef::scoped("infra", "prod")]
        );
    }

    #[tokio::test]
    async fn test_list_projects() {
        let bucket = Arc::new(MemoryBucket::new());
        bucket.write(".stackstore/stacks/infra/dev.json", b"{}").await.unwrap();
        bucket.write(".stackstore/stacks/web/dev.json", b"{}").await.unwrap();
        bucket.write(".stackstore/stacks/web/prod.json", b"{}").await.unwrap();
        bucket.write(".stackstore/stacks/loose.json", b"{}").await.unwrap();

        let store =
            ProjectReferenceStore::new(bucket, CurrentProject::new(None));
        assert_eq!(store.list_projects().await.unwrap(), vec!["infra", "web"]);
    }
}
