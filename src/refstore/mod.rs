//! Stack identity resolution and the versioned on-storage layout.
//!
//! A [`ReferenceStore`] translates between stack identity strings and stable
//! storage paths, enforcing the naming grammar of the active layout. Exactly
//! one variant governs a store instance, selected at open time from the
//! persisted metadata version: [`LegacyReferenceStore`] (version 0, flat) or
//! [`ProjectReferenceStore`] (version 1, project-scoped).

pub mod legacy;
pub mod project;

use crate::core::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, RwLock};

pub use legacy::LegacyReferenceStore;
pub use project::ProjectReferenceStore;

/// The fixed organization segment. Self-managed stores have no real
/// organizations; the literal exists for parity with hosted identity strings
/// and is never configurable.
pub const ORGANIZATION_NAME: &str = "organization";

/// Root directory for backend bookkeeping inside the bucket.
pub const BOOKKEEPING_DIR: &str = ".stackstore";

/// Where stack checkpoints live, under [`BOOKKEEPING_DIR`].
pub const STACKS_DIR: &str = ".stackstore/stacks";

/// Where per-stack history lives.
pub const HISTORY_DIR: &str = ".stackstore/history";

/// Where per-stack backups live.
pub const BACKUPS_DIR: &str = ".stackstore/backups";

/// Where per-stack lock entries live.
pub const LOCKS_DIR: &str = ".stackstore/locks";

// ============================================================================
// Stack references
// ============================================================================

/// The parsed, validated identity of a stack.
///
/// Under the legacy layout `project` is always `None`; under the
/// project-scoped layout it is always `Some`. The owning [`ReferenceStore`]
/// enforces this through `validate_reference`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackRef {
    project: Option<String>,
    name: String,
}

impl StackRef {
    pub(crate) fn legacy(name: impl Into<String>) -> Self {
        Self { project: None, name: name.into() }
    }

    pub(crate) fn scoped(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self { project: Some(project.into()), name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    /// The fully qualified form: `organization/<project>/<name>` when
    /// project-scoped, plain `<name>` otherwise.
    pub fn fully_qualified(&self) -> String {
        match &self.project {
            Some(project) => format!("{}/{}/{}", ORGANIZATION_NAME, project, self.name),
            None => self.name.clone(),
        }
    }

    /// Display form that elides the project segment when it matches the
    /// ambient current project.
    pub fn shorthand(&self, current_project: Option<&str>) -> String {
        match (&self.project, current_project) {
            (Some(project), Some(current)) if project == current => self.name.clone(),
            _ => self.fully_qualified(),
        }
    }
}

impl fmt::Display for StackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fully_qualified())
    }
}

// ============================================================================
// Ambient current project
// ============================================================================

/// Process-wide "current project", read concurrently by every operation and
/// written only through [`CurrentProject::set`]. Reads take an immutable
/// snapshot; holders never observe a partially written value.
#[derive(Clone, Default)]
pub struct CurrentProject {
    inner: Arc<RwLock<Option<Arc<str>>>>,
}

impl CurrentProject {
    pub fn new(initial: Option<&str>) -> Self {
        Self { inner: Arc::new(RwLock::new(initial.map(Arc::from))) }
    }

    pub fn get(&self) -> Option<Arc<str>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, project: Option<&str>) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = project.map(Arc::from);
    }
}

// ============================================================================
// Reference store
// ============================================================================

/// Resolves stack identities to storage paths under one layout version.
///
/// Path methods return bucket keys without a file extension; the real object
/// key is `stack_base_path(..) + ".json"` or `+ ".json.gz"`.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Parses an identity string according to this layout's grammar.
    fn parse_reference(&self, reference: &str) -> Result<StackRef>;

    /// Verifies that a reference was produced under this layout. Used
    /// defensively whenever a reference crosses from one variant's origin
    /// into operations on the other.
    fn validate_reference(&self, stack: &StackRef) -> Result<()>;

    /// Base path of the stack's checkpoint file, under [`STACKS_DIR`],
    /// without extension.
    fn stack_base_path(&self, stack: &StackRef) -> String;

    /// Directory holding the stack's history entries, under [`HISTORY_DIR`].
    fn history_dir(&self, stack: &StackRef) -> String;

    /// Directory holding the stack's backups, under [`BACKUPS_DIR`].
    fn backup_dir(&self, stack: &StackRef) -> String;

    /// Enumerates every stack stored under this layout. Foreign objects
    /// (invalid name segments, unrecognized extensions, wrong nesting depth)
    /// are silently skipped.
    async fn list_references(&self) -> Result<Vec<StackRef>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fully_qualified_forms() {
        assert_eq!(StackRef::legacy("dev").fully_qualified(), "dev");
        assert_eq!(
            StackRef::scoped("infra", "dev").fully_qualified(),
            "organization/infra/dev"
        );
    }

    #[test]
    fn test_shorthand_elides_current_project() {
        let stack = StackRef::scoped("infra", "dev");
        assert_eq!(stack.shorthand(Some("infra")), "dev");
        assert_eq!(stack.shorthand(Some("other")), "organization/infra/dev");
        assert_eq!(stack.shorthand(None), "organization/infra/dev");
    }

    #[test]
    fn test_current_project_snapshot() {
        let current = CurrentProject::new(Some("infra"));
        assert_eq!(current.get().as_deref(), Some("infra"));

        let reader = current.clone();
        current.set(Some("web"));
        assert_eq!(reader.get().as_deref(), Some("web"));

        current.set(None);
        assert!(reader.get().is_none());
    }
}
