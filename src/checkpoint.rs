//! The persisted representation of a stack: checkpoints, snapshots,
//! resources, and the versioned deployment envelope used by export/import.
//!
//! The resource graph is opaque to this backend beyond what rename and
//! migration need: a stable serialization form and the URN structure that
//! encodes each resource's owning stack and project.

use crate::core::{Result, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Version of the deployment envelope produced by export.
pub const DEPLOYMENT_VERSION: u64 = 3;

// ============================================================================
// URNs
// ============================================================================

/// A resource URN: `urn:stack:<stack>::<project>::<type>::<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

const URN_PREFIX: &str = "urn:stack:";

impl Urn {
    pub fn new(stack: &str, project: &str, resource_type: &str, name: &str) -> Self {
        Self(format!("{}{}::{}::{}::{}", URN_PREFIX, stack, project, resource_type, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> Option<Vec<&str>> {
        let rest = self.0.strip_prefix(URN_PREFIX)?;
        let parts: Vec<&str> = rest.split("::").collect();
        if parts.len() == 4 { Some(parts) } else { None }
    }

    pub fn stack(&self) -> Option<&str> {
        self.parts().map(|p| p[0])
    }

    /// The project segment, used by migration to recover a legacy stack's
    /// owning project.
    pub fn project(&self) -> Option<&str> {
        self.parts().map(|p| p[1])
    }

    /// Rewrites the stack segment, and the project segment when `project` is
    /// given. Malformed URNs are left untouched.
    pub fn renamed(&self, stack: &str, project: Option<&str>) -> Urn {
        match self.parts() {
            Some(parts) => Urn::new(stack, project.unwrap_or(parts[1]), parts[2], parts[3]),
            None => self.clone(),
        }
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Resources and snapshots
// ============================================================================

/// One resource in the graph. Inputs and outputs pass through opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub custom: bool,
    /// Set while the resource is pending deletion. Deleted resources do not
    /// block stack removal.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Resource {
    pub fn new(urn: Urn, resource_type: impl Into<String>) -> Self {
        Self {
            urn,
            resource_type: resource_type.into(),
            custom: false,
            delete: false,
            inputs: Value::Null,
            outputs: Value::Null,
            dependencies: Vec::new(),
            provider: None,
        }
    }
}

/// The full resource graph at a point in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Snapshot {
    /// Whether any resource is still live (not marked for deletion).
    pub fn has_live_resources(&self) -> bool {
        self.resources.iter().any(|r| !r.delete)
    }

    /// Rewrites every resource URN (and dependency edge) to the new stack
    /// name, and to a new project when given.
    pub fn rename(&mut self, new_stack: &str, new_project: Option<&str>) {
        for resource in &mut self.resources {
            resource.urn = resource.urn.renamed(new_stack, new_project);
            for dep in &mut resource.dependencies {
                *dep = dep.renamed(new_stack, new_project);
            }
        }
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// The on-storage envelope for a stack's state. `latest` is `None` for a
/// freshly created stack that has never been deployed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Fully qualified stack name this checkpoint belongs to.
    pub stack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<Snapshot>,
}

// ============================================================================
// Export/import envelope
// ============================================================================

/// The versioned, self-describing form produced by export and accepted by
/// import. The inner document is kept as raw JSON so a round trip reproduces
/// it exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UntypedDeployment {
    pub version: u64,
    pub deployment: Value,
}

impl UntypedDeployment {
    pub fn from_snapshot(snapshot: &Option<Snapshot>) -> Result<Self> {
        Ok(Self { version: DEPLOYMENT_VERSION, deployment: serde_json::to_value(snapshot)? })
    }

    pub fn into_snapshot(self) -> Result<Option<Snapshot>> {
        if self.version != DEPLOYMENT_VERSION {
            return Err(StoreError::SerializationError(format!(
                "unsupported deployment version {}",
                self.version
            )));
        }
        Ok(serde_json::from_value(self.deployment)?)
    }
}
