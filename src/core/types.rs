use crate::core::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

lazy_static! {
    // Stack and project names: alphanumerics, hyphens, underscores, periods.
    static ref NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9._-]+$").unwrap();
}

/// Maximum length of a stack or project name.
pub const MAX_NAME_LENGTH: usize = 100;

/// Returns true if `s` is a valid stack or project name token.
pub fn is_name(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_NAME_LENGTH && NAME_RE.is_match(s)
}

// ============================================================================
// Update kinds and results
// ============================================================================

/// The kind of deployment operation being driven against a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    Preview,
    Update,
    Import,
    Refresh,
    Destroy,
    Watch,
}

impl UpdateKind {
    /// Dry runs never mutate shared state: no lock, no history, no backup.
    pub fn is_dry_run(&self) -> bool {
        matches!(self, UpdateKind::Preview)
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpdateKind::Preview => "preview",
            UpdateKind::Update => "update",
            UpdateKind::Import => "import",
            UpdateKind::Refresh => "refresh",
            UpdateKind::Destroy => "destroy",
            UpdateKind::Watch => "watch",
        };
        write!(f, "{}", label)
    }
}

/// The recorded outcome of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateResult {
    Succeeded,
    Failed,
}

/// Counts of resource operations performed by an update, keyed by operation
/// name ("create", "update", "delete", "same", ...).
pub type ResourceChanges = BTreeMap<String, i64>;

/// One history entry: the durable record of a completed update. Append-only
/// per stack; read back newest-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub kind: UpdateKind,
    /// Unix seconds.
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: ConfigMap,
    pub result: UpdateResult,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_changes: ResourceChanges,
}

// ============================================================================
// Configuration
// ============================================================================

/// A single configuration value, possibly a secret ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secure: bool,
}

impl ConfigValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self { value: value.into(), secure: false }
    }
}

/// Stack configuration as handed to the backend: keys to (possibly secret)
/// values. Secrets management itself is out of scope; ciphertexts pass
/// through opaquely and a [`Decrypter`] is supplied by the caller.
pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// Decrypts secret configuration values. Resolved by the caller; the backend
/// only threads it through to the execution capability.
pub trait Decrypter: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Decrypter for stacks with no secrets: returns the input unchanged.
#[derive(Debug, Default)]
pub struct NopDecrypter;

impl Decrypter for NopDecrypter {
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_name_accepts_valid_tokens() {
        assert!(is_name("dev"));
        assert!(is_name("my-stack_2.prod"));
        assert!(is_name("a"));
        assert!(is_name(&"x".repeat(100)));
    }

    #[test]
    fn test_is_name_rejects_invalid_tokens() {
        assert!(!is_name(""));
        assert!(!is_name("has space"));
        assert!(!is_name("slash/name"));
        assert!(!is_name("bang!"));
        assert!(!is_name(&"x".repeat(101)));
    }

    #[test]
    fn test_dry_run_kinds() {
        assert!(UpdateKind::Preview.is_dry_run());
        assert!(!UpdateKind::Update.is_dry_run());
        assert!(!UpdateKind::Destroy.is_dry_run());
    }
}
