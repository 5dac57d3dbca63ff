//! Core domain model and content fingerprinting for LeadSignal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "lsig-core";

/// Default applied to missing classification tags when a record is first
/// persisted. Never applied during fingerprint comparison.
pub const UNKNOWN_TAG: &str = "Unknown";

/// One observed item from a single source run. Ephemeral: parsers produce a
/// fresh list every run, and lifecycle state lives on [`CatalogRecord`] only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable external identifier and the canonical lookup key.
    pub url: String,
    pub name: String,
    pub description: String,
    /// Registry source id that produced this entity. Scopes removal
    /// detection: one source's run never touches another source's records.
    pub source: String,
    #[serde(default)]
    pub project: Option<String>,
    /// Secondary classification ("type" in the persisted schema).
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

impl Entity {
    /// An entity missing its lookup key or name cannot be catalogued without
    /// producing ambiguous records; such entities are excluded from the
    /// snapshot rather than fingerprinted with missing data.
    pub fn is_well_formed(&self) -> bool {
        !self.url.trim().is_empty() && !self.name.trim().is_empty()
    }
}

/// Persisted catalog row, owned exclusively by the catalog store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub url: String,
    pub fingerprint: String,
    pub name: String,
    pub description: String,
    pub source: String,
    pub project: String,
    pub kind: String,
    pub resource: Option<String>,
    /// Set once at creation, immutable thereafter.
    pub first_seen: DateTime<Utc>,
    /// Advances on every run where the url is observed.
    pub last_seen: DateTime<Utc>,
    /// True while the url was present in the most recent run for its source.
    pub is_active: bool,
}

/// Classified output of one reconciliation run, consumed read-only by the
/// notification and dashboard layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub new: Vec<Entity>,
    pub changed: Vec<Entity>,
    pub removed: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Derives the content identity of an entity: a SHA-256 hex digest over the
/// ordered concatenation of the identity fields `project + kind + name`.
///
/// Identity fields are the ones whose change should be classified as
/// "changed". `description` and `url` are deliberately excluded: a
/// description-only edit refreshes the stored display fields without firing a
/// change event, and the url is the lookup key, not content. Optional fields
/// contribute their raw value or nothing; the `"Unknown"` creation-time
/// default never participates here.
pub fn fingerprint(entity: &Entity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity.project.as_deref().unwrap_or_default().as_bytes());
    hasher.update(entity.kind.as_deref().unwrap_or_default().as_bytes());
    hasher.update(entity.name.as_bytes());
    hex::encode(hasher.finalize())
}
