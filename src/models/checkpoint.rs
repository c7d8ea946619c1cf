//! Checkpoint model for state document snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named snapshot of the whole state document at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// Unique record identifier.
    pub id: String,
    /// Human-readable label (e.g., "pre-launch").
    pub label: Option<String>,
    /// Serialized state document.
    pub document: serde_json::Value,
    /// Namespace name to SHA-256 of its serialized section.
    pub namespace_digests: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Construct a new checkpoint snapshot.
    #[must_use]
    pub fn new(
        label: Option<String>,
        document: serde_json::Value,
        namespace_digests: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label,
            document,
            namespace_digests,
            created_at: Utc::now(),
        }
    }
}
