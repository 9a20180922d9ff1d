//! Versioned resource model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::schema::ResourceKind;

/// Field name to scalar value
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Field name to its append-only change log
pub type FieldHistory = BTreeMap<String, Vec<FieldChange>>;

/// A unique identifier for a resource, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a new unique resource ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One accepted change to a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Resource version that introduced the change
    pub version: u64,
    /// When the change was committed (Unix ms)
    pub changed_at: i64,
}

/// A shared, versioned resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique identifier
    pub id: ResourceId,
    /// Schema the fields are validated against
    pub kind: ResourceKind,
    /// Starts at 1, incremented by exactly one per accepted update
    pub version: u64,
    /// Current field values
    pub fields: FieldMap,
    /// Per-field change log, used only for conflict detection
    pub field_history: FieldHistory,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl Resource {
    /// Create a new resource at version 1 with an empty history
    #[must_use]
    pub fn new(kind: ResourceKind, fields: FieldMap) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: ResourceId::new(),
            kind,
            version: 1,
            fields,
            field_history: FieldHistory::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `field` has a history entry newer than `version`
    #[must_use]
    pub fn changed_since(&self, field: &str, version: u64) -> bool {
        self.field_history
            .get(field)
            .is_some_and(|changes| changes.iter().any(|change| change.version > version))
    }

    /// Current values of the given fields; absent fields map to `null`
    #[must_use]
    pub fn values_of<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> FieldMap {
        names
            .into_iter()
            .map(|name| {
                let value = self
                    .fields
                    .get(name)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                (name.clone(), value)
            })
            .collect()
    }

    /// Apply `changes` as the commit of `new_version`, appending one history
    /// entry per changed field
    pub fn apply(&mut self, changes: &FieldMap, new_version: u64, changed_at: i64) {
        for (field, value) in changes {
            self.fields.insert(field.clone(), value.clone());
            self.field_history
                .entry(field.clone())
                .or_default()
                .push(FieldChange {
                    version: new_version,
                    changed_at,
                });
        }
        self.version = new_version;
        self.updated_at = changed_at;
    }
}
