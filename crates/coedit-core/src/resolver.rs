//! Field-level optimistic concurrency
//!
//! A client submits changes against the version it last saw. When the
//! resource has moved on, the update is still accepted as long as none of
//! the submitted fields were changed after that version. Contested fields
//! are reported back, never merged.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::db::VersionStore;
use crate::error::{Error, Result};
use crate::models::{ConflictReport, FieldMap, Resource, ResourceId};

/// Default number of read-check-write attempts per update
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Result of an accepted update
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    /// Resource state right after the accepted commit
    pub resource: Resource,
    /// Whether the client was behind and the update was merged
    pub merged: bool,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// Decides whether a proposed change set is safe to commit
#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<dyn VersionStore>,
    max_attempts: u32,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Bound the retry loop; values below one are treated as one
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
    }

    /// Submit `proposed` against `client_version`
    ///
    /// Fails with `Conflict` when any proposed field changed after
    /// `client_version`, or when the compare-and-swap keeps losing after
    /// `max_attempts` tries.
    pub async fn propose_update(
        &self,
        id: &ResourceId,
        client_version: u64,
        proposed: &FieldMap,
    ) -> Result<UpdateOutcome> {
        for attempt in 1..=self.max_attempts {
            let current = self.store.read(id).await?;
            current.kind.validate_changes(proposed)?;

            if client_version > current.version {
                return Err(Error::InvalidInput(format!(
                    "version {client_version} is ahead of current version {}",
                    current.version
                )));
            }

            let merged = client_version < current.version;
            if merged {
                let conflicting = conflicting_fields(&current, client_version, proposed);
                if !conflicting.is_empty() {
                    tracing::debug!(
                        resource = %id,
                        client_version,
                        current_version = current.version,
                        fields = ?conflicting,
                        "Rejected contested update"
                    );
                    return Err(conflict(&current, client_version, conflicting));
                }
            }

            match self.store.apply_changes(id, current.version, proposed).await {
                Ok(version) => {
                    // Prefer the stored copy for its commit timestamps unless
                    // another writer has already moved past our version.
                    let resource = match self.store.read(id).await {
                        Ok(stored) if stored.version == version => stored,
                        _ => {
                            let mut local = current;
                            local.apply(proposed, version, chrono::Utc::now().timestamp_millis());
                            local
                        }
                    };
                    tracing::debug!(resource = %id, version, merged, attempt, "Accepted update");
                    return Ok(UpdateOutcome {
                        resource,
                        merged,
                        attempts: attempt,
                    });
                }
                Err(Error::VersionConflict { actual, .. }) => {
                    tracing::debug!(resource = %id, attempt, actual, "Lost compare-and-swap, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        // Out of attempts: report against the latest state
        let current = self.store.read(id).await?;
        let mut conflicting = conflicting_fields(&current, client_version, proposed);
        if conflicting.is_empty() {
            conflicting = proposed.keys().cloned().collect();
        }
        tracing::warn!(
            resource = %id,
            attempts = self.max_attempts,
            "Update kept losing compare-and-swap"
        );
        Err(conflict(&current, client_version, conflicting))
    }
}

/// Proposed fields with a history entry newer than `client_version`
///
/// Only the fields in this request are checked; untouched fields are never
/// considered contested.
pub fn conflicting_fields(
    current: &Resource,
    client_version: u64,
    proposed: &FieldMap,
) -> BTreeSet<String> {
    proposed
        .keys()
        .filter(|field| current.changed_since(field, client_version))
        .cloned()
        .collect()
}

fn conflict(current: &Resource, client_version: u64, fields: BTreeSet<String>) -> Error {
    let current_values = current.values_of(&fields);
    Error::Conflict(Box::new(ConflictReport {
        resource_id: current.id,
        current_version: current.version,
        your_version: client_version,
        conflicting_fields: fields.into_iter().collect(),
        current_values,
        other_active_users: Vec::new(),
    }))
}
