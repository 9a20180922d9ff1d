//! Field-level conflict report

use serde::{Deserialize, Serialize};

use super::activity::ActiveUser;
use super::resource::{FieldMap, ResourceId};

/// Diagnostic payload returned when an update touches contested fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Resource involved in the conflict
    pub resource_id: ResourceId,
    /// Server version at the time of rejection
    pub current_version: u64,
    /// Version the client claimed to have seen
    pub your_version: u64,
    /// Contested field names, sorted
    pub conflicting_fields: Vec<String>,
    /// Current server values of exactly the contested fields
    pub current_values: FieldMap,
    /// Other users currently active on the resource
    #[serde(default)]
    pub other_active_users: Vec<ActiveUser>,
}
