//! Data models for coedit

mod activity;
mod conflict;
mod presence;
mod resource;
mod schema;

pub use activity::{ActiveUser, ActivitySession, UserId};
pub use conflict::ConflictReport;
pub use presence::{HeartbeatAck, PresenceEvent};
pub use resource::{FieldChange, FieldHistory, FieldMap, Resource, ResourceId};
pub use schema::{FieldSpec, FieldType, ResourceKind};
