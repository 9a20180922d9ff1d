//! Messages pushed to live presence subscribers

use serde::{Deserialize, Serialize};

use super::activity::{ActiveUser, UserId};
use super::resource::ResourceId;

/// Server-push message for one resource's subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Full active-user snapshot
    PresenceUpdate {
        resource_id: ResourceId,
        active_users: Vec<ActiveUser>,
    },
    UserJoined {
        resource_id: ResourceId,
        user_id: UserId,
    },
    UserLeft {
        resource_id: ResourceId,
        user_id: UserId,
    },
    /// An update was accepted; viewers should refresh the listed fields
    ResourceUpdated {
        resource_id: ResourceId,
        user_id: UserId,
        version: u64,
        fields: Vec<String>,
    },
}

impl PresenceEvent {
    /// Resource the event belongs to
    pub const fn resource_id(&self) -> &ResourceId {
        match self {
            Self::PresenceUpdate { resource_id, .. }
            | Self::UserJoined { resource_id, .. }
            | Self::UserLeft { resource_id, .. }
            | Self::ResourceUpdated { resource_id, .. } => resource_id,
        }
    }
}

/// Acknowledgement returned for a client heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub resource_id: ResourceId,
    pub user_id: UserId,
    /// When the heartbeat was recorded (Unix ms)
    pub at: i64,
}
