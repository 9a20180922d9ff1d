//! coedit-core - Core library for coedit
//!
//! This crate contains the models, durable storage, field-level conflict
//! resolution and presence tracking shared by the coedit services.

pub mod coordinator;
pub mod db;
pub mod error;
pub mod hub;
pub mod models;
pub mod presence;
pub mod resolver;
pub mod util;

pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use hub::{ConnectionId, HubStats, PresenceHub, PresenceSink, ReconcilerHandle};
pub use models::{
    ActiveUser, ConflictReport, FieldMap, PresenceEvent, Resource, ResourceId, ResourceKind,
    UserId,
};
pub use presence::PresenceCache;
pub use resolver::{ConflictResolver, UpdateOutcome};
pub use util::Clock;
