//! Durable activity session log

use std::sync::Arc;

use async_trait::async_trait;
use libsql::params;

use crate::error::{Error, Result};
use crate::models::{ActivitySession, ResourceId, UserId};

use super::Database;

/// Trait for durable activity session storage
///
/// This is the source of truth presence falls back to when the ephemeral
/// store is cold or unavailable.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Create an active session for the pair, or touch the existing one
    async fn upsert_activity(
        &self,
        resource: &ResourceId,
        user: &UserId,
        at: i64,
    ) -> Result<ActivitySession>;

    /// Deactivate the pair's active session. Returns whether one existed.
    async fn deactivate(&self, resource: &ResourceId, user: &UserId) -> Result<bool>;

    /// Active sessions on a resource with activity at or after `cutoff`
    async fn active_since(&self, resource: &ResourceId, cutoff: i64)
        -> Result<Vec<ActivitySession>>;

    /// Resources a user has an active session on with activity at or after `cutoff`
    async fn active_resources_since(&self, user: &UserId, cutoff: i64) -> Result<Vec<ResourceId>>;
}

/// libSQL implementation of `ActivityStore`
#[derive(Clone)]
pub struct LibSqlActivityRepository {
    db: Arc<Database>,
}

impl LibSqlActivityRepository {
    /// Create a new repository over the given database
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Parse a session from a database row
    fn parse_session(row: &libsql::Row) -> Result<ActivitySession> {
        let resource_id: String = row.get(1)?;
        let user_id: String = row.get(2)?;
        Ok(ActivitySession {
            id: row.get(0)?,
            resource_id: parse_resource_id(&resource_id)?,
            user_id: user_id.parse()?,
            started_at: row.get(3)?,
            last_activity_at: row.get(4)?,
            is_active: row.get::<i64>(5)? != 0,
        })
    }
}

#[async_trait]
impl ActivityStore for LibSqlActivityRepository {
    async fn upsert_activity(
        &self,
        resource: &ResourceId,
        user: &UserId,
        at: i64,
    ) -> Result<ActivitySession> {
        // The partial unique index turns a second insert for an active pair
        // into an in-place touch.
        let mut rows = self
            .db
            .writer()
            .query(
                "INSERT INTO activity_sessions
                    (resource_id, user_id, started_at, last_activity_at, is_active)
                 VALUES (?1, ?2, ?3, ?3, 1)
                 ON CONFLICT(resource_id, user_id) WHERE is_active = 1
                 DO UPDATE SET last_activity_at = MAX(last_activity_at, excluded.last_activity_at)
                 RETURNING id, resource_id, user_id, started_at, last_activity_at, is_active",
                params![resource.as_str(), user.as_str(), at],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| Error::Database("activity upsert returned no row".into()))?;
        Self::parse_session(&row)
    }

    async fn deactivate(&self, resource: &ResourceId, user: &UserId) -> Result<bool> {
        let rows = self
            .db
            .writer()
            .execute(
                "UPDATE activity_sessions SET is_active = 0
                 WHERE resource_id = ? AND user_id = ? AND is_active = 1",
                params![resource.as_str(), user.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn active_since(
        &self,
        resource: &ResourceId,
        cutoff: i64,
    ) -> Result<Vec<ActivitySession>> {
        let mut rows = self
            .db
            .reader()
            .query(
                "SELECT id, resource_id, user_id, started_at, last_activity_at, is_active
                 FROM activity_sessions
                 WHERE resource_id = ? AND is_active = 1 AND last_activity_at >= ?
                 ORDER BY user_id ASC",
                params![resource.as_str(), cutoff],
            )
            .await?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await? {
            sessions.push(Self::parse_session(&row)?);
        }
        Ok(sessions)
    }

    async fn active_resources_since(&self, user: &UserId, cutoff: i64) -> Result<Vec<ResourceId>> {
        let mut rows = self
            .db
            .reader()
            .query(
                "SELECT resource_id FROM activity_sessions
                 WHERE user_id = ? AND is_active = 1 AND last_activity_at >= ?
                 ORDER BY last_activity_at DESC",
                params![user.as_str(), cutoff],
            )
            .await?;

        let mut resources = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            resources.push(parse_resource_id(&id)?);
        }
        Ok(resources)
    }
}

fn parse_resource_id(raw: &str) -> Result<ResourceId> {
    raw.parse()
        .map_err(|_| Error::Database(format!("invalid resource id `{raw}`")))
}
