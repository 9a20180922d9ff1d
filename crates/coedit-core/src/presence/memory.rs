//! In-process ephemeral presence store

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::models::{ResourceId, UserId};

/// Ephemeral timestamps for one user on one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEntry {
    /// Unix ms
    pub started_at: i64,
    /// Unix ms
    pub last_activity_at: i64,
}

/// Fast, lossy presence backend
///
/// Entries may vanish at any time; the durable activity log is the fallback.
#[async_trait]
pub trait EphemeralPresence: Send + Sync {
    /// Upsert the pair with `last_activity_at = at`, keeping an existing
    /// `started_at`
    async fn touch(&self, resource: &ResourceId, user: &UserId, at: i64) -> Result<()>;

    /// Write an entry verbatim (used to repopulate from the durable log)
    async fn restore(&self, resource: &ResourceId, user: &UserId, entry: PresenceEntry)
        -> Result<()>;

    /// All entries for a resource, stale ones included
    async fn members(&self, resource: &ResourceId) -> Result<Vec<(UserId, PresenceEntry)>>;

    /// Remove the pair from both directions. Returns whether it was present.
    async fn remove(&self, resource: &ResourceId, user: &UserId) -> Result<bool>;

    /// Remove the pair only if its `last_activity_at` is still before
    /// `cutoff`. The check and the removal are atomic, so a concurrent touch
    /// is never lost. Returns whether an entry was evicted.
    async fn evict_if_stale(&self, resource: &ResourceId, user: &UserId, cutoff: i64)
        -> Result<bool>;

    /// Resources the user has an entry on, with that entry
    async fn resources_for(&self, user: &UserId) -> Result<Vec<(ResourceId, PresenceEntry)>>;
}

/// `EphemeralPresence` over sharded concurrent maps
///
/// Each key is updated atomically under its shard lock, so touches on
/// different resources never contend.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    by_resource: DashMap<ResourceId, HashMap<UserId, PresenceEntry>>,
    by_user: DashMap<UserId, HashSet<ResourceId>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.by_resource.clear();
        self.by_user.clear();
    }

    /// Number of resources with at least one entry
    pub fn resource_count(&self) -> usize {
        self.by_resource.len()
    }

    fn link_user(&self, resource: &ResourceId, user: &UserId) {
        self.by_user
            .entry(user.clone())
            .or_default()
            .insert(*resource);
    }

    /// Drop `resource` from the user's inverse set unless a concurrent touch
    /// has put the pair back
    fn unlink_user(&self, resource: &ResourceId, user: &UserId) {
        self.by_resource
            .remove_if(resource, |_, members| members.is_empty());

        if let Some(mut resources) = self.by_user.get_mut(user) {
            let relinked = self
                .by_resource
                .get(resource)
                .is_some_and(|members| members.contains_key(user));
            if !relinked {
                resources.remove(resource);
            }
        }
        self.by_user.remove_if(user, |_, resources| resources.is_empty());
    }
}

#[async_trait]
impl EphemeralPresence for MemoryPresenceStore {
    async fn touch(&self, resource: &ResourceId, user: &UserId, at: i64) -> Result<()> {
        {
            let mut members = self.by_resource.entry(*resource).or_default();
            members
                .entry(user.clone())
                .and_modify(|entry| entry.last_activity_at = entry.last_activity_at.max(at))
                .or_insert(PresenceEntry {
                    started_at: at,
                    last_activity_at: at,
                });
        }
        self.link_user(resource, user);
        Ok(())
    }

    async fn restore(
        &self,
        resource: &ResourceId,
        user: &UserId,
        entry: PresenceEntry,
    ) -> Result<()> {
        self.by_resource
            .entry(*resource)
            .or_default()
            .insert(user.clone(), entry);
        self.link_user(resource, user);
        Ok(())
    }

    async fn members(&self, resource: &ResourceId) -> Result<Vec<(UserId, PresenceEntry)>> {
        Ok(self
            .by_resource
            .get(resource)
            .map(|members| {
                members
                    .iter()
                    .map(|(user, entry)| (user.clone(), *entry))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove(&self, resource: &ResourceId, user: &UserId) -> Result<bool> {
        let removed = self
            .by_resource
            .get_mut(resource)
            .is_some_and(|mut members| members.remove(user).is_some());
        self.unlink_user(resource, user);
        Ok(removed)
    }

    async fn evict_if_stale(
        &self,
        resource: &ResourceId,
        user: &UserId,
        cutoff: i64,
    ) -> Result<bool> {
        let evicted = self.by_resource.get_mut(resource).is_some_and(|mut members| {
            let stale = members
                .get(user)
                .is_some_and(|entry| entry.last_activity_at < cutoff);
            if stale {
                members.remove(user);
            }
            stale
        });
        if evicted {
            self.unlink_user(resource, user);
        }
        Ok(evicted)
    }

    async fn resources_for(&self, user: &UserId) -> Result<Vec<(ResourceId, PresenceEntry)>> {
        let resources: Vec<ResourceId> = self
            .by_user
            .get(user)
            .map(|resources| resources.iter().copied().collect())
            .unwrap_or_default();

        Ok(resources
            .into_iter()
            .filter_map(|resource| {
                let members = self.by_resource.get(&resource)?;
                let entry = members.get(user).copied();
                entry.map(|entry| (resource, entry))
            })
            .collect())
    }
}
