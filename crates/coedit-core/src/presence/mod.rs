//! Dual-tier presence tracking
//!
//! A fast ephemeral store answers "who is here" while the durable activity
//! log backs it up. Reads prefer the ephemeral tier and fall back to the log
//! when the cache is cold or unavailable, repopulating it on the way out.

mod memory;

use std::sync::Arc;
use std::time::Duration;

use crate::db::ActivityStore;
use crate::error::{Error, Result};
use crate::models::{ActiveUser, ResourceId, UserId};
use crate::util::{duration_millis, Clock};

pub use memory::{EphemeralPresence, MemoryPresenceStore, PresenceEntry};

/// Default time after which an idle user is no longer present
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(300);

/// Presence facade over an ephemeral store and the durable activity log
#[derive(Clone)]
pub struct PresenceCache {
    ephemeral: Arc<dyn EphemeralPresence>,
    durable: Arc<dyn ActivityStore>,
    ttl: Duration,
    clock: Clock,
}

impl PresenceCache {
    pub fn new(
        ephemeral: Arc<dyn EphemeralPresence>,
        durable: Arc<dyn ActivityStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            ephemeral,
            durable,
            ttl,
            clock: Clock::System,
        }
    }

    /// Replace the time source
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    pub const fn clock(&self) -> &Clock {
        &self.clock
    }

    fn cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(duration_millis(self.ttl))
    }

    /// Note that `user` is working on `resource` right now
    ///
    /// Both tiers are written. A failure of either one is logged; the call
    /// only fails when neither tier accepted the write. Returns the recorded
    /// timestamp.
    pub async fn record_activity(&self, resource: &ResourceId, user: &UserId) -> Result<i64> {
        let now = self.clock.now_millis();

        let ephemeral = self.ephemeral.touch(resource, user, now).await;
        if let Err(e) = &ephemeral {
            tracing::warn!(resource = %resource, user = %user, error = %e, "Ephemeral presence write failed");
        }

        let durable = self.durable.upsert_activity(resource, user, now).await;
        if let Err(e) = &durable {
            tracing::warn!(resource = %resource, user = %user, error = %e, "Durable activity write failed");
        }

        match (ephemeral, durable) {
            (Err(ephemeral), Err(durable)) => Err(Error::TransientStore(format!(
                "presence not recorded: ephemeral: {ephemeral}; durable: {durable}"
            ))),
            _ => Ok(now),
        }
    }

    /// Users present on `resource`, sorted by user id
    ///
    /// Stale ephemeral entries are evicted as they are found. An empty or
    /// failing ephemeral tier falls through to the durable log.
    pub async fn list_active(&self, resource: &ResourceId) -> Result<Vec<ActiveUser>> {
        let now = self.clock.now_millis();
        let cutoff = self.cutoff(now);

        match self.ephemeral.members(resource).await {
            Ok(members) => {
                let mut fresh = Vec::with_capacity(members.len());
                for (user_id, entry) in members {
                    if entry.last_activity_at < cutoff {
                        if let Err(e) = self
                            .ephemeral
                            .evict_if_stale(resource, &user_id, cutoff)
                            .await
                        {
                            tracing::debug!(resource = %resource, user = %user_id, error = %e, "Stale presence eviction failed");
                        }
                        continue;
                    }
                    fresh.push(ActiveUser {
                        user_id,
                        started_at: entry.started_at,
                        last_activity_at: entry.last_activity_at,
                    });
                }
                if !fresh.is_empty() {
                    fresh.sort_by(|a, b| a.user_id.cmp(&b.user_id));
                    return Ok(fresh);
                }
            }
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "Ephemeral presence read failed, using durable log");
            }
        }

        let sessions = self.durable.active_since(resource, cutoff).await?;
        for session in &sessions {
            let entry = PresenceEntry {
                started_at: session.started_at,
                last_activity_at: session.last_activity_at,
            };
            if let Err(e) = self
                .ephemeral
                .restore(resource, &session.user_id, entry)
                .await
            {
                tracing::debug!(resource = %resource, error = %e, "Presence repopulation failed");
                break;
            }
        }

        let mut users: Vec<ActiveUser> = sessions.into_iter().map(ActiveUser::from).collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(users)
    }

    /// End the user's presence on `resource` in both tiers
    pub async fn mark_inactive(&self, resource: &ResourceId, user: &UserId) -> Result<()> {
        let durable = self.durable.deactivate(resource, user).await;
        if let Err(e) = &durable {
            tracing::warn!(resource = %resource, user = %user, error = %e, "Durable deactivate failed");
        }

        let ephemeral = self.ephemeral.remove(resource, user).await;
        if let Err(e) = &ephemeral {
            tracing::warn!(resource = %resource, user = %user, error = %e, "Ephemeral presence removal failed");
        }

        match (ephemeral, durable) {
            (Err(ephemeral), Err(durable)) => Err(Error::TransientStore(format!(
                "presence not cleared: ephemeral: {ephemeral}; durable: {durable}"
            ))),
            _ => Ok(()),
        }
    }

    /// Resources `user` is currently present on, most recent first
    pub async fn active_resources(&self, user: &UserId) -> Result<Vec<ResourceId>> {
        let cutoff = self.cutoff(self.clock.now_millis());

        match self.ephemeral.resources_for(user).await {
            Ok(entries) => {
                let mut fresh: Vec<(ResourceId, PresenceEntry)> = entries
                    .into_iter()
                    .filter(|(_, entry)| entry.last_activity_at >= cutoff)
                    .collect();
                if !fresh.is_empty() {
                    fresh.sort_by(|a, b| b.1.last_activity_at.cmp(&a.1.last_activity_at));
                    return Ok(fresh.into_iter().map(|(resource, _)| resource).collect());
                }
            }
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "Ephemeral presence read failed, using durable log");
            }
        }

        self.durable.active_resources_since(user, cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, LibSqlActivityRepository};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    const TTL: Duration = Duration::from_secs(300);

    struct Fixture {
        cache: PresenceCache,
        memory: Arc<MemoryPresenceStore>,
        clock: Clock,
    }

    async fn setup() -> Fixture {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let memory = Arc::new(MemoryPresenceStore::new());
        let clock = Clock::manual(1_000_000);
        let cache = PresenceCache::new(
            memory.clone(),
            Arc::new(LibSqlActivityRepository::new(db)),
            TTL,
        )
        .with_clock(clock.clone());
        Fixture {
            cache,
            memory,
            clock,
        }
    }

    fn user(name: &str) -> UserId {
        name.parse().unwrap()
    }

    fn names(users: &[ActiveUser]) -> Vec<&str> {
        users.iter().map(|u| u.user_id.as_str()).collect()
    }

    /// Ephemeral tier that is always down
    struct UnavailablePresence;

    #[async_trait]
    impl EphemeralPresence for UnavailablePresence {
        async fn touch(&self, _: &ResourceId, _: &UserId, _: i64) -> Result<()> {
            Err(Error::TransientStore("down".into()))
        }

        async fn restore(&self, _: &ResourceId, _: &UserId, _: PresenceEntry) -> Result<()> {
            Err(Error::TransientStore("down".into()))
        }

        async fn members(&self, _: &ResourceId) -> Result<Vec<(UserId, PresenceEntry)>> {
            Err(Error::TransientStore("down".into()))
        }

        async fn remove(&self, _: &ResourceId, _: &UserId) -> Result<bool> {
            Err(Error::TransientStore("down".into()))
        }

        async fn evict_if_stale(&self, _: &ResourceId, _: &UserId, _: i64) -> Result<bool> {
            Err(Error::TransientStore("down".into()))
        }

        async fn resources_for(&self, _: &UserId) -> Result<Vec<(ResourceId, PresenceEntry)>> {
            Err(Error::TransientStore("down".into()))
        }
    }

    /// Memory store that sees `user` refresh right after every snapshot
    struct RefreshAfterSnapshot {
        inner: MemoryPresenceStore,
        clock: Clock,
        user: UserId,
    }

    #[async_trait]
    impl EphemeralPresence for RefreshAfterSnapshot {
        async fn touch(&self, resource: &ResourceId, user: &UserId, at: i64) -> Result<()> {
            self.inner.touch(resource, user, at).await
        }

        async fn restore(
            &self,
            resource: &ResourceId,
            user: &UserId,
            entry: PresenceEntry,
        ) -> Result<()> {
            self.inner.restore(resource, user, entry).await
        }

        async fn members(&self, resource: &ResourceId) -> Result<Vec<(UserId, PresenceEntry)>> {
            let members = self.inner.members(resource).await?;
            self.inner
                .touch(resource, &self.user, self.clock.now_millis())
                .await?;
            Ok(members)
        }

        async fn remove(&self, resource: &ResourceId, user: &UserId) -> Result<bool> {
            self.inner.remove(resource, user).await
        }

        async fn evict_if_stale(
            &self,
            resource: &ResourceId,
            user: &UserId,
            cutoff: i64,
        ) -> Result<bool> {
            self.inner.evict_if_stale(resource, user, cutoff).await
        }

        async fn resources_for(&self, user: &UserId) -> Result<Vec<(ResourceId, PresenceEntry)>> {
            self.inner.resources_for(user).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_then_list_sorted() {
        let fx = setup().await;
        let resource = ResourceId::new();

        fx.cache.record_activity(&resource, &user("carol")).await.unwrap();
        fx.cache.record_activity(&resource, &user("ada")).await.unwrap();

        let users = fx.cache.list_active(&resource).await.unwrap();
        assert_eq!(names(&users), vec!["ada", "carol"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_entries_never_listed() {
        let fx = setup().await;
        let resource = ResourceId::new();

        fx.cache.record_activity(&resource, &user("idle")).await.unwrap();
        fx.clock.advance(TTL + Duration::from_secs(1));
        fx.cache.record_activity(&resource, &user("busy")).await.unwrap();

        let users = fx.cache.list_active(&resource).await.unwrap();
        assert_eq!(names(&users), vec!["busy"]);

        // Evicted from the ephemeral tier on the way
        let members = fx.memory.members(&resource).await.unwrap();
        assert_eq!(members.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_eviction_keeps_entry_refreshed_after_snapshot() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let clock = Clock::manual(1_000_000);
        let store = Arc::new(RefreshAfterSnapshot {
            inner: MemoryPresenceStore::new(),
            clock: clock.clone(),
            user: user("ada"),
        });
        let cache = PresenceCache::new(
            store.clone(),
            Arc::new(LibSqlActivityRepository::new(db)),
            TTL,
        )
        .with_clock(clock.clone());
        let resource = ResourceId::new();

        cache.record_activity(&resource, &user("ada")).await.unwrap();
        clock.advance(TTL + Duration::from_secs(1));
        cache.record_activity(&resource, &user("bob")).await.unwrap();

        // The snapshot saw ada as stale; the refresh that followed must survive
        assert_eq!(names(&cache.list_active(&resource).await.unwrap()), vec!["bob"]);

        let members = store.inner.members(&resource).await.unwrap();
        let ada = members.iter().find(|(u, _)| u.as_str() == "ada");
        assert_eq!(ada.map(|(_, entry)| entry.last_activity_at), Some(clock.now_millis()));
        assert_eq!(store.inner.resources_for(&user("ada")).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_entry_at_exact_ttl_is_fresh() {
        let fx = setup().await;
        let resource = ResourceId::new();

        fx.cache.record_activity(&resource, &user("ada")).await.unwrap();
        fx.clock.advance(TTL);
        assert_eq!(names(&fx.cache.list_active(&resource).await.unwrap()), vec!["ada"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_all_stale_falls_back_and_stays_empty() {
        let fx = setup().await;
        let resource = ResourceId::new();

        fx.cache.record_activity(&resource, &user("ada")).await.unwrap();
        fx.clock.advance(TTL * 2);

        assert!(fx.cache.list_active(&resource).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_inactive_excludes_user() {
        let fx = setup().await;
        let resource = ResourceId::new();

        fx.cache.record_activity(&resource, &user("ada")).await.unwrap();
        fx.cache.record_activity(&resource, &user("bob")).await.unwrap();
        fx.cache.mark_inactive(&resource, &user("ada")).await.unwrap();

        assert_eq!(names(&fx.cache.list_active(&resource).await.unwrap()), vec!["bob"]);

        // Still excluded once the cache is cold
        fx.memory.clear();
        assert_eq!(names(&fx.cache.list_active(&resource).await.unwrap()), vec!["bob"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cold_cache_repopulates_from_durable_log() {
        let fx = setup().await;
        let resource = ResourceId::new();

        fx.cache.record_activity(&resource, &user("ada")).await.unwrap();
        let before = fx.cache.list_active(&resource).await.unwrap();

        fx.memory.clear();
        let after = fx.cache.list_active(&resource).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(fx.memory.members(&resource).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unavailable_ephemeral_tier_falls_back() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let cache = PresenceCache::new(
            Arc::new(UnavailablePresence),
            Arc::new(LibSqlActivityRepository::new(db)),
            TTL,
        );
        let resource = ResourceId::new();

        cache.record_activity(&resource, &user("ada")).await.unwrap();
        assert_eq!(names(&cache.list_active(&resource).await.unwrap()), vec!["ada"]);
        assert_eq!(
            cache.active_resources(&user("ada")).await.unwrap(),
            vec![resource]
        );

        cache.mark_inactive(&resource, &user("ada")).await.unwrap();
        assert!(cache.list_active(&resource).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_active_resources_most_recent_first() {
        let fx = setup().await;
        let first = ResourceId::new();
        let second = ResourceId::new();

        fx.cache.record_activity(&first, &user("ada")).await.unwrap();
        fx.clock.advance(Duration::from_secs(1));
        fx.cache.record_activity(&second, &user("ada")).await.unwrap();

        assert_eq!(
            fx.cache.active_resources(&user("ada")).await.unwrap(),
            vec![second, first]
        );

        fx.memory.clear();
        assert_eq!(
            fx.cache.active_resources(&user("ada")).await.unwrap(),
            vec![second, first]
        );
    }
}
