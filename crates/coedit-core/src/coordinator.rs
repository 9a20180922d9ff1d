//! Request-level operations tying storage, conflict checks and presence
//! together

use std::sync::Arc;

use crate::db::VersionStore;
use crate::error::{Error, Result};
use crate::hub::PresenceHub;
use crate::models::{ActiveUser, FieldMap, Resource, ResourceId, ResourceKind, UserId};
use crate::presence::PresenceCache;
use crate::resolver::{ConflictResolver, UpdateOutcome};

/// Facade used by the external interface
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn VersionStore>,
    resolver: ConflictResolver,
    presence: PresenceCache,
    hub: Arc<PresenceHub>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn VersionStore>, hub: Arc<PresenceHub>, max_attempts: u32) -> Self {
        let resolver = ConflictResolver::new(store.clone()).with_max_attempts(max_attempts);
        Self {
            store,
            resolver,
            presence: hub.presence().clone(),
            hub,
        }
    }

    pub const fn hub(&self) -> &Arc<PresenceHub> {
        &self.hub
    }

    pub const fn presence(&self) -> &PresenceCache {
        &self.presence
    }

    pub async fn create_resource(&self, kind: ResourceKind, fields: FieldMap) -> Result<Resource> {
        let resource = self.store.create(kind, fields).await?;
        tracing::info!(resource = %resource.id, kind = %kind, "Resource created");
        Ok(resource)
    }

    /// Read a resource without recording presence
    pub async fn resource(&self, id: &ResourceId) -> Result<Resource> {
        self.store.read_snapshot(id).await
    }

    /// Read a resource for display and note the caller as active on it
    pub async fn open_resource(&self, id: &ResourceId, user: &UserId) -> Result<Resource> {
        let resource = self.store.read_snapshot(id).await?;
        self.touch(id, user).await;
        Ok(resource)
    }

    /// Users active on a resource; the caller counts as active too
    pub async fn active_users(&self, id: &ResourceId, user: &UserId) -> Result<Vec<ActiveUser>> {
        self.store.read_snapshot(id).await?;
        self.touch(id, user).await;
        self.presence.list_active(id).await
    }

    /// Submit an update on behalf of `user`
    ///
    /// A rejected update comes back as `Conflict` with the other active
    /// users attached; an accepted one is pushed to live subscribers.
    pub async fn update_resource(
        &self,
        id: &ResourceId,
        user: &UserId,
        client_version: u64,
        fields: FieldMap,
    ) -> Result<UpdateOutcome> {
        self.store.read_snapshot(id).await?;
        self.touch(id, user).await;

        match self.resolver.propose_update(id, client_version, &fields).await {
            Ok(outcome) => {
                tracing::info!(
                    resource = %id,
                    user = %user,
                    version = outcome.resource.version,
                    merged = outcome.merged,
                    "Update accepted"
                );
                self.hub
                    .notify_updated(
                        id,
                        user,
                        outcome.resource.version,
                        fields.into_keys().collect(),
                    )
                    .await;
                Ok(outcome)
            }
            Err(Error::Conflict(mut report)) => {
                match self.presence.list_active(id).await {
                    Ok(active) => {
                        report.other_active_users =
                            active.into_iter().filter(|u| &u.user_id != user).collect();
                    }
                    Err(e) => {
                        tracing::warn!(resource = %id, error = %e, "Conflict reported without presence");
                    }
                }
                tracing::info!(
                    resource = %id,
                    user = %user,
                    fields = ?report.conflicting_fields,
                    "Update rejected"
                );
                Err(Error::Conflict(report))
            }
            Err(e) => Err(e),
        }
    }

    /// End the caller's presence on a resource
    pub async fn release_resource(&self, id: &ResourceId, user: &UserId) -> Result<()> {
        self.presence.mark_inactive(id, user).await?;
        tracing::info!(resource = %id, user = %user, "Resource released");
        Ok(())
    }

    /// Resources the caller is present on
    pub async fn active_resources(&self, user: &UserId) -> Result<Vec<ResourceId>> {
        self.presence.active_resources(user).await
    }

    async fn touch(&self, id: &ResourceId, user: &UserId) {
        if let Err(e) = self.presence.record_activity(id, user).await {
            tracing::warn!(resource = %id, user = %user, error = %e, "Activity not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, LibSqlActivityRepository, LibSqlVersionStore};
    use crate::models::PresenceEvent;
    use crate::presence::{MemoryPresenceStore, DEFAULT_PRESENCE_TTL};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn setup() -> Coordinator {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let presence = PresenceCache::new(
            Arc::new(MemoryPresenceStore::new()),
            Arc::new(LibSqlActivityRepository::new(db.clone())),
            DEFAULT_PRESENCE_TTL,
        );
        let hub = Arc::new(PresenceHub::new(presence));
        Coordinator::new(Arc::new(LibSqlVersionStore::new(db)), hub, 3)
    }

    fn user(name: &str) -> UserId {
        name.parse().unwrap()
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    async fn create_profile(coordinator: &Coordinator) -> Resource {
        coordinator
            .create_resource(
                ResourceKind::Profile,
                fields(&[
                    ("username", json!("ada")),
                    ("email", json!("ada@example.com")),
                    ("is_active", json!(true)),
                    ("login_count", json!(0)),
                ]),
            )
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_records_presence() {
        let coordinator = setup().await;
        let resource = create_profile(&coordinator).await;

        let opened = coordinator
            .open_resource(&resource.id, &user("ada"))
            .await
            .unwrap();
        assert_eq!(opened.id, resource.id);

        let active = coordinator
            .active_users(&resource.id, &user("bob"))
            .await
            .unwrap();
        let names: Vec<&str> = active.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(names, vec!["ada", "bob"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_resource_not_found_without_presence() {
        let coordinator = setup().await;
        let missing = ResourceId::new();

        let err = coordinator
            .active_users(&missing, &user("ada"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = coordinator
            .update_resource(&missing, &user("ada"), 1, fields(&[("name", json!("x"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        assert!(coordinator
            .active_resources(&user("ada"))
            .await
            .unwrap()
            .is_empty());
        assert!(coordinator
            .presence()
            .list_active(&missing)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_lists_other_active_users() {
        let coordinator = setup().await;
        let resource = create_profile(&coordinator).await;

        coordinator
            .update_resource(
                &resource.id,
                &user("bob"),
                1,
                fields(&[("email", json!("bob@example.com"))]),
            )
            .await
            .unwrap();

        let err = coordinator
            .update_resource(
                &resource.id,
                &user("ada"),
                1,
                fields(&[("email", json!("ada@example.org"))]),
            )
            .await
            .unwrap_err();
        let Error::Conflict(report) = err else {
            panic!("expected conflict");
        };
        assert_eq!(report.conflicting_fields, vec!["email".to_string()]);
        assert_eq!(report.current_values["email"], json!("bob@example.com"));
        let others: Vec<&str> = report
            .other_active_users
            .iter()
            .map(|u| u.user_id.as_str())
            .collect();
        assert_eq!(others, vec!["bob"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_accepted_update_notifies_viewers() {
        let coordinator = setup().await;
        let resource = create_profile(&coordinator).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator
            .hub()
            .subscribe(&resource.id, &user("viewer"), Arc::new(tx))
            .await
            .unwrap();
        rx.try_recv().unwrap();

        let outcome = coordinator
            .update_resource(
                &resource.id,
                &user("ada"),
                1,
                fields(&[("login_count", json!(1)), ("full_name", json!(null))]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.resource.version, 2);

        assert_eq!(
            rx.try_recv().unwrap(),
            PresenceEvent::ResourceUpdated {
                resource_id: resource.id,
                user_id: user("ada"),
                version: 2,
                fields: vec!["full_name".into(), "login_count".into()],
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_release_removes_presence() {
        let coordinator = setup().await;
        let resource = create_profile(&coordinator).await;

        coordinator
            .open_resource(&resource.id, &user("ada"))
            .await
            .unwrap();
        assert_eq!(
            coordinator.active_resources(&user("ada")).await.unwrap(),
            vec![resource.id]
        );

        coordinator
            .release_resource(&resource.id, &user("ada"))
            .await
            .unwrap();
        assert!(coordinator
            .presence()
            .list_active(&resource.id)
            .await
            .unwrap()
            .is_empty());
    }
}
