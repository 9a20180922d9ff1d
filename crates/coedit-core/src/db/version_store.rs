//! Versioned resource storage
//!
//! The store enforces whole-record compare-and-swap on `version` and keeps the
//! per-field history. It knows nothing about which fields conflict.

use std::sync::Arc;

use async_trait::async_trait;
use libsql::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{FieldMap, Resource, ResourceId, ResourceKind};

use super::Database;

/// Trait for versioned resource storage
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Create a resource at version 1
    async fn create(&self, kind: ResourceKind, fields: FieldMap) -> Result<Resource>;

    /// Read the latest committed state, `NotFound` if never created
    async fn read(&self, id: &ResourceId) -> Result<Resource>;

    /// Read for display; may be served by a read-only connection
    async fn read_snapshot(&self, id: &ResourceId) -> Result<Resource> {
        self.read(id).await
    }

    /// Commit `changes` as version `expected_version + 1` if and only if the
    /// stored version is still `expected_version`. Returns the new version.
    async fn apply_changes(
        &self,
        id: &ResourceId,
        expected_version: u64,
        changes: &FieldMap,
    ) -> Result<u64>;
}

/// libSQL implementation of `VersionStore`
#[derive(Clone)]
pub struct LibSqlVersionStore {
    db: Arc<Database>,
}

impl LibSqlVersionStore {
    /// Create a new store over the given database
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn fetch(conn: &Connection, id: &ResourceId) -> Result<Resource> {
        let mut rows = conn
            .query(
                "SELECT id, kind, version, fields, field_history, created_at, updated_at
                 FROM resources WHERE id = ?",
                params![id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Self::parse_resource(&row),
            None => Err(Error::NotFound(format!("resource {id}"))),
        }
    }

    /// Parse a resource from a database row
    fn parse_resource(row: &libsql::Row) -> Result<Resource> {
        let id: String = row.get(0)?;
        let kind: String = row.get(1)?;
        let version: i64 = row.get(2)?;
        let fields: String = row.get(3)?;
        let field_history: String = row.get(4)?;

        Ok(Resource {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid resource id `{id}`")))?,
            kind: kind.parse()?,
            version: from_sql_version(version)?,
            fields: serde_json::from_str(&fields)?,
            field_history: serde_json::from_str(&field_history)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

#[async_trait]
impl VersionStore for LibSqlVersionStore {
    async fn create(&self, kind: ResourceKind, fields: FieldMap) -> Result<Resource> {
        kind.validate_new(&fields)?;
        let resource = Resource::new(kind, fields);

        self.db
            .writer()
            .execute(
                "INSERT INTO resources (id, kind, version, fields, field_history, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    resource.id.as_str(),
                    resource.kind.as_str(),
                    to_sql_version(resource.version)?,
                    serde_json::to_string(&resource.fields)?,
                    serde_json::to_string(&resource.field_history)?,
                    resource.created_at,
                    resource.updated_at
                ],
            )
            .await?;

        tracing::debug!(resource = %resource.id, kind = %resource.kind, "Created resource");
        Ok(resource)
    }

    async fn read(&self, id: &ResourceId) -> Result<Resource> {
        Self::fetch(self.db.writer(), id).await
    }

    async fn read_snapshot(&self, id: &ResourceId) -> Result<Resource> {
        Self::fetch(self.db.reader(), id).await
    }

    async fn apply_changes(
        &self,
        id: &ResourceId,
        expected_version: u64,
        changes: &FieldMap,
    ) -> Result<u64> {
        let conn = self.db.writer();
        let mut resource = Self::fetch(conn, id).await?;
        if resource.version != expected_version {
            return Err(Error::VersionConflict {
                resource: id.to_string(),
                expected: expected_version,
                actual: resource.version,
            });
        }

        let new_version = expected_version + 1;
        let now = chrono::Utc::now().timestamp_millis();
        resource.apply(changes, new_version, now);

        // The version guard makes this single statement the linearization
        // point: fields and history were derived from `expected_version`.
        let rows = conn
            .execute(
                "UPDATE resources
                 SET version = ?, fields = ?, field_history = ?, updated_at = ?
                 WHERE id = ? AND version = ?",
                params![
                    to_sql_version(new_version)?,
                    serde_json::to_string(&resource.fields)?,
                    serde_json::to_string(&resource.field_history)?,
                    now,
                    id.as_str(),
                    to_sql_version(expected_version)?
                ],
            )
            .await?;

        if rows == 0 {
            let actual = Self::fetch(conn, id).await?.version;
            return Err(Error::VersionConflict {
                resource: id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        tracing::debug!(
            resource = %id,
            version = new_version,
            fields = changes.len(),
            "Applied changes"
        );
        Ok(new_version)
    }
}

fn to_sql_version(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| Error::InvalidInput(format!("version {version} out of range")))
}

fn from_sql_version(version: i64) -> Result<u64> {
    u64::try_from(version).map_err(|_| Error::Database(format!("negative version {version}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> LibSqlVersionStore {
        let db = Database::open_in_memory().await.unwrap();
        LibSqlVersionStore::new(Arc::new(db))
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    async fn create_document(store: &LibSqlVersionStore) -> Resource {
        store
            .create(
                ResourceKind::Document,
                fields(&[("name", json!("Plan")), ("data", json!("draft"))]),
            )
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_and_read() {
        let store = setup().await;
        let created = create_document(&store).await;

        let fetched = store.read(&created.id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.version, 1);
        assert!(fetched.field_history.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_rejects_unknown_field() {
        let store = setup().await;
        let err = store
            .create(
                ResourceKind::Document,
                fields(&[("name", json!("Plan")), ("owner", json!("eve"))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_missing_is_not_found() {
        let store = setup().await;
        let err = store.read(&ResourceId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = store
            .apply_changes(&ResourceId::new(), 1, &fields(&[("name", json!("x"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_changes_stamps_history() {
        let store = setup().await;
        let created = create_document(&store).await;

        let version = store
            .apply_changes(&created.id, 1, &fields(&[("name", json!("Final"))]))
            .await
            .unwrap();
        assert_eq!(version, 2);

        let fetched = store.read(&created.id).await.unwrap();
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.fields["name"], json!("Final"));
        assert_eq!(fetched.fields["data"], json!("draft"));
        assert_eq!(fetched.field_history["name"].len(), 1);
        assert_eq!(fetched.field_history["name"][0].version, 2);
        assert!(!fetched.field_history.contains_key("data"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_changes_version_mismatch_does_not_mutate() {
        let store = setup().await;
        let created = create_document(&store).await;
        store
            .apply_changes(&created.id, 1, &fields(&[("data", json!("v2"))]))
            .await
            .unwrap();

        let err = store
            .apply_changes(&created.id, 1, &fields(&[("name", json!("stale"))]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        let fetched = store.read(&created.id).await.unwrap();
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.fields["name"], json!("Plan"));
        assert!(!fetched.field_history.contains_key("name"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_apply_same_expected_version_one_winner() {
        let store = Arc::new(setup().await);
        let created = create_document(&store).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = created.id;
            handles.push(tokio::spawn(async move {
                store
                    .apply_changes(&id, 1, &fields(&[("data", json!(format!("writer-{i}")))]))
                    .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(version) => {
                    assert_eq!(version, 2);
                    successes += 1;
                }
                Err(err) => assert!(matches!(err, Error::VersionConflict { .. })),
            }
        }
        assert_eq!(successes, 1);

        let fetched = store.read(&created.id).await.unwrap();
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.field_history["data"].len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_version_is_one_plus_accepted_updates() {
        let store = setup().await;
        let created = create_document(&store).await;

        for n in 1..=5_u64 {
            let version = store
                .apply_changes(&created.id, n, &fields(&[("data", json!(format!("rev {n}")))]))
                .await
                .unwrap();
            assert_eq!(version, n + 1);
        }

        let fetched = store.read(&created.id).await.unwrap();
        assert_eq!(fetched.version, 6);
        let versions: Vec<u64> = fetched.field_history["data"]
            .iter()
            .map(|change| change.version)
            .collect();
        assert_eq!(versions, vec![2, 3, 4, 5, 6]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_snapshot_matches_read() {
        let store = setup().await;
        let created = create_document(&store).await;
        assert_eq!(store.read_snapshot(&created.id).await.unwrap(), created);
    }
}
