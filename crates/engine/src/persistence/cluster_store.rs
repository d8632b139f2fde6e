//! Cluster record persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use uuid::Uuid;

use super::client::EngineStore;
use super::error::{from_surrealdb_error, PersistenceError, PersistenceResult};

/// Lifecycle status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Init,
    Creating,
    Active,
    Updating,
    Deleting,
    Error,
    UpdateCancelled,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Creating => "CREATING",
            Self::Active => "ACTIVE",
            Self::Updating => "UPDATING",
            Self::Deleting => "DELETING",
            Self::Error => "ERROR",
            Self::UpdateCancelled => "UPDATE_CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Cluster record stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// SurrealDB record ID, populated on reads.
    #[serde(rename = "id", skip_serializing, default)]
    record_id: Option<Thing>,
    /// Cluster identifier.
    #[serde(rename = "cluster_id")]
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Profile nodes in this cluster are built from.
    pub profile_id: String,
    /// How many nodes the cluster should have.
    pub desired_capacity: u32,
    /// Current status.
    pub status: ClusterStatus,
    /// Why the cluster is in its current status.
    pub status_reason: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ClusterRecord {
    /// Create a new cluster record in INIT status.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        profile_id: impl Into<String>,
        desired_capacity: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            record_id: None,
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            profile_id: profile_id.into(),
            desired_capacity,
            status: ClusterStatus::Init,
            status_reason: "cluster initialized".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl EngineStore {
    /// Save a cluster record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn save_cluster(&self, record: &ClusterRecord) -> PersistenceResult<ClusterRecord> {
        let result: Option<ClusterRecord> = self
            .db()
            .upsert(("cluster", &record.id))
            .content(record.clone())
            .await
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::query_failed("failed to save cluster"))
    }

    /// Get a cluster by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the cluster does not exist.
    pub async fn get_cluster(&self, cluster_id: &str) -> PersistenceResult<ClusterRecord> {
        let result: Option<ClusterRecord> = self
            .db()
            .select(("cluster", cluster_id))
            .await
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("cluster", cluster_id))
    }

    /// Record a cluster status transition with its reason.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the cluster does not exist.
    pub async fn set_cluster_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
        reason: &str,
    ) -> PersistenceResult<ClusterRecord> {
        let now = Utc::now();
        let result: Option<ClusterRecord> = self
            .db()
            .query(
                "UPDATE cluster SET status = $status, status_reason = $reason, updated_at = $now \
                 WHERE id = type::thing('cluster', $id) RETURN AFTER",
            )
            .bind(("id", cluster_id.to_string()))
            .bind(("status", status.to_string()))
            .bind(("reason", reason.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("cluster", cluster_id))
    }

    /// Switch the cluster to a new profile.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the cluster does not exist.
    pub async fn update_cluster_profile(
        &self,
        cluster_id: &str,
        profile_id: &str,
    ) -> PersistenceResult<ClusterRecord> {
        let now = Utc::now();
        let result: Option<ClusterRecord> = self
            .db()
            .query(
                "UPDATE cluster SET profile_id = $profile, updated_at = $now \
                 WHERE id = type::thing('cluster', $id) RETURN AFTER",
            )
            .bind(("id", cluster_id.to_string()))
            .bind(("profile", profile_id.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("cluster", cluster_id))
    }

    /// Record a new desired capacity.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the cluster does not exist.
    pub async fn update_cluster_capacity(
        &self,
        cluster_id: &str,
        desired_capacity: u32,
    ) -> PersistenceResult<ClusterRecord> {
        let now = Utc::now();
        let result: Option<ClusterRecord> = self
            .db()
            .query(
                "UPDATE cluster SET desired_capacity = $capacity, updated_at = $now \
                 WHERE id = type::thing('cluster', $id) RETURN AFTER",
            )
            .bind(("id", cluster_id.to_string()))
            .bind(("capacity", desired_capacity))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("cluster", cluster_id))
    }

    /// Durably delete a cluster record.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_cluster(&self, cluster_id: &str) -> PersistenceResult<()> {
        let _: Option<ClusterRecord> = self
            .db()
            .delete(("cluster", cluster_id))
            .await
            .map_err(from_surrealdb_error)?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::persistence::StoreConfig;

    async fn test_store() -> EngineStore {
        let store = EngineStore::connect(StoreConfig::in_memory())
            .await
            .expect("in-memory store should connect");
        store
            .initialize_schema()
            .await
            .expect("schema should apply");
        store
    }

    #[tokio::test]
    async fn should_save_and_get_cluster() {
        let store = test_store().await;
        let record = ClusterRecord::new("web", "profile-1", 3);

        store.save_cluster(&record).await.expect("save");
        let loaded = store.get_cluster(&record.id).await.expect("get");

        assert_eq!(loaded.name, "web");
        assert_eq!(loaded.desired_capacity, 3);
        assert_eq!(loaded.status, ClusterStatus::Init);
    }

    #[tokio::test]
    async fn should_update_status_with_reason() {
        let store = test_store().await;
        let record = ClusterRecord::new("web", "profile-1", 3);
        store.save_cluster(&record).await.expect("save");

        let updated = store
            .set_cluster_status(&record.id, ClusterStatus::Creating, "cluster creation started")
            .await
            .expect("status update");

        assert_eq!(updated.status, ClusterStatus::Creating);
        assert_eq!(updated.status_reason, "cluster creation started");
    }

    #[tokio::test]
    async fn should_swap_profile_and_capacity() {
        let store = test_store().await;
        let record = ClusterRecord::new("web", "profile-1", 3);
        store.save_cluster(&record).await.expect("save");

        let updated = store
            .update_cluster_profile(&record.id, "profile-2")
            .await
            .expect("profile update");
        assert_eq!(updated.profile_id, "profile-2");

        let updated = store
            .update_cluster_capacity(&record.id, 1)
            .await
            .expect("capacity update");
        assert_eq!(updated.desired_capacity, 1);
    }

    #[tokio::test]
    async fn should_delete_cluster() {
        let store = test_store().await;
        let record = ClusterRecord::new("web", "profile-1", 3);
        store.save_cluster(&record).await.expect("save");

        store.delete_cluster(&record.id).await.expect("delete");

        let result = store.get_cluster(&record.id).await;
        assert!(matches!(result, Err(PersistenceError::NotFound { .. })));
    }
}
