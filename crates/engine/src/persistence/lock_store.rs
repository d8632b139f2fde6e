//! Cluster lock persistence.
//!
//! One lock record per cluster, keyed by the cluster id. Acquisition is
//! a single `UPSERT` whose `??` coalescing keeps an existing holder in
//! place, so the statement doubles as a compare-and-set: the returned
//! record names whoever holds the lock after the attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use super::client::EngineStore;
use super::error::{from_surrealdb_error, PersistenceError, PersistenceResult};

/// Lock record for a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterLock {
    /// SurrealDB record ID, populated on reads.
    #[serde(rename = "id", skip_serializing, default)]
    record_id: Option<Thing>,
    /// Cluster the lock belongs to.
    pub cluster_id: String,
    /// Action currently holding the lock.
    pub action_id: String,
    /// When the lock was first acquired.
    pub created_at: DateTime<Utc>,
}

impl EngineStore {
    /// Try to lock a cluster for an action.
    ///
    /// Returns the id of the action holding the lock after the attempt;
    /// the caller won the lock iff that id is its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn lock_cluster(
        &self,
        cluster_id: &str,
        action_id: &str,
    ) -> PersistenceResult<String> {
        let now = Utc::now();
        let result: Option<ClusterLock> = self
            .db()
            .query(
                "UPSERT type::thing('cluster_lock', $cluster) SET \
                     cluster_id = $cluster, \
                     action_id = action_id ?? $action, \
                     created_at = created_at ?? $now \
                 RETURN AFTER",
            )
            .bind(("cluster", cluster_id.to_string()))
            .bind(("action", action_id.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        let lock = result
            .ok_or_else(|| PersistenceError::query_failed("lock upsert returned no record"))?;
        Ok(lock.action_id)
    }

    /// Release a cluster lock, but only if the given action holds it.
    ///
    /// Returns whether a lock was actually released.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn unlock_cluster(
        &self,
        cluster_id: &str,
        action_id: &str,
    ) -> PersistenceResult<bool> {
        let result: Option<ClusterLock> = self
            .db()
            .query(
                "DELETE type::thing('cluster_lock', $cluster) \
                 WHERE action_id = $action RETURN BEFORE",
            )
            .bind(("cluster", cluster_id.to_string()))
            .bind(("action", action_id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(result.is_some())
    }

    /// Current holder of a cluster's lock, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn lock_holder(&self, cluster_id: &str) -> PersistenceResult<Option<String>> {
        let result: Option<ClusterLock> = self
            .db()
            .select(("cluster_lock", cluster_id))
            .await
            .map_err(from_surrealdb_error)?;

        Ok(result.map(|lock| lock.action_id))
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
    async fn should_grant_lock_to_first_claimer() {
        let store = test_store().await;

        let holder = store
            .lock_cluster("cluster-1", "action-a")
            .await
            .expect("lock");
        assert_eq!(holder, "action-a");
    }

    #[tokio::test]
    async fn should_keep_existing_holder_on_contention() {
        let store = test_store().await;

        store
            .lock_cluster("cluster-1", "action-a")
            .await
            .expect("lock");
        let holder = store
            .lock_cluster("cluster-1", "action-b")
            .await
            .expect("lock");

        assert_eq!(holder, "action-a", "second claimer must see the holder");
    }

    #[tokio::test]
    async fn should_release_only_for_holder() {
        let store = test_store().await;
        store
            .lock_cluster("cluster-1", "action-a")
            .await
            .expect("lock");

        let released = store
            .unlock_cluster("cluster-1", "action-b")
            .await
            .expect("unlock");
        assert!(!released, "non-holder release must be a no-op");
        assert_eq!(
            store.lock_holder("cluster-1").await.expect("holder"),
            Some("action-a".to_string())
        );

        let released = store
            .unlock_cluster("cluster-1", "action-a")
            .await
            .expect("unlock");
        assert!(released);
        assert_eq!(store.lock_holder("cluster-1").await.expect("holder"), None);
    }

    #[tokio::test]
    async fn should_allow_relock_after_release() {
        let store = test_store().await;
        store
            .lock_cluster("cluster-1", "action-a")
            .await
            .expect("lock");
        store
            .unlock_cluster("cluster-1", "action-a")
            .await
            .expect("unlock");

        let holder = store
            .lock_cluster("cluster-1", "action-b")
            .await
            .expect("lock");
        assert_eq!(holder, "action-b");
    }

    #[tokio::test]
    async fn should_lock_clusters_independently() {
        let store = test_store().await;

        let one = store
            .lock_cluster("cluster-1", "action-a")
            .await
            .expect("lock");
        let two = store
            .lock_cluster("cluster-2", "action-b")
            .await
            .expect("lock");

        assert_eq!(one, "action-a");
        assert_eq!(two, "action-b");
    }
}
