//! Policy records and cluster-policy associations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use uuid::Uuid;

use super::client::EngineStore;
use super::error::{from_surrealdb_error, PersistenceError, PersistenceResult};

/// A policy definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    /// SurrealDB record ID, populated on reads.
    #[serde(rename = "id", skip_serializing, default)]
    record_id: Option<Thing>,
    /// Policy identifier.
    #[serde(rename = "policy_id")]
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Policy type, matched against the rule registry.
    pub type_name: String,
    /// Default cooldown in seconds between enforcements.
    pub cooldown: i64,
    /// Default enforcement level.
    pub level: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl PolicyRecord {
    /// Create a new policy record.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        cooldown: i64,
        level: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            record_id: None,
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            type_name: type_name.into(),
            cooldown,
            level,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Association between a cluster and a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterPolicy {
    /// SurrealDB record ID, populated on reads.
    #[serde(rename = "id", skip_serializing, default)]
    record_id: Option<Thing>,
    /// Cluster side of the binding.
    pub cluster_id: String,
    /// Policy side of the binding.
    pub policy_id: String,
    /// Cooldown in seconds between enforcements for this binding.
    pub cooldown: i64,
    /// Enforcement level for this binding.
    pub level: i64,
    /// Whether the binding participates in policy checks.
    pub enabled: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

fn association_key(cluster_id: &str, policy_id: &str) -> String {
    format!("{cluster_id}:{policy_id}")
}

impl EngineStore {
    /// Save a policy record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn save_policy(&self, record: &PolicyRecord) -> PersistenceResult<PolicyRecord> {
        let result: Option<PolicyRecord> = self
            .db()
            .upsert(("policy", &record.id))
            .content(record.clone())
            .await
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::query_failed("failed to save policy"))
    }

    /// Get a policy by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the policy does not exist.
    pub async fn get_policy(&self, policy_id: &str) -> PersistenceResult<PolicyRecord> {
        let result: Option<PolicyRecord> = self
            .db()
            .select(("policy", policy_id))
            .await
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("policy", policy_id))
    }

    /// Bind a policy to a cluster. Re-attaching overwrites the binding
    /// settings, which makes the operation idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn attach_policy(
        &self,
        cluster_id: &str,
        policy_id: &str,
        cooldown: i64,
        level: i64,
        enabled: bool,
    ) -> PersistenceResult<ClusterPolicy> {
        let now = Utc::now();
        let binding = ClusterPolicy {
            record_id: None,
            cluster_id: cluster_id.to_string(),
            policy_id: policy_id.to_string(),
            cooldown,
            level,
            enabled,
            created_at: now,
            updated_at: now,
        };

        let result: Option<ClusterPolicy> = self
            .db()
            .upsert(("cluster_policy", association_key(cluster_id, policy_id)))
            .content(binding)
            .await
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::query_failed("failed to attach policy"))
    }

    /// Remove a policy binding. Returns whether a binding existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn detach_policy(
        &self,
        cluster_id: &str,
        policy_id: &str,
    ) -> PersistenceResult<bool> {
        let result: Option<ClusterPolicy> = self
            .db()
            .delete(("cluster_policy", association_key(cluster_id, policy_id)))
            .await
            .map_err(from_surrealdb_error)?;

        Ok(result.is_some())
    }

    /// Flip a binding's enabled flag.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no binding exists.
    pub async fn set_policy_enabled(
        &self,
        cluster_id: &str,
        policy_id: &str,
        enabled: bool,
    ) -> PersistenceResult<ClusterPolicy> {
        let now = Utc::now();
        let result: Option<ClusterPolicy> = self
            .db()
            .query(
                "UPDATE cluster_policy SET enabled = $enabled, updated_at = $now \
                 WHERE cluster_id = $cluster AND policy_id = $policy RETURN AFTER",
            )
            .bind(("cluster", cluster_id.to_string()))
            .bind(("policy", policy_id.to_string()))
            .bind(("enabled", enabled))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| {
            PersistenceError::not_found("cluster_policy", association_key(cluster_id, policy_id))
        })
    }

    /// All policy bindings of a cluster, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_cluster_policies(
        &self,
        cluster_id: &str,
    ) -> PersistenceResult<Vec<ClusterPolicy>> {
        let bindings: Vec<ClusterPolicy> = self
            .db()
            .query(
                "SELECT * FROM cluster_policy WHERE cluster_id = $cluster ORDER BY created_at",
            )
            .bind(("cluster", cluster_id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(bindings)
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
    async fn should_save_and_get_policy() {
        let store = test_store().await;
        let record = PolicyRecord::new("deletion", "muster.policy.deletion", 60, 1);

        store.save_policy(&record).await.expect("save");
        let loaded = store.get_policy(&record.id).await.expect("get");

        assert_eq!(loaded.type_name, "muster.policy.deletion");
        assert_eq!(loaded.cooldown, 60);
    }

    #[tokio::test]
    async fn should_attach_detach_and_toggle() {
        let store = test_store().await;

        store
            .attach_policy("cluster-1", "policy-1", 60, 1, true)
            .await
            .expect("attach");

        let bindings = store
            .get_cluster_policies("cluster-1")
            .await
            .expect("list");
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].enabled);

        let binding = store
            .set_policy_enabled("cluster-1", "policy-1", false)
            .await
            .expect("disable");
        assert!(!binding.enabled);

        let removed = store
            .detach_policy("cluster-1", "policy-1")
            .await
            .expect("detach");
        assert!(removed);
        let removed_again = store
            .detach_policy("cluster-1", "policy-1")
            .await
            .expect("detach");
        assert!(!removed_again, "second detach is a no-op");
    }

    #[tokio::test]
    async fn should_fail_toggle_without_binding() {
        let store = test_store().await;

        let result = store
            .set_policy_enabled("cluster-1", "policy-9", true)
            .await;
        assert!(matches!(result, Err(PersistenceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn should_overwrite_binding_on_reattach() {
        let store = test_store().await;

        store
            .attach_policy("cluster-1", "policy-1", 60, 1, true)
            .await
            .expect("attach");
        store
            .attach_policy("cluster-1", "policy-1", 120, 2, false)
            .await
            .expect("re-attach");

        let bindings = store
            .get_cluster_policies("cluster-1")
            .await
            .expect("list");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].cooldown, 120);
        assert!(!bindings[0].enabled);
    }
}
