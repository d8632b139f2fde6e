//! Node record persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use uuid::Uuid;

use super::client::EngineStore;
use super::error::{from_surrealdb_error, PersistenceError, PersistenceResult};

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Init,
    Active,
    Error,
    Deleted,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Active => "ACTIVE",
            Self::Error => "ERROR",
            Self::Deleted => "DELETED",
        };
        write!(f, "{s}")
    }
}

/// Node record stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// SurrealDB record ID, populated on reads.
    #[serde(rename = "id", skip_serializing, default)]
    record_id: Option<Thing>,
    /// Node identifier.
    #[serde(rename = "node_id")]
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Cluster the node belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    /// Profile the node is built from.
    pub profile_id: String,
    /// Current status.
    pub status: NodeStatus,
    /// Why the node is in its current status.
    pub status_reason: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    /// Create a new orphan node record in INIT status.
    #[must_use]
    pub fn new(name: impl Into<String>, profile_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            record_id: None,
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            cluster_id: None,
            profile_id: profile_id.into(),
            status: NodeStatus::Init,
            status_reason: "node initialized".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Place the node in a cluster.
    #[must_use]
    pub fn with_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }
}

impl EngineStore {
    /// Save a node record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn save_node(&self, record: &NodeRecord) -> PersistenceResult<NodeRecord> {
        let result: Option<NodeRecord> = self
            .db()
            .upsert(("node", &record.id))
            .content(record.clone())
            .await
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::query_failed("failed to save node"))
    }

    /// Get a node by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the node does not exist.
    pub async fn get_node(&self, node_id: &str) -> PersistenceResult<NodeRecord> {
        let result: Option<NodeRecord> = self
            .db()
            .select(("node", node_id))
            .await
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("node", node_id))
    }

    /// All nodes belonging to a cluster, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_nodes_by_cluster(
        &self,
        cluster_id: &str,
    ) -> PersistenceResult<Vec<NodeRecord>> {
        let nodes: Vec<NodeRecord> = self
            .db()
            .query("SELECT * FROM node WHERE cluster_id = $cluster_id ORDER BY created_at")
            .bind(("cluster_id", cluster_id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(nodes)
    }

    /// Durably delete a node record.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_node(&self, node_id: &str) -> PersistenceResult<()> {
        let _: Option<NodeRecord> = self
            .db()
            .delete(("node", node_id))
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
    async fn should_save_and_get_node() {
        let store = test_store().await;
        let record = NodeRecord::new("node-000", "profile-1").with_cluster("cluster-1");

        store.save_node(&record).await.expect("save");
        let loaded = store.get_node(&record.id).await.expect("get");

        assert_eq!(loaded.name, "node-000");
        assert_eq!(loaded.cluster_id.as_deref(), Some("cluster-1"));
        assert_eq!(loaded.status, NodeStatus::Init);
    }

    #[tokio::test]
    async fn should_list_cluster_members_only() {
        let store = test_store().await;
        for i in 0..3 {
            let record = NodeRecord::new(format!("node-{i:03}"), "profile-1")
                .with_cluster("cluster-1");
            store.save_node(&record).await.expect("save");
        }
        let orphan = NodeRecord::new("loner", "profile-1");
        store.save_node(&orphan).await.expect("save");

        let members = store
            .get_nodes_by_cluster("cluster-1")
            .await
            .expect("list");
        assert_eq!(members.len(), 3);
        assert!(members.iter().all(|n| n.cluster_id.as_deref() == Some("cluster-1")));
    }

    #[tokio::test]
    async fn should_delete_node() {
        let store = test_store().await;
        let record = NodeRecord::new("node-000", "profile-1");
        store.save_node(&record).await.expect("save");

        store.delete_node(&record.id).await.expect("delete");

        let result = store.get_node(&record.id).await;
        assert!(matches!(result, Err(PersistenceError::NotFound { .. })));
    }
}
