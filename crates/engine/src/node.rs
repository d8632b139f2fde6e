//! Node domain entity and the provisioning seam.
//!
//! Real deployments plug a driver in behind `NodeProvider`; the engine
//! only cares whether the physical operation succeeded. The default
//! provider is a no-op that always succeeds, which is also what the
//! tests build failure injection on.

use async_trait::async_trait;
use tracing::warn;

use crate::error::EngineResult;
use crate::persistence::{EngineStore, NodeRecord, NodeStatus};

/// Backend that materializes node records as physical resources.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Provision the physical resource for a node.
    async fn create_node(&self, node: &NodeRecord) -> bool;

    /// Destroy the physical resource of a node.
    async fn delete_node(&self, node: &NodeRecord) -> bool;

    /// Rebuild a node onto a new profile.
    async fn update_node(&self, node: &NodeRecord, new_profile_id: &str) -> bool;
}

/// Provider that succeeds without doing anything.
pub struct NoopProvider;

#[async_trait]
impl NodeProvider for NoopProvider {
    async fn create_node(&self, _node: &NodeRecord) -> bool {
        true
    }

    async fn delete_node(&self, _node: &NodeRecord) -> bool {
        true
    }

    async fn update_node(&self, _node: &NodeRecord, _new_profile_id: &str) -> bool {
        true
    }
}

/// A node under orchestration.
#[derive(Debug, Clone)]
pub struct Node {
    pub record: NodeRecord,
}

impl Node {
    /// Load a node by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the node does not exist.
    pub async fn load(store: &EngineStore, node_id: &str) -> EngineResult<Self> {
        let record = store.get_node(node_id).await?;
        Ok(Self { record })
    }

    /// Provision the node. Returns whether provisioning succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn do_create(
        &mut self,
        store: &EngineStore,
        provider: &dyn NodeProvider,
    ) -> EngineResult<bool> {
        if provider.create_node(&self.record).await {
            self.record.status = NodeStatus::Active;
            self.record.status_reason = "node created".to_string();
            store.save_node(&self.record).await?;
            Ok(true)
        } else {
            warn!(node_id = %self.record.id, "node provisioning failed");
            self.record.status = NodeStatus::Error;
            self.record.status_reason = "node creation failed".to_string();
            store.save_node(&self.record).await?;
            Ok(false)
        }
    }

    /// Destroy the node and drop its record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn do_delete(
        &mut self,
        store: &EngineStore,
        provider: &dyn NodeProvider,
    ) -> EngineResult<bool> {
        if provider.delete_node(&self.record).await {
            store.delete_node(&self.record.id).await?;
            self.record.status = NodeStatus::Deleted;
            Ok(true)
        } else {
            warn!(node_id = %self.record.id, "node teardown failed");
            self.record.status = NodeStatus::Error;
            self.record.status_reason = "node deletion failed".to_string();
            store.save_node(&self.record).await?;
            Ok(false)
        }
    }

    /// Rebuild the node onto a new profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn do_update(
        &mut self,
        store: &EngineStore,
        provider: &dyn NodeProvider,
        new_profile_id: &str,
    ) -> EngineResult<bool> {
        if provider.update_node(&self.record, new_profile_id).await {
            self.record.profile_id = new_profile_id.to_string();
            self.record.status = NodeStatus::Active;
            self.record.status_reason = "node profile updated".to_string();
            store.save_node(&self.record).await?;
            Ok(true)
        } else {
            warn!(node_id = %self.record.id, "node rebuild failed");
            self.record.status = NodeStatus::Error;
            self.record.status_reason = "node update failed".to_string();
            store.save_node(&self.record).await?;
            Ok(false)
        }
    }

    /// Add the node to a cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn do_join(&mut self, store: &EngineStore, cluster_id: &str) -> EngineResult<bool> {
        self.record.cluster_id = Some(cluster_id.to_string());
        store.save_node(&self.record).await?;
        Ok(true)
    }

    /// Remove the node from its cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn do_leave(&mut self, store: &EngineStore) -> EngineResult<bool> {
        self.record.cluster_id = None;
        store.save_node(&self.record).await?;
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::persistence::StoreConfig;

    /// Provider that fails every operation.
    pub struct FailingProvider;

    #[async_trait]
    impl NodeProvider for FailingProvider {
        async fn create_node(&self, _node: &NodeRecord) -> bool {
            false
        }

        async fn delete_node(&self, _node: &NodeRecord) -> bool {
            false
        }

        async fn update_node(&self, _node: &NodeRecord, _new_profile_id: &str) -> bool {
            false
        }
    }

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

    async fn seeded_node(store: &EngineStore) -> Node {
        let record = NodeRecord::new("node-000", "profile-1");
        store.save_node(&record).await.expect("save");
        Node::load(store, &record.id).await.expect("load")
    }

    #[tokio::test]
    async fn should_activate_node_on_create() {
        let store = test_store().await;
        let mut node = seeded_node(&store).await;

        let ok = node.do_create(&store, &NoopProvider).await.expect("create");

        assert!(ok);
        let record = store.get_node(&node.record.id).await.expect("get");
        assert_eq!(record.status, NodeStatus::Active);
    }

    #[tokio::test]
    async fn should_mark_error_on_failed_create() {
        let store = test_store().await;
        let mut node = seeded_node(&store).await;

        let ok = node
            .do_create(&store, &FailingProvider)
            .await
            .expect("create");

        assert!(!ok);
        let record = store.get_node(&node.record.id).await.expect("get");
        assert_eq!(record.status, NodeStatus::Error);
    }

    #[tokio::test]
    async fn should_drop_record_on_delete() {
        let store = test_store().await;
        let mut node = seeded_node(&store).await;

        let ok = node.do_delete(&store, &NoopProvider).await.expect("delete");

        assert!(ok);
        assert!(store.get_node(&node.record.id).await.is_err());
    }

    #[tokio::test]
    async fn should_keep_record_on_failed_delete() {
        let store = test_store().await;
        let mut node = seeded_node(&store).await;

        let ok = node
            .do_delete(&store, &FailingProvider)
            .await
            .expect("delete");

        assert!(!ok);
        let record = store.get_node(&node.record.id).await.expect("get");
        assert_eq!(record.status, NodeStatus::Error);
    }

    #[tokio::test]
    async fn should_join_and_leave_cluster() {
        let store = test_store().await;
        let mut node = seeded_node(&store).await;

        node.do_join(&store, "cluster-1").await.expect("join");
        let record = store.get_node(&node.record.id).await.expect("get");
        assert_eq!(record.cluster_id.as_deref(), Some("cluster-1"));

        node.do_leave(&store).await.expect("leave");
        let record = store.get_node(&node.record.id).await.expect("get");
        assert!(record.cluster_id.is_none());
    }
}
