//! Cluster domain entity.
//!
//! A thin stateful wrapper over the persisted record. Orchestration
//! code mutates the entity, which writes through to the store so that
//! parallel readers (other workers, wait loops) observe transitions.

use tracing::debug;

use crate::error::EngineResult;
use crate::persistence::{ClusterRecord, ClusterStatus, EngineStore, NodeRecord};

/// A cluster and its attached policy ids.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub profile_id: String,
    pub desired_capacity: u32,
    pub status: ClusterStatus,
    pub status_reason: String,
    /// Ids of policies attached to this cluster.
    pub policies: Vec<String>,
}

impl Cluster {
    /// Load a cluster and its policy bindings.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the cluster does not exist.
    pub async fn load(store: &EngineStore, cluster_id: &str) -> EngineResult<Self> {
        let record = store.get_cluster(cluster_id).await?;
        let bindings = store.get_cluster_policies(cluster_id).await?;
        Ok(Self {
            id: record.id,
            name: record.name,
            profile_id: record.profile_id,
            desired_capacity: record.desired_capacity,
            status: record.status,
            status_reason: record.status_reason,
            policies: bindings.into_iter().map(|b| b.policy_id).collect(),
        })
    }

    /// Durably record a status transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn set_status(
        &mut self,
        store: &EngineStore,
        status: ClusterStatus,
        reason: impl Into<String>,
    ) -> EngineResult<()> {
        let reason = reason.into();
        let updated = store.set_cluster_status(&self.id, status, &reason).await?;
        self.status = updated.status;
        self.status_reason = updated.status_reason;
        Ok(())
    }

    /// Mark the cluster CREATING. The cluster itself has no physical
    /// resource; member provisioning goes through the node provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn do_create(&mut self, store: &EngineStore) -> EngineResult<()> {
        self.set_status(store, ClusterStatus::Creating, "cluster creation started")
            .await
    }

    /// Switch the cluster to a new profile and mark it UPDATING.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn do_update(
        &mut self,
        store: &EngineStore,
        new_profile_id: &str,
    ) -> EngineResult<bool> {
        if new_profile_id == self.profile_id {
            debug!(cluster_id = %self.id, "profile unchanged, nothing to update");
            return Ok(false);
        }
        let updated = store
            .update_cluster_profile(&self.id, new_profile_id)
            .await?;
        self.profile_id = updated.profile_id;
        self.set_status(store, ClusterStatus::Updating, "cluster update started")
            .await?;
        Ok(true)
    }

    /// Durably delete the cluster record.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn do_delete(&self, store: &EngineStore) -> EngineResult<()> {
        store.delete_cluster(&self.id).await?;
        Ok(())
    }

    /// Current member nodes, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_nodes(&self, store: &EngineStore) -> EngineResult<Vec<NodeRecord>> {
        Ok(store.get_nodes_by_cluster(&self.id).await?)
    }

    /// Shrink the desired capacity after members were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn remove_nodes(
        &mut self,
        store: &EngineStore,
        node_ids: &[String],
    ) -> EngineResult<()> {
        let removed = u32::try_from(node_ids.len()).unwrap_or(u32::MAX);
        let capacity = self.desired_capacity.saturating_sub(removed);
        let updated = store.update_cluster_capacity(&self.id, capacity).await?;
        self.desired_capacity = updated.desired_capacity;
        Ok(())
    }

    /// Fresh record snapshot of this entity's fields.
    #[must_use]
    pub fn to_record(&self) -> ClusterRecord {
        let mut record = ClusterRecord::new(&self.name, &self.profile_id, self.desired_capacity);
        record.id = self.id.clone();
        record.status = self.status;
        record.status_reason = self.status_reason.clone();
        record
    }
}
