//! Handler for cluster verbs.
//!
//! Cluster operations hold the cluster's exclusive lock for their whole
//! run and fan membership changes out as derived node actions. The
//! parent then parks in a wait loop (status WAITING) until the fan-in
//! machinery promotes it back to READY, checking for cancellation
//! before timeout on every iteration. Every exit path leaves a terminal
//! cluster status and a released lock behind.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::{Action, ActionHandler, ActionStatus, ActionVerb, Outcome, CAUSE_DERIVED};
use crate::cluster::Cluster;
use crate::error::{EngineError, EngineResult};
use crate::node::Node;
use crate::persistence::{ClusterStatus, NodeRecord, PersistenceError};
use crate::policies::PolicyTarget;
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;

/// How a parent's wait on its children ended.
enum WaitResult {
    Ready,
    Cancelled,
    TimedOut,
}

pub struct ClusterActionHandler;

#[async_trait]
impl ActionHandler for ClusterActionHandler {
    async fn execute(&self, action: &mut Action, runtime: &Runtime) -> EngineResult<Outcome> {
        let mut cluster = match Cluster::load(&runtime.store, &action.target).await {
            Ok(cluster) => cluster,
            Err(EngineError::Persistence(PersistenceError::NotFound { .. })) => {
                warn!(cluster_id = %action.target, "cluster is gone, nothing to do");
                return Ok(Outcome::Error);
            }
            Err(err) => return Err(err),
        };

        match action.verb.clone() {
            ActionVerb::ClusterCreate => self.do_create(action, &mut cluster, runtime).await,
            ActionVerb::ClusterUpdate => self.do_update(action, &mut cluster, runtime).await,
            ActionVerb::ClusterDelete => self.do_delete(action, &mut cluster, runtime).await,
            ActionVerb::ClusterScaleDown => {
                self.do_scale_down(action, &mut cluster, runtime).await
            }
            ActionVerb::ClusterAttachPolicy => {
                self.do_attach_policy(action, &mut cluster, runtime).await
            }
            ActionVerb::ClusterDetachPolicy => {
                self.do_detach_policy(action, &mut cluster, runtime).await
            }
            ActionVerb::ClusterAddNodes
            | ActionVerb::ClusterDelNodes
            | ActionVerb::ClusterScaleUp => {
                debug!(verb = %action.verb, "accepted without membership changes");
                Ok(Outcome::Ok)
            }
            other => Err(EngineError::unsupported_action(other.to_string(), "cluster")),
        }
    }

    async fn cancel(&self, action: &mut Action, _runtime: &Runtime) -> EngineResult<Outcome> {
        // The wait loop observes the cancellation flag; nothing to
        // tear down eagerly here.
        debug!(action_id = %action.id, "cluster action acknowledged cancellation");
        Ok(Outcome::Ok)
    }
}

impl ClusterActionHandler {
    /// CLUSTER_CREATE: lock, mark CREATING, fan out one NODE_CREATE per
    /// desired member, wait, then ACTIVE.
    ///
    /// Creation assumes it is the first action on the cluster; finding
    /// the lock held is an integrity violation, not contention.
    async fn do_create(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
    ) -> EngineResult<Outcome> {
        let holder = runtime.store.lock_cluster(&cluster.id, &action.id).await?;
        if holder != action.id {
            error!(
                cluster_id = %cluster.id,
                holder = %holder,
                "cluster already locked before creation"
            );
            return Err(EngineError::lock_integrity(&cluster.id, holder));
        }

        let result = self.run_create(action, cluster, runtime).await;
        self.finish(action, cluster, runtime, result, "cluster creation")
            .await
    }

    async fn run_create(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
    ) -> EngineResult<Outcome> {
        cluster.do_create(&runtime.store).await?;

        let mut children = Vec::new();
        for index in 0..cluster.desired_capacity {
            let node = NodeRecord::new(
                format!("{}-node-{index:03}", cluster.name),
                &cluster.profile_id,
            )
            .with_cluster(&cluster.id);
            runtime.store.save_node(&node).await?;
            let child_id = spawn_child(
                runtime,
                action,
                ActionVerb::NodeCreate,
                &node.id,
                format!("node-create-{index:03}"),
                Map::new(),
            )
            .await?;
            children.push(child_id);
        }

        if children.is_empty() {
            cluster
                .set_status(
                    &runtime.store,
                    ClusterStatus::Active,
                    "cluster creation completed",
                )
                .await?;
            return Ok(Outcome::Ok);
        }

        match wait_for_children(action, runtime, &children, true).await? {
            WaitResult::Cancelled => {
                cluster
                    .set_status(
                        &runtime.store,
                        ClusterStatus::Error,
                        "cluster creation cancelled",
                    )
                    .await?;
                Ok(Outcome::Cancel)
            }
            WaitResult::TimedOut => {
                cluster
                    .set_status(
                        &runtime.store,
                        ClusterStatus::Error,
                        "cluster creation timed out",
                    )
                    .await?;
                Ok(Outcome::Timeout)
            }
            WaitResult::Ready => {
                cluster
                    .set_status(
                        &runtime.store,
                        ClusterStatus::Active,
                        "cluster creation completed",
                    )
                    .await?;
                Ok(Outcome::Ok)
            }
        }
    }

    /// CLUSTER_UPDATE: switch the profile and rebuild every member.
    /// Contention is not worth fighting over; the update simply
    /// cancels. A cancellation mid-rebuild rolls back best-effort.
    async fn do_update(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
    ) -> EngineResult<Outcome> {
        let Some(new_profile_id) = action.input_str("new_profile_id") else {
            warn!(cluster_id = %cluster.id, "cluster update without a new profile");
            return Ok(Outcome::Error);
        };

        let holder = runtime.store.lock_cluster(&cluster.id, &action.id).await?;
        if holder != action.id {
            debug!(
                cluster_id = %cluster.id,
                holder = %holder,
                "cluster busy, cancelling update"
            );
            return Ok(Outcome::Cancel);
        }

        let old_profile_id = cluster.profile_id.clone();
        let result = self
            .run_update(action, cluster, runtime, &new_profile_id, &old_profile_id)
            .await;
        self.finish(action, cluster, runtime, result, "cluster update")
            .await
    }

    async fn run_update(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
        new_profile_id: &str,
        old_profile_id: &str,
    ) -> EngineResult<Outcome> {
        if !cluster.do_update(&runtime.store, new_profile_id).await? {
            cluster
                .set_status(
                    &runtime.store,
                    ClusterStatus::Active,
                    "cluster update was not executed",
                )
                .await?;
            return Ok(Outcome::Ok);
        }

        let nodes = cluster.get_nodes(&runtime.store).await?;
        let mut children = Vec::new();
        for node in &nodes {
            let mut inputs = Map::new();
            inputs.insert(
                "new_profile_id".to_string(),
                Value::String(new_profile_id.to_string()),
            );
            let child_id = spawn_child(
                runtime,
                action,
                ActionVerb::NodeUpdate,
                &node.id,
                format!("node-update-{}", node.name),
                inputs,
            )
            .await?;
            children.push(child_id);
        }

        if children.is_empty() {
            cluster
                .set_status(
                    &runtime.store,
                    ClusterStatus::Active,
                    "cluster update completed",
                )
                .await?;
            return Ok(Outcome::Ok);
        }

        match wait_for_children(action, runtime, &children, true).await? {
            WaitResult::Cancelled => {
                self.cancel_update(action, cluster, runtime, old_profile_id)
                    .await?;
                Ok(Outcome::Cancel)
            }
            WaitResult::TimedOut => {
                cluster
                    .set_status(
                        &runtime.store,
                        ClusterStatus::Error,
                        "cluster update timed out",
                    )
                    .await?;
                Ok(Outcome::Timeout)
            }
            WaitResult::Ready => {
                cluster
                    .set_status(
                        &runtime.store,
                        ClusterStatus::Active,
                        "cluster update completed",
                    )
                    .await?;
                Ok(Outcome::Ok)
            }
        }
    }

    /// Best-effort rollback of an interrupted update: stop or remove
    /// the in-flight child rebuilds, put every member back on the
    /// previous profile and leave the cluster in UPDATE_CANCELLED.
    async fn cancel_update(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
        old_profile_id: &str,
    ) -> EngineResult<()> {
        let store = &runtime.store;
        info!(cluster_id = %cluster.id, "rolling back interrupted cluster update");

        for record in cluster.get_nodes(store).await? {
            match store.get_active_action_by_target(&record.id).await? {
                None => {}
                Some(child) if child.owner.is_some() => {
                    runtime.scheduler.request_cancel(&child.id);
                }
                Some(child) => match store.acquire_action(&child.id, &action.id).await? {
                    Some(claimed) => {
                        store.soft_delete_action(&claimed.id).await?;
                    }
                    None => runtime.scheduler.request_cancel(&child.id),
                },
            }

            let mut node = Node { record };
            if !node
                .do_update(store, runtime.provider.as_ref(), old_profile_id)
                .await?
            {
                warn!(node_id = %node.record.id, "rollback to previous profile failed");
            }
        }

        let restored = store
            .update_cluster_profile(&cluster.id, old_profile_id)
            .await?;
        cluster.profile_id = restored.profile_id;
        cluster
            .set_status(
                store,
                ClusterStatus::UpdateCancelled,
                "cluster update cancelled, previous profile restored",
            )
            .await?;
        Ok(())
    }

    /// CLUSTER_DELETE takes priority: it asks the current lock holder
    /// to cancel and keeps bidding for the lock until it wins or its
    /// own budget runs out, then tears every member down.
    async fn do_delete(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
    ) -> EngineResult<Outcome> {
        cluster
            .set_status(
                &runtime.store,
                ClusterStatus::Deleting,
                "cluster deletion started",
            )
            .await?;

        let mut holder = runtime.store.lock_cluster(&cluster.id, &action.id).await?;
        if holder != action.id {
            info!(
                cluster_id = %cluster.id,
                holder = %holder,
                "preempting lock holder for deletion"
            );
            runtime.scheduler.request_cancel(&holder);
            loop {
                holder = runtime.store.lock_cluster(&cluster.id, &action.id).await?;
                if holder == action.id {
                    break;
                }
                if Scheduler::is_timed_out(action) {
                    cluster
                        .set_status(
                            &runtime.store,
                            ClusterStatus::Error,
                            "cluster deletion timed out waiting for the lock",
                        )
                        .await?;
                    return Ok(Outcome::Timeout);
                }
                runtime.scheduler.reschedule().await;
            }
        }

        let result = self.run_delete(action, cluster, runtime).await;
        self.finish(action, cluster, runtime, result, "cluster deletion")
            .await
    }

    async fn run_delete(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
    ) -> EngineResult<Outcome> {
        let nodes = cluster.get_nodes(&runtime.store).await?;
        let mut children = Vec::new();
        for node in &nodes {
            let child_id = spawn_child(
                runtime,
                action,
                ActionVerb::NodeDelete,
                &node.id,
                format!("node-delete-{}", node.name),
                Map::new(),
            )
            .await?;
            children.push(child_id);
        }

        if !children.is_empty() {
            match wait_for_children(action, runtime, &children, true).await? {
                WaitResult::Cancelled => {
                    cluster
                        .set_status(
                            &runtime.store,
                            ClusterStatus::Error,
                            "cluster deletion cancelled",
                        )
                        .await?;
                    return Ok(Outcome::Cancel);
                }
                WaitResult::TimedOut => {
                    cluster
                        .set_status(
                            &runtime.store,
                            ClusterStatus::Error,
                            "cluster deletion timed out",
                        )
                        .await?;
                    return Ok(Outcome::Timeout);
                }
                WaitResult::Ready => {}
            }
        }

        cluster.do_delete(&runtime.store).await?;
        Ok(Outcome::Ok)
    }

    /// CLUSTER_SCALE_DOWN: non-blocking lock (contention means RETRY),
    /// BEFORE policy check for count/candidates, random fallback
    /// selection, teardown fan-out, AFTER policy check. Not
    /// cancellable once membership changes are in flight.
    async fn do_scale_down(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
    ) -> EngineResult<Outcome> {
        let holder = runtime.store.lock_cluster(&cluster.id, &action.id).await?;
        if holder != action.id {
            debug!(
                cluster_id = %cluster.id,
                holder = %holder,
                "cluster busy, scale-down will retry"
            );
            return Ok(Outcome::Retry);
        }

        let result = self.run_scale_down(action, cluster, runtime).await;
        self.finish(action, cluster, runtime, result, "cluster scale-down")
            .await
    }

    async fn run_scale_down(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
    ) -> EngineResult<Outcome> {
        let check = runtime
            .policy_check(&cluster.id, &PolicyTarget::before(ActionVerb::ClusterScaleDown))
            .await?;
        if !check.is_ok() {
            info!(
                cluster_id = %cluster.id,
                reason = check.reason.as_deref().unwrap_or("no reason given"),
                "scale-down vetoed before execution"
            );
            return Ok(Outcome::Error);
        }

        let mut count = check.count;
        if count == 0 {
            count = action
                .inputs
                .get("count")
                .and_then(Value::as_u64)
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(0);
        }
        let mut candidates = check.candidates;

        if count == 0 && candidates.is_empty() {
            warn!(cluster_id = %cluster.id, "scale-down with nothing to remove");
            return Ok(Outcome::Error);
        }

        if candidates.is_empty() {
            let nodes = cluster.get_nodes(&runtime.store).await?;
            if count > nodes.len() {
                warn!(
                    cluster_id = %cluster.id,
                    count,
                    members = nodes.len(),
                    "removal count exceeds membership, clamping"
                );
                count = nodes.len();
            }
            if count == 0 {
                warn!(cluster_id = %cluster.id, "scale-down on an empty cluster");
                return Ok(Outcome::Error);
            }
            candidates = {
                use rand::seq::SliceRandom;
                let mut rng = rand::thread_rng();
                nodes
                    .choose_multiple(&mut rng, count)
                    .map(|node| node.id.clone())
                    .collect()
            };
        }

        let mut children = Vec::new();
        for node_id in &candidates {
            let child_id = spawn_child(
                runtime,
                action,
                ActionVerb::NodeDelete,
                node_id,
                format!("node-delete-{node_id}"),
                Map::new(),
            )
            .await?;
            children.push(child_id);
        }

        match wait_for_children(action, runtime, &children, false).await? {
            WaitResult::TimedOut => {
                cluster
                    .set_status(
                        &runtime.store,
                        ClusterStatus::Error,
                        "cluster scale-down timed out",
                    )
                    .await?;
                return Ok(Outcome::Timeout);
            }
            WaitResult::Cancelled | WaitResult::Ready => {}
        }

        cluster.remove_nodes(&runtime.store, &candidates).await?;

        let check = runtime
            .policy_check(&cluster.id, &PolicyTarget::after(ActionVerb::ClusterScaleDown))
            .await?;
        if !check.is_ok() {
            info!(
                cluster_id = %cluster.id,
                reason = check.reason.as_deref().unwrap_or("no reason given"),
                "scale-down vetoed after execution"
            );
            return Ok(Outcome::Error);
        }

        cluster
            .set_status(
                &runtime.store,
                ClusterStatus::Active,
                "cluster scale-down completed",
            )
            .await?;
        Ok(Outcome::Ok)
    }

    /// CLUSTER_ATTACH_POLICY: idempotent for the same policy id, a
    /// conflict for a second policy of the same type. Binding settings
    /// default from the policy record.
    async fn do_attach_policy(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
    ) -> EngineResult<Outcome> {
        let store = &runtime.store;
        let Some(policy_id) = action.input_str("policy_id") else {
            return Err(EngineError::PolicyNotSpecified);
        };

        let policy = match store.get_policy(&policy_id).await {
            Ok(policy) => policy,
            Err(PersistenceError::NotFound { .. }) => {
                return Err(EngineError::resource_not_found("policy", policy_id));
            }
            Err(err) => return Err(err.into()),
        };

        for binding in store.get_cluster_policies(&cluster.id).await? {
            if binding.policy_id == policy.id {
                debug!(
                    cluster_id = %cluster.id,
                    policy_id = %policy.id,
                    "policy already attached"
                );
                return Ok(Outcome::Ok);
            }
            let existing = store.get_policy(&binding.policy_id).await?;
            if existing.type_name == policy.type_name {
                return Err(EngineError::policy_type_conflict(policy.type_name));
            }
        }

        let cooldown = action
            .inputs
            .get("cooldown")
            .and_then(Value::as_i64)
            .unwrap_or(policy.cooldown);
        let level = action
            .inputs
            .get("level")
            .and_then(Value::as_i64)
            .unwrap_or(policy.level);
        let enabled = action
            .inputs
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        store
            .attach_policy(&cluster.id, &policy.id, cooldown, level, enabled)
            .await?;
        cluster.policies.push(policy.id);
        Ok(Outcome::Ok)
    }

    /// CLUSTER_DETACH_POLICY: idempotent association removal.
    async fn do_detach_policy(
        &self,
        action: &mut Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
    ) -> EngineResult<Outcome> {
        let Some(policy_id) = action.input_str("policy_id") else {
            return Err(EngineError::PolicyNotSpecified);
        };

        let removed = runtime.store.detach_policy(&cluster.id, &policy_id).await?;
        if !removed {
            debug!(
                cluster_id = %cluster.id,
                policy_id = %policy_id,
                "policy was not attached"
            );
        }
        cluster.policies.retain(|id| id != &policy_id);
        Ok(Outcome::Ok)
    }

    /// Common tail for lock-holding operations: degrade errors to an
    /// ERROR outcome with the cluster marked accordingly, then release
    /// the lock no matter how the operation went.
    async fn finish(
        &self,
        action: &Action,
        cluster: &mut Cluster,
        runtime: &Runtime,
        result: EngineResult<Outcome>,
        operation: &str,
    ) -> EngineResult<Outcome> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    cluster_id = %cluster.id,
                    operation = %operation,
                    error = %err,
                    "cluster operation failed mid-flight"
                );
                let _ = cluster
                    .set_status(
                        &runtime.store,
                        ClusterStatus::Error,
                        format!("{operation} failed: {err}"),
                    )
                    .await;
                Outcome::Error
            }
        };
        runtime.store.unlock_cluster(&cluster.id, &action.id).await?;
        Ok(outcome)
    }
}

/// Create, link and release one derived child action. The child is
/// persisted and its dependency edge registered before it becomes
/// READY, so fan-in bookkeeping is in place before any worker can
/// claim it.
async fn spawn_child(
    runtime: &Runtime,
    parent: &mut Action,
    verb: ActionVerb,
    target: &str,
    name: String,
    inputs: Map<String, Value>,
) -> EngineResult<String> {
    let child = Action::new(parent.context.clone(), verb, target)
        .with_name(name)
        .with_cause(CAUSE_DERIVED)
        .with_inputs(inputs)
        .with_timeout(parent.timeout_secs);
    child.store(&runtime.store).await?;
    runtime.store.add_dependency(&child.id, &parent.id).await?;
    parent.depends_on.push(child.id.clone());
    runtime
        .store
        .update_action_status(&child.id, ActionStatus::Ready, "ready for dispatch", None)
        .await?;
    debug!(
        parent_id = %parent.id,
        child_id = %child.id,
        verb = %child.verb,
        "spawned child action"
    );
    Ok(child.id)
}

/// Park the parent in WAITING, notify the children and poll until the
/// fan-in promotes the parent back to READY. Cancellation is checked
/// before timeout on every iteration.
async fn wait_for_children(
    action: &mut Action,
    runtime: &Runtime,
    children: &[String],
    cancellable: bool,
) -> EngineResult<WaitResult> {
    action
        .set_status(
            &runtime.store,
            ActionStatus::Waiting,
            "waiting for child actions",
        )
        .await?;
    for child_id in children {
        runtime.dispatcher.notify(child_id);
    }

    loop {
        let status = action.get_status(&runtime.store).await?;
        if status == ActionStatus::Ready || action.depends_on.is_empty() {
            return Ok(WaitResult::Ready);
        }
        if cancellable && runtime.scheduler.is_cancelled(&action.id) {
            debug!(action_id = %action.id, "cancellation observed while waiting");
            return Ok(WaitResult::Cancelled);
        }
        if Scheduler::is_timed_out(action) {
            debug!(action_id = %action.id, "time budget exhausted while waiting");
            return Ok(WaitResult::TimedOut);
        }
        runtime.scheduler.reschedule().await;
    }
}
