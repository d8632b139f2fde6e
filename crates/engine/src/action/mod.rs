//! The action entity and its dispatch surface.
//!
//! An action is a unit of orchestration work against a cluster, a node
//! or a policy binding. Actions are persisted, claimed by exactly one
//! worker, and move through a one-way state machine:
//! INIT -> WAITING -> READY -> RUNNING -> {SUCCEEDED, FAILED, CANCELLED}.

pub mod cluster;
pub mod custom;
pub mod node;
pub mod policy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use surrealdb::sql::Thing;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::persistence::{ActionQuery, EngineStore};
use crate::runtime::Runtime;

pub use cluster::ClusterActionHandler;
pub use custom::CustomActionHandler;
pub use node::NodeActionHandler;
pub use policy::PolicyActionHandler;

/// Cause recorded on actions created directly by a caller.
pub const CAUSE_RPC: &str = "RPC Request";
/// Cause recorded on actions derived from another action.
pub const CAUSE_DERIVED: &str = "Derived Action";

/// Default wall-clock budget for an action, in seconds.
pub const DEFAULT_TIMEOUT_SECS: i64 = 3600;

/// Lifecycle status of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Created, not yet schedulable.
    Init,
    /// Blocked on unfinished dependencies.
    Waiting,
    /// Eligible for worker claim.
    Ready,
    /// Claimed and executing.
    Running,
    /// Finished with an OK outcome.
    Succeeded,
    /// Finished with an error or timeout.
    Failed,
    /// Stopped by a cancellation request.
    Cancelled,
}

impl ActionStatus {
    /// Terminal statuses are immutable.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Result of executing an action handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed successfully.
    Ok,
    /// Failed; the action moves to FAILED.
    Error,
    /// Could not proceed right now; redispatch with backoff.
    Retry,
    /// Stopped cooperatively; the action moves to CANCELLED.
    Cancel,
    /// Exceeded its time budget; the action moves to FAILED.
    Timeout,
}

/// Category an action verb belongs to, used for handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCategory {
    Cluster,
    Node,
    Policy,
    Custom,
}

impl std::fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cluster => "cluster",
            Self::Node => "node",
            Self::Policy => "policy",
            Self::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

/// The operation an action performs.
///
/// Serialized as the flat wire strings (`CLUSTER_CREATE`, `NODE_JOIN_CLUSTER`,
/// ...) for transport compatibility; anything unrecognized deserializes as
/// `Custom`, which is the extension point for out-of-tree verbs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionVerb {
    ClusterCreate,
    ClusterDelete,
    ClusterUpdate,
    ClusterAddNodes,
    ClusterDelNodes,
    ClusterScaleUp,
    ClusterScaleDown,
    ClusterAttachPolicy,
    ClusterDetachPolicy,
    NodeCreate,
    NodeDelete,
    NodeUpdate,
    NodeJoinCluster,
    NodeLeaveCluster,
    PolicyEnable,
    PolicyDisable,
    PolicyUpdate,
    Custom(String),
}

impl ActionVerb {
    /// The handler category this verb dispatches to.
    #[must_use]
    pub fn category(&self) -> ActionCategory {
        match self {
            Self::ClusterCreate
            | Self::ClusterDelete
            | Self::ClusterUpdate
            | Self::ClusterAddNodes
            | Self::ClusterDelNodes
            | Self::ClusterScaleUp
            | Self::ClusterScaleDown
            | Self::ClusterAttachPolicy
            | Self::ClusterDetachPolicy => ActionCategory::Cluster,
            Self::NodeCreate
            | Self::NodeDelete
            | Self::NodeUpdate
            | Self::NodeJoinCluster
            | Self::NodeLeaveCluster => ActionCategory::Node,
            Self::PolicyEnable | Self::PolicyDisable | Self::PolicyUpdate => {
                ActionCategory::Policy
            }
            Self::Custom(_) => ActionCategory::Custom,
        }
    }
}

impl From<String> for ActionVerb {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CLUSTER_CREATE" => Self::ClusterCreate,
            "CLUSTER_DELETE" => Self::ClusterDelete,
            "CLUSTER_UPDATE" => Self::ClusterUpdate,
            "CLUSTER_ADD_NODES" => Self::ClusterAddNodes,
            "CLUSTER_DEL_NODES" => Self::ClusterDelNodes,
            "CLUSTER_SCALE_UP" => Self::ClusterScaleUp,
            "CLUSTER_SCALE_DOWN" => Self::ClusterScaleDown,
            "CLUSTER_ATTACH_POLICY" => Self::ClusterAttachPolicy,
            "CLUSTER_DETACH_POLICY" => Self::ClusterDetachPolicy,
            "NODE_CREATE" => Self::NodeCreate,
            "NODE_DELETE" => Self::NodeDelete,
            "NODE_UPDATE" => Self::NodeUpdate,
            "NODE_JOIN_CLUSTER" => Self::NodeJoinCluster,
            "NODE_LEAVE_CLUSTER" => Self::NodeLeaveCluster,
            "POLICY_ENABLE" => Self::PolicyEnable,
            "POLICY_DISABLE" => Self::PolicyDisable,
            "POLICY_UPDATE" => Self::PolicyUpdate,
            _ => Self::Custom(value),
        }
    }
}

impl From<ActionVerb> for String {
    fn from(verb: ActionVerb) -> Self {
        verb.to_string()
    }
}

impl std::fmt::Display for ActionVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ClusterCreate => "CLUSTER_CREATE",
            Self::ClusterDelete => "CLUSTER_DELETE",
            Self::ClusterUpdate => "CLUSTER_UPDATE",
            Self::ClusterAddNodes => "CLUSTER_ADD_NODES",
            Self::ClusterDelNodes => "CLUSTER_DEL_NODES",
            Self::ClusterScaleUp => "CLUSTER_SCALE_UP",
            Self::ClusterScaleDown => "CLUSTER_SCALE_DOWN",
            Self::ClusterAttachPolicy => "CLUSTER_ATTACH_POLICY",
            Self::ClusterDetachPolicy => "CLUSTER_DETACH_POLICY",
            Self::NodeCreate => "NODE_CREATE",
            Self::NodeDelete => "NODE_DELETE",
            Self::NodeUpdate => "NODE_UPDATE",
            Self::NodeJoinCluster => "NODE_JOIN_CLUSTER",
            Self::NodeLeaveCluster => "NODE_LEAVE_CLUSTER",
            Self::PolicyEnable => "POLICY_ENABLE",
            Self::PolicyDisable => "POLICY_DISABLE",
            Self::PolicyUpdate => "POLICY_UPDATE",
            Self::Custom(name) => name,
        };
        write!(f, "{s}")
    }
}

/// A persisted unit of orchestration work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// SurrealDB record ID, populated on reads.
    #[serde(rename = "id", skip_serializing, default)]
    record_id: Option<Thing>,
    /// Action identifier.
    #[serde(rename = "action_id")]
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Caller identity, persisted so any worker can resume the work.
    pub context: RequestContext,
    /// Id of the object the action operates on.
    pub target: String,
    /// The operation to perform.
    pub verb: ActionVerb,
    /// Why the action exists (RPC request or derived from a parent).
    pub cause: String,
    /// Worker currently executing the action, if claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Repeat interval in seconds; -1 means one-shot.
    pub interval: i64,
    /// When execution started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When execution reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Wall-clock budget in seconds, measured from `start_time`.
    pub timeout_secs: i64,
    /// Current lifecycle status.
    pub status: ActionStatus,
    /// Why the action is in its current status.
    pub status_reason: String,
    /// Operation parameters.
    pub inputs: Map<String, Value>,
    /// Execution results.
    pub outputs: Map<String, Value>,
    /// Ids of actions that must finish before this one may run.
    pub depends_on: Vec<String>,
    /// Ids of actions waiting on this one.
    pub depended_by: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Worker-level redispatch count for RETRY outcomes.
    #[serde(default)]
    pub retry_count: u32,
}

impl Action {
    /// Create a new action in INIT status.
    #[must_use]
    pub fn new(context: RequestContext, verb: ActionVerb, target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            record_id: None,
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            description: String::new(),
            context,
            target: target.into(),
            verb,
            cause: CAUSE_RPC.to_string(),
            owner: None,
            interval: -1,
            start_time: None,
            end_time: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            status: ActionStatus::Init,
            status_reason: "action initialized".to_string(),
            inputs: Map::new(),
            outputs: Map::new(),
            depends_on: Vec::new(),
            depended_by: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            retry_count: 0,
        }
    }

    /// Create a cluster-scoped action.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedAction` if the verb is not a cluster verb.
    pub fn cluster(
        context: RequestContext,
        verb: ActionVerb,
        cluster_id: impl Into<String>,
    ) -> EngineResult<Self> {
        if verb.category() != ActionCategory::Cluster {
            return Err(EngineError::unsupported_action(
                verb.to_string(),
                ActionCategory::Cluster.to_string(),
            ));
        }
        Ok(Self::new(context, verb, cluster_id))
    }

    /// Create a node-scoped action.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedAction` if the verb is not a node verb.
    pub fn node(
        context: RequestContext,
        verb: ActionVerb,
        node_id: impl Into<String>,
    ) -> EngineResult<Self> {
        if verb.category() != ActionCategory::Node {
            return Err(EngineError::unsupported_action(
                verb.to_string(),
                ActionCategory::Node.to_string(),
            ));
        }
        Ok(Self::new(context, verb, node_id))
    }

    /// Create a policy-scoped action. The target is the cluster the
    /// policy binding belongs to; the binding itself goes in the inputs.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedAction` if the verb is not a policy verb.
    pub fn policy(
        context: RequestContext,
        verb: ActionVerb,
        cluster_id: impl Into<String>,
        policy_id: impl Into<String>,
    ) -> EngineResult<Self> {
        if verb.category() != ActionCategory::Policy {
            return Err(EngineError::unsupported_action(
                verb.to_string(),
                ActionCategory::Policy.to_string(),
            ));
        }
        let cluster_id = cluster_id.into();
        let mut action = Self::new(context, verb, cluster_id.clone());
        action
            .inputs
            .insert("cluster_id".to_string(), Value::String(cluster_id));
        action
            .inputs
            .insert("policy_id".to_string(), Value::String(policy_id.into()));
        Ok(action)
    }

    /// Set the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = cause.into();
        self
    }

    /// Set the operation inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Set the timeout budget in seconds.
    #[must_use]
    pub fn with_timeout(mut self, timeout_secs: i64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set the repeat interval in seconds (-1 for one-shot).
    #[must_use]
    pub fn with_interval(mut self, interval: i64) -> Self {
        self.interval = interval;
        self
    }

    /// Read a string input by key.
    #[must_use]
    pub fn input_str(&self, key: &str) -> Option<String> {
        self.inputs
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Persist the action.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub async fn store(&self, store: &EngineStore) -> EngineResult<()> {
        store.save_action(self).await?;
        Ok(())
    }

    /// Load an action by id. Soft-deleted actions are not visible.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no live record exists.
    pub async fn load(store: &EngineStore, action_id: &str) -> EngineResult<Self> {
        Ok(store.get_action(action_id).await?)
    }

    /// Load actions matching a filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn load_all(store: &EngineStore, query: &ActionQuery) -> EngineResult<Vec<Self>> {
        Ok(store.list_actions(query).await?)
    }

    /// Soft-delete an action, hiding it from loads and claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the action does not exist.
    pub async fn soft_delete(store: &EngineStore, action_id: &str) -> EngineResult<()> {
        store.soft_delete_action(action_id).await?;
        Ok(())
    }

    /// Durably record a status transition, together with a reason.
    ///
    /// Terminal statuses also record `end_time` and clear the owner.
    ///
    /// # Errors
    ///
    /// Returns an error when transitioning out of a terminal status or
    /// when the store update fails.
    pub async fn set_status(
        &mut self,
        store: &EngineStore,
        status: ActionStatus,
        reason: impl Into<String>,
    ) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::internal(format!(
                "action '{}' already finished as {}",
                self.id, self.status
            )));
        }
        let reason = reason.into();
        let updated = match status {
            ActionStatus::Succeeded => store.mark_action_succeeded(&self.id, &reason).await?,
            ActionStatus::Failed => store.mark_action_failed(&self.id, &reason).await?,
            ActionStatus::Cancelled => store.mark_action_cancelled(&self.id, &reason).await?,
            other => {
                if other == ActionStatus::Running && self.start_time.is_none() {
                    self.start_time = Some(Utc::now());
                }
                store
                    .update_action_status(&self.id, other, &reason, self.start_time)
                    .await?
            }
        };
        self.sync_from(&updated);
        Ok(())
    }

    /// Re-read the persisted status, refreshing the local copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the action cannot be read back.
    pub async fn get_status(&mut self, store: &EngineStore) -> EngineResult<ActionStatus> {
        let current = store.get_action(&self.id).await?;
        self.sync_from(&current);
        Ok(self.status)
    }

    fn sync_from(&mut self, other: &Self) {
        self.record_id = other.record_id.clone();
        self.status = other.status;
        self.status_reason = other.status_reason.clone();
        self.owner = other.owner.clone();
        self.start_time = other.start_time;
        self.end_time = other.end_time;
        self.depends_on = other.depends_on.clone();
        self.depended_by = other.depended_by.clone();
        self.updated_at = other.updated_at;
        self.retry_count = other.retry_count;
    }

    /// Execute the action by dispatching to the handler for its verb's
    /// category.
    ///
    /// # Errors
    ///
    /// Validation failures return an error; orchestration failures map
    /// to `Outcome::Error`.
    pub async fn execute(&mut self, runtime: &Runtime) -> EngineResult<Outcome> {
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        let handlers = runtime.handlers();
        handlers.resolve(self.verb.category()).execute(self, runtime).await
    }

    /// Run the handler's cancellation hook.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler's cancellation fails.
    pub async fn cancel(&mut self, runtime: &Runtime) -> EngineResult<Outcome> {
        let handlers = runtime.handlers();
        handlers.resolve(self.verb.category()).cancel(self, runtime).await
    }

    /// Serialize to a flat map for transport.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_map(&self) -> EngineResult<Map<String, Value>> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(EngineError::internal("action did not serialize to a map")),
            Err(err) => Err(EngineError::internal(format!(
                "action serialization failed: {err}"
            ))),
        }
    }

    /// Deserialize from a transport map, validating required fields.
    ///
    /// # Errors
    ///
    /// Returns `MissingTarget` when the target is absent or empty, or an
    /// internal error for a malformed map.
    pub fn from_map(map: Map<String, Value>) -> EngineResult<Self> {
        let verb = map
            .get("verb")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let action: Self = serde_json::from_value(Value::Object(map))
            .map_err(|err| EngineError::internal(format!("malformed action map: {err}")))?;
        if action.target.is_empty() {
            return Err(EngineError::missing_target(verb));
        }
        Ok(action)
    }
}

/// Behavior bound to one action category.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute the action against its target.
    async fn execute(&self, action: &mut Action, runtime: &Runtime) -> EngineResult<Outcome>;

    /// Cooperatively stop the action.
    async fn cancel(&self, action: &mut Action, runtime: &Runtime) -> EngineResult<Outcome>;
}

/// Maps an action category to its handler.
pub struct HandlerRegistry {
    cluster: ClusterActionHandler,
    node: NodeActionHandler,
    policy: PolicyActionHandler,
    custom: CustomActionHandler,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cluster: ClusterActionHandler,
            node: NodeActionHandler,
            policy: PolicyActionHandler,
            custom: CustomActionHandler,
        }
    }

    /// Resolve the handler for a category.
    #[must_use]
    pub fn resolve(&self, category: ActionCategory) -> &dyn ActionHandler {
        match category {
            ActionCategory::Cluster => &self.cluster,
            ActionCategory::Node => &self.node,
            ActionCategory::Policy => &self.policy,
            ActionCategory::Custom => &self.custom,
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("user-1", "project-1")
    }

    #[test]
    fn should_parse_known_verbs() {
        assert_eq!(
            ActionVerb::from("CLUSTER_SCALE_DOWN".to_string()),
            ActionVerb::ClusterScaleDown
        );
        assert_eq!(
            ActionVerb::from("NODE_JOIN_CLUSTER".to_string()),
            ActionVerb::NodeJoinCluster
        );
        assert_eq!(
            ActionVerb::from("POLICY_DISABLE".to_string()),
            ActionVerb::PolicyDisable
        );
    }

    #[test]
    fn should_treat_unknown_verb_as_custom() {
        let verb = ActionVerb::from("FLUSH_CACHES".to_string());
        assert_eq!(verb, ActionVerb::Custom("FLUSH_CACHES".to_string()));
        assert_eq!(verb.category(), ActionCategory::Custom);
        assert_eq!(verb.to_string(), "FLUSH_CACHES");
    }

    #[test]
    fn should_map_verbs_to_categories() {
        assert_eq!(
            ActionVerb::ClusterAttachPolicy.category(),
            ActionCategory::Cluster
        );
        assert_eq!(ActionVerb::NodeDelete.category(), ActionCategory::Node);
        assert_eq!(ActionVerb::PolicyUpdate.category(), ActionCategory::Policy);
    }

    #[test]
    fn should_reject_mismatched_scoped_constructor() {
        let err = Action::cluster(ctx(), ActionVerb::NodeCreate, "cluster-1");
        assert!(matches!(
            err,
            Err(EngineError::UnsupportedAction { ref verb, ref category })
                if verb == "NODE_CREATE" && category == "cluster"
        ));

        let err = Action::node(ctx(), ActionVerb::ClusterDelete, "node-1");
        assert!(err.is_err());

        let err = Action::policy(ctx(), ActionVerb::ClusterCreate, "cluster-1", "policy-1");
        assert!(err.is_err());
    }

    #[test]
    fn should_accept_matching_scoped_constructor() {
        let action = Action::cluster(ctx(), ActionVerb::ClusterCreate, "cluster-1")
            .expect("cluster verb should construct");
        assert_eq!(action.target, "cluster-1");
        assert_eq!(action.status, ActionStatus::Init);
        assert_eq!(action.interval, -1);
        assert!(action.owner.is_none());
    }

    #[test]
    fn should_seed_policy_inputs() {
        let action = Action::policy(ctx(), ActionVerb::PolicyEnable, "cluster-1", "policy-1")
            .expect("policy verb should construct");
        assert_eq!(action.input_str("cluster_id").as_deref(), Some("cluster-1"));
        assert_eq!(action.input_str("policy_id").as_deref(), Some("policy-1"));
    }

    #[test]
    fn should_round_trip_through_map() {
        let mut inputs = Map::new();
        inputs.insert("count".to_string(), Value::from(2));
        let action = Action::new(ctx(), ActionVerb::ClusterScaleDown, "cluster-1")
            .with_name("scale-down")
            .with_inputs(inputs);

        let map = action.to_map().expect("should serialize");
        let back = Action::from_map(map).expect("should deserialize");

        assert_eq!(back.id, action.id);
        assert_eq!(back.target, action.target);
        assert_eq!(back.verb, action.verb);
        assert_eq!(back.inputs, action.inputs);
        assert_eq!(back.outputs, action.outputs);
        assert_eq!(back.status, action.status);
    }

    #[test]
    fn should_reject_map_without_target() {
        let action = Action::new(ctx(), ActionVerb::ClusterCreate, "");
        let map = action.to_map().expect("should serialize");
        let err = Action::from_map(map);
        assert!(matches!(err, Err(EngineError::MissingTarget { .. })));
    }

    #[test]
    fn should_identify_terminal_statuses() {
        assert!(ActionStatus::Succeeded.is_terminal());
        assert!(ActionStatus::Failed.is_terminal());
        assert!(ActionStatus::Cancelled.is_terminal());
        assert!(!ActionStatus::Running.is_terminal());
        assert!(!ActionStatus::Ready.is_terminal());
    }

    #[tokio::test]
    async fn should_read_back_own_status_without_concurrent_writers() {
        use crate::persistence::StoreConfig;

        let store = EngineStore::connect(StoreConfig::in_memory())
            .await
            .expect("in-memory store should connect");
        store.initialize_schema().await.expect("schema should apply");

        let mut action = Action::new(ctx(), ActionVerb::ClusterCreate, "cluster-1");
        action.store(&store).await.expect("store");

        let local = action.status;
        let persisted = action.get_status(&store).await.expect("get status");
        assert_eq!(persisted, local, "read-back matches the in-memory field");
        assert_eq!(action.status, local);

        action
            .set_status(&store, ActionStatus::Ready, "ready for dispatch")
            .await
            .expect("set status");
        let persisted = action.get_status(&store).await.expect("get status");
        assert_eq!(persisted, ActionStatus::Ready);
        assert_eq!(action.status, persisted);
    }
}
