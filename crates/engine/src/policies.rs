//! Policy rules and the policy-check pipeline.
//!
//! Stored policies carry a `type_name`; the registry maps that name to
//! a `PolicyRule` implementation. Checks run in attach order (FIFO). A
//! rule may veto the operation, let it pass, or ask to be re-examined
//! later, in which case it is requeued at the back of the line. Each
//! rule's requeue budget is capped; exhausting it fails the check.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::action::ActionVerb;
use crate::error::EngineResult;
use crate::persistence::EngineStore;

/// When a check runs relative to the guarded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckPhase {
    Before,
    After,
}

/// A (phase, operation) pair a rule subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyTarget {
    pub phase: CheckPhase,
    pub operation: ActionVerb,
}

impl PolicyTarget {
    #[must_use]
    pub fn before(operation: ActionVerb) -> Self {
        Self {
            phase: CheckPhase::Before,
            operation,
        }
    }

    #[must_use]
    pub fn after(operation: ActionVerb) -> Self {
        Self {
            phase: CheckPhase::After,
            operation,
        }
    }
}

/// Verdict of a single rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    /// The operation may proceed.
    Succeed,
    /// The operation is vetoed.
    Fail,
    /// The rule cannot decide yet; re-examine after the others.
    Retry,
}

/// Accumulated result flowing through the pipeline. Rules may refine
/// the removal `count` and nominate `candidates` for membership
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub decision: PolicyDecision,
    /// Number of nodes the guarded operation should remove.
    pub count: usize,
    /// Nodes nominated for removal.
    pub candidates: Vec<String>,
    /// Why the check failed, when it did.
    pub reason: Option<String>,
}

impl CheckResult {
    /// A passing result with no advice.
    #[must_use]
    pub fn succeed() -> Self {
        Self {
            decision: PolicyDecision::Succeed,
            count: 0,
            candidates: Vec::new(),
            reason: None,
        }
    }

    /// A vetoing result.
    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            decision: PolicyDecision::Fail,
            count: 0,
            candidates: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    /// An undecided result asking for re-examination.
    #[must_use]
    pub fn retry() -> Self {
        Self {
            decision: PolicyDecision::Retry,
            count: 0,
            candidates: Vec::new(),
            reason: None,
        }
    }

    /// Set the removal count.
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Set the removal candidates.
    #[must_use]
    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Whether the guarded operation may proceed.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.decision == PolicyDecision::Succeed
    }
}

/// Behavior of one policy type.
#[async_trait]
pub trait PolicyRule: Send + Sync {
    /// Type name this rule implements, matched against stored policies.
    fn type_name(&self) -> &str;

    /// The (phase, operation) pairs this rule wants to examine.
    fn targets(&self) -> Vec<PolicyTarget>;

    /// Examine an operation before it runs. The incoming result is the
    /// pipeline's accumulated verdict; return it refined or replaced.
    async fn pre_check(
        &self,
        _cluster_id: &str,
        _operation: &ActionVerb,
        result: CheckResult,
    ) -> CheckResult {
        result
    }

    /// Examine an operation after it ran.
    async fn post_check(
        &self,
        _cluster_id: &str,
        _operation: &ActionVerb,
        result: CheckResult,
    ) -> CheckResult {
        result
    }
}

/// Maps stored policy type names to rule implementations.
#[derive(Default)]
pub struct PolicyRegistry {
    rules: HashMap<String, Arc<dyn PolicyRule>>,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule under its type name.
    pub fn register(&mut self, rule: Arc<dyn PolicyRule>) {
        self.rules.insert(rule.type_name().to_string(), rule);
    }

    /// Look up the rule for a policy type.
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<Arc<dyn PolicyRule>> {
        self.rules.get(type_name).cloned()
    }
}

/// Run every enabled, matching policy of a cluster against a target.
///
/// Policies attach in FIFO order; a RETRY verdict requeues the policy
/// at the back with its budget decremented. A cluster with no matching
/// policies passes trivially.
///
/// # Errors
///
/// Returns an error if policy records cannot be read.
pub async fn policy_check(
    store: &EngineStore,
    registry: &PolicyRegistry,
    retry_limit: u32,
    cluster_id: &str,
    target: &PolicyTarget,
) -> EngineResult<CheckResult> {
    let bindings = store.get_cluster_policies(cluster_id).await?;

    let mut pending: VecDeque<(String, Arc<dyn PolicyRule>)> = VecDeque::new();
    for binding in bindings {
        if !binding.enabled {
            continue;
        }
        let record = store.get_policy(&binding.policy_id).await?;
        match registry.get(&record.type_name) {
            Some(rule) if rule.targets().contains(target) => {
                pending.push_back((record.id, rule));
            }
            Some(_) => {}
            None => {
                warn!(
                    cluster_id = %cluster_id,
                    policy_id = %record.id,
                    type_name = %record.type_name,
                    "no rule registered for policy type, skipping"
                );
            }
        }
    }

    let mut result = CheckResult::succeed();
    if pending.is_empty() {
        return Ok(result);
    }

    let mut retries: HashMap<String, u32> = HashMap::new();
    while let Some((policy_id, rule)) = pending.pop_front() {
        result = match target.phase {
            CheckPhase::Before => {
                rule.pre_check(cluster_id, &target.operation, result).await
            }
            CheckPhase::After => {
                rule.post_check(cluster_id, &target.operation, result).await
            }
        };

        match result.decision {
            PolicyDecision::Fail => {
                debug!(cluster_id = %cluster_id, policy_id = %policy_id, "policy vetoed operation");
                return Ok(result);
            }
            PolicyDecision::Retry => {
                let attempts = retries.entry(policy_id.clone()).or_insert(0);
                *attempts += 1;
                if *attempts > retry_limit {
                    result.decision = PolicyDecision::Fail;
                    result.reason = Some(format!(
                        "policy '{policy_id}' exceeded its retry limit of {retry_limit}"
                    ));
                    return Ok(result);
                }
                result.decision = PolicyDecision::Succeed;
                pending.push_back((policy_id, rule));
            }
            PolicyDecision::Succeed => {}
        }
    }

    Ok(result)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::persistence::{PolicyRecord, StoreConfig};

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

    /// Rule that records the order it ran in and replays scripted
    /// verdicts.
    struct ScriptedRule {
        type_name: String,
        log: Arc<Mutex<Vec<String>>>,
        script: Mutex<VecDeque<CheckResult>>,
    }

    impl ScriptedRule {
        fn new(
            type_name: &str,
            log: Arc<Mutex<Vec<String>>>,
            script: Vec<CheckResult>,
        ) -> Arc<Self> {
            Arc::new(Self {
                type_name: type_name.to_string(),
                log,
                script: Mutex::new(script.into()),
            })
        }

        fn next_verdict(&self, fallthrough: CheckResult) -> CheckResult {
            self.log
                .lock()
                .expect("log lock")
                .push(self.type_name.clone());
            self.script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or(fallthrough)
        }
    }

    #[async_trait]
    impl PolicyRule for ScriptedRule {
        fn type_name(&self) -> &str {
            &self.type_name
        }

        fn targets(&self) -> Vec<PolicyTarget> {
            vec![
                PolicyTarget::before(ActionVerb::ClusterScaleDown),
                PolicyTarget::after(ActionVerb::ClusterScaleDown),
            ]
        }

        async fn pre_check(
            &self,
            _cluster_id: &str,
            _operation: &ActionVerb,
            result: CheckResult,
        ) -> CheckResult {
            self.next_verdict(result)
        }
    }

    async fn attach(store: &EngineStore, type_name: &str, enabled: bool) -> String {
        let record = PolicyRecord::new(type_name, type_name, 0, 1);
        store.save_policy(&record).await.expect("save policy");
        store
            .attach_policy("cluster-1", &record.id, 0, 1, enabled)
            .await
            .expect("attach");
        record.id
    }

    #[tokio::test]
    async fn should_pass_with_no_policies() {
        let store = test_store().await;
        let registry = PolicyRegistry::new();

        let result = policy_check(
            &store,
            &registry,
            3,
            "cluster-1",
            &PolicyTarget::before(ActionVerb::ClusterScaleDown),
        )
        .await
        .expect("check");

        assert!(result.is_ok());
        assert_eq!(result.count, 0);
        assert!(result.candidates.is_empty());
    }

    #[tokio::test]
    async fn should_run_policies_in_attach_order() {
        let store = test_store().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PolicyRegistry::new();
        registry.register(ScriptedRule::new("type.a", log.clone(), vec![]));
        registry.register(ScriptedRule::new("type.b", log.clone(), vec![]));
        attach(&store, "type.a", true).await;
        attach(&store, "type.b", true).await;

        let result = policy_check(
            &store,
            &registry,
            3,
            "cluster-1",
            &PolicyTarget::before(ActionVerb::ClusterScaleDown),
        )
        .await
        .expect("check");

        assert!(result.is_ok());
        let log = log.lock().expect("log lock");
        assert_eq!(*log, vec!["type.a".to_string(), "type.b".to_string()]);
    }

    #[tokio::test]
    async fn should_requeue_retry_behind_remaining_policies() {
        let store = test_store().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PolicyRegistry::new();
        registry.register(ScriptedRule::new(
            "type.a",
            log.clone(),
            vec![CheckResult::retry()],
        ));
        registry.register(ScriptedRule::new("type.b", log.clone(), vec![]));
        attach(&store, "type.a", true).await;
        attach(&store, "type.b", true).await;

        let result = policy_check(
            &store,
            &registry,
            3,
            "cluster-1",
            &PolicyTarget::before(ActionVerb::ClusterScaleDown),
        )
        .await
        .expect("check");

        assert!(result.is_ok());
        let log = log.lock().expect("log lock");
        assert_eq!(
            *log,
            vec![
                "type.a".to_string(),
                "type.b".to_string(),
                "type.a".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn should_fail_when_retry_budget_exhausted() {
        let store = test_store().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PolicyRegistry::new();
        registry.register(ScriptedRule::new(
            "type.a",
            log.clone(),
            vec![
                CheckResult::retry(),
                CheckResult::retry(),
                CheckResult::retry(),
            ],
        ));
        attach(&store, "type.a", true).await;

        let result = policy_check(
            &store,
            &registry,
            2,
            "cluster-1",
            &PolicyTarget::before(ActionVerb::ClusterScaleDown),
        )
        .await
        .expect("check");

        assert!(!result.is_ok());
        assert!(result
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("retry limit")));
        assert_eq!(log.lock().expect("log lock").len(), 3);
    }

    #[tokio::test]
    async fn should_stop_pipeline_on_veto() {
        let store = test_store().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PolicyRegistry::new();
        registry.register(ScriptedRule::new(
            "type.a",
            log.clone(),
            vec![CheckResult::fail("quota exceeded")],
        ));
        registry.register(ScriptedRule::new("type.b", log.clone(), vec![]));
        attach(&store, "type.a", true).await;
        attach(&store, "type.b", true).await;

        let result = policy_check(
            &store,
            &registry,
            3,
            "cluster-1",
            &PolicyTarget::before(ActionVerb::ClusterScaleDown),
        )
        .await
        .expect("check");

        assert!(!result.is_ok());
        assert_eq!(result.reason.as_deref(), Some("quota exceeded"));
        assert_eq!(log.lock().expect("log lock").len(), 1, "type.b never ran");
    }

    #[tokio::test]
    async fn should_skip_disabled_bindings() {
        let store = test_store().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PolicyRegistry::new();
        registry.register(ScriptedRule::new(
            "type.a",
            log.clone(),
            vec![CheckResult::fail("should not run")],
        ));
        attach(&store, "type.a", false).await;

        let result = policy_check(
            &store,
            &registry,
            3,
            "cluster-1",
            &PolicyTarget::before(ActionVerb::ClusterScaleDown),
        )
        .await
        .expect("check");

        assert!(result.is_ok());
        assert!(log.lock().expect("log lock").is_empty());
    }
}
