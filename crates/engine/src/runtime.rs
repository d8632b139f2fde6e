//! Engine runtime: shared services bundle, configuration and the
//! worker pool bootstrap.

use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorRef};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::action::HandlerRegistry;
use crate::dispatcher::{
    Dispatcher, DispatcherActorDef, DispatcherArguments, DispatcherMessage, WorkerRetryPolicy,
};
use crate::error::{EngineError, EngineResult};
use crate::node::NodeProvider;
use crate::persistence::EngineStore;
use crate::policies::{self, CheckResult, PolicyRegistry, PolicyTarget};
use crate::scheduler::Scheduler;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker actors in the pool. A parent waiting on children occupies
    /// a worker, so fan-out workloads need at least two; the pool
    /// enforces that floor.
    pub workers: usize,
    /// Timeout applied to claimed actions that carry none of their own,
    /// in seconds.
    pub default_action_timeout_secs: i64,
    /// Pause between wait-loop iterations.
    pub poll_interval: Duration,
    /// How many times one policy may ask to be re-examined per check.
    pub policy_check_retry_limit: u32,
    /// Backoff schedule for RETRY outcomes.
    pub retry_policy: WorkerRetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_action_timeout_secs: 3600,
            poll_interval: Duration::from_millis(10),
            policy_check_retry_limit: 3,
            retry_policy: WorkerRetryPolicy::default(),
        }
    }
}

/// Shared services handed to every action execution.
#[derive(Clone)]
pub struct Runtime {
    pub store: EngineStore,
    pub dispatcher: Dispatcher,
    pub scheduler: Scheduler,
    pub policies: Arc<PolicyRegistry>,
    pub provider: Arc<dyn NodeProvider>,
    pub config: Arc<EngineConfig>,
    handlers: Arc<HandlerRegistry>,
}

impl Runtime {
    /// Start the engine: build the runtime and spawn the worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatcher actor cannot be spawned.
    pub async fn start(
        config: EngineConfig,
        store: EngineStore,
        policies: PolicyRegistry,
        provider: Arc<dyn NodeProvider>,
    ) -> EngineResult<(Self, WorkerPool)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let runtime = Self {
            store,
            dispatcher: Dispatcher::new(tx),
            scheduler: Scheduler::new(config.poll_interval),
            policies: Arc::new(policies),
            provider,
            config: Arc::new(config),
            handlers: Arc::new(HandlerRegistry::new()),
        };

        let workers = runtime.config.workers.max(2);
        let (dispatcher_ref, dispatcher_handle) = Actor::spawn(
            None,
            DispatcherActorDef,
            DispatcherArguments {
                runtime: runtime.clone(),
                workers,
            },
        )
        .await
        .map_err(|err| EngineError::internal(format!("failed to spawn dispatcher: {err}")))?;

        let pump_ref = dispatcher_ref.clone();
        let pump = tokio::spawn(async move {
            while let Some(action_id) = rx.recv().await {
                if pump_ref
                    .send_message(DispatcherMessage::NewAction { action_id })
                    .is_err()
                {
                    break;
                }
            }
        });

        info!(workers, "engine started");
        Ok((
            runtime,
            WorkerPool {
                dispatcher_ref,
                dispatcher_handle,
                pump,
            },
        ))
    }

    /// Build a runtime without a worker pool. Notifications become
    /// no-ops; callers drive actions directly. Useful for embedding
    /// and for tests that exercise one action at a time.
    #[must_use]
    pub fn detached(
        config: EngineConfig,
        store: EngineStore,
        policies: PolicyRegistry,
        provider: Arc<dyn NodeProvider>,
    ) -> Self {
        Self {
            store,
            dispatcher: Dispatcher::null(),
            scheduler: Scheduler::new(config.poll_interval),
            policies: Arc::new(policies),
            provider,
            config: Arc::new(config),
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }

    /// The handler registry for verb dispatch.
    #[must_use]
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.handlers.clone()
    }

    /// Run the policy-check pipeline for a cluster and target.
    ///
    /// # Errors
    ///
    /// Returns an error if policy records cannot be read.
    pub async fn policy_check(
        &self,
        cluster_id: &str,
        target: &PolicyTarget,
    ) -> EngineResult<CheckResult> {
        policies::policy_check(
            &self.store,
            &self.policies,
            self.config.policy_check_retry_limit,
            cluster_id,
            target,
        )
        .await
    }
}

/// Handle on the spawned dispatcher and its feed task.
pub struct WorkerPool {
    dispatcher_ref: ActorRef<DispatcherMessage>,
    dispatcher_handle: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl WorkerPool {
    /// Stop all workers and the dispatcher, then wait for them.
    pub async fn shutdown(self) {
        let _ = self.dispatcher_ref.send_message(DispatcherMessage::Shutdown);
        let _ = self.dispatcher_handle.await;
        self.pump.abort();
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::node::NoopProvider;
    use crate::persistence::StoreConfig;

    #[test]
    fn should_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.default_action_timeout_secs, 3600);
        assert_eq!(config.policy_check_retry_limit, 3);
    }

    #[tokio::test]
    async fn should_start_and_shut_down() {
        let store = EngineStore::connect(StoreConfig::in_memory())
            .await
            .expect("connect");
        store.initialize_schema().await.expect("schema");

        let (runtime, pool) = Runtime::start(
            EngineConfig::default(),
            store,
            PolicyRegistry::new(),
            Arc::new(NoopProvider),
        )
        .await
        .expect("engine should start");

        runtime.dispatcher.notify("no-such-action");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn should_tolerate_notify_on_detached_runtime() {
        let store = EngineStore::connect(StoreConfig::in_memory())
            .await
            .expect("connect");
        let runtime = Runtime::detached(
            EngineConfig::default(),
            store,
            PolicyRegistry::new(),
            Arc::new(NoopProvider),
        );

        runtime.dispatcher.notify("action-1");
    }
}
