//! Worker pool: dispatcher actor, worker actors and the execution
//! driver.
//!
//! The dispatcher owns an idle list and a backlog; it hands an action
//! to at most one idle worker and queues the rest. Workers claim the
//! action at the store before touching it, so a stale or duplicate
//! notification dies at the claim. A worker executes one action at a
//! time; parents blocked in their wait loop therefore occupy a worker,
//! which is why the pool keeps a floor of two.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::action::Outcome;
use crate::error::EngineResult;
use crate::runtime::Runtime;

/// Backoff schedule for RETRY outcomes.
#[derive(Debug, Clone)]
pub struct WorkerRetryPolicy {
    /// Redispatch attempts before the action fails for good.
    pub max_retries: u32,
    /// First backoff delay in milliseconds; doubles per attempt.
    pub base_backoff_ms: u64,
    /// Ceiling for the backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for WorkerRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 3200,
        }
    }
}

impl WorkerRetryPolicy {
    /// Delay before the given attempt (1-based), or `None` when the
    /// budget is spent.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_backoff_ms);
        Some(Duration::from_millis(ms))
    }
}

/// Fire-and-forget notification handle into the dispatcher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<String>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Handle whose notifications go nowhere, for pool-less runtimes.
    #[must_use]
    pub fn null() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Tell the pool an action may be ready. Lossy by design: a claim
    /// at the store decides who actually runs it.
    pub fn notify(&self, action_id: &str) {
        if self.tx.send(action_id.to_string()).is_err() {
            debug!(action_id = %action_id, "dispatcher is gone, dropping notification");
        }
    }
}

/// Messages handled by the dispatcher actor.
pub enum DispatcherMessage {
    /// An action may be READY.
    NewAction { action_id: String },
    /// A worker finished its current action.
    WorkerDone { worker_id: String },
    /// Stop the pool.
    Shutdown,
}

/// Arguments for spawning the dispatcher.
pub struct DispatcherArguments {
    pub runtime: Runtime,
    pub workers: usize,
}

/// Dispatcher bookkeeping, kept separate from the actor shell so the
/// assignment logic is testable without spawning anything.
pub struct DispatcherState {
    workers: HashMap<String, ActorRef<WorkerMessage>>,
    idle: VecDeque<String>,
    backlog: VecDeque<String>,
}

impl DispatcherState {
    fn new(workers: HashMap<String, ActorRef<WorkerMessage>>) -> Self {
        let idle = workers.keys().cloned().collect();
        Self {
            workers,
            idle,
            backlog: VecDeque::new(),
        }
    }

    /// Take an idle worker for the action, or queue the action.
    fn assign(&mut self, action_id: String) -> Option<(String, String)> {
        match self.idle.pop_front() {
            Some(worker_id) => Some((worker_id, action_id)),
            None => {
                self.backlog.push_back(action_id);
                None
            }
        }
    }

    /// Give a now-idle worker the oldest queued action, or park it.
    fn next_for(&mut self, worker_id: String) -> Option<(String, String)> {
        match self.backlog.pop_front() {
            Some(action_id) => Some((worker_id, action_id)),
            None => {
                self.idle.push_back(worker_id);
                None
            }
        }
    }

    fn drop_worker(&mut self, worker_id: &str, action_id: String) {
        warn!(worker_id = %worker_id, "worker unreachable, requeueing action");
        self.workers.remove(worker_id);
        self.idle.retain(|w| w != worker_id);
        self.backlog.push_front(action_id);
    }

    fn deliver(&mut self, worker_id: String, action_id: String) {
        match self.workers.get(&worker_id) {
            Some(worker) => {
                let message = WorkerMessage::Execute {
                    action_id: action_id.clone(),
                };
                if worker.send_message(message).is_err() {
                    self.drop_worker(&worker_id, action_id);
                }
            }
            None => self.backlog.push_front(action_id),
        }
    }
}

/// The dispatcher actor definition.
pub struct DispatcherActorDef;

impl Actor for DispatcherActorDef {
    type Msg = DispatcherMessage;
    type State = DispatcherState;
    type Arguments = DispatcherArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mut workers = HashMap::new();
        for index in 0..args.workers {
            let worker_id = format!("worker-{index}");
            let (worker_ref, _handle) = Actor::spawn(
                None,
                WorkerActorDef,
                WorkerArguments {
                    worker_id: worker_id.clone(),
                    runtime: args.runtime.clone(),
                    dispatcher: myself.clone(),
                },
            )
            .await?;
            workers.insert(worker_id, worker_ref);
        }
        info!(workers = args.workers, "worker pool online");
        Ok(DispatcherState::new(workers))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::NewAction { action_id } => {
                if let Some((worker_id, action_id)) = state.assign(action_id) {
                    state.deliver(worker_id, action_id);
                }
            }
            DispatcherMessage::WorkerDone { worker_id } => {
                if let Some((worker_id, action_id)) = state.next_for(worker_id) {
                    state.deliver(worker_id, action_id);
                }
            }
            DispatcherMessage::Shutdown => {
                for worker in state.workers.values() {
                    worker.stop(None);
                }
                myself.stop(None);
            }
        }
        Ok(())
    }
}

/// Messages handled by a worker actor.
pub enum WorkerMessage {
    /// Claim and run an action.
    Execute { action_id: String },
}

/// Arguments for spawning a worker.
pub struct WorkerArguments {
    pub worker_id: String,
    pub runtime: Runtime,
    pub dispatcher: ActorRef<DispatcherMessage>,
}

/// The worker actor definition.
pub struct WorkerActorDef;

impl Actor for WorkerActorDef {
    type Msg = WorkerMessage;
    type State = WorkerArguments;
    type Arguments = WorkerArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(args)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Execute { action_id } => {
                if let Err(err) =
                    execute_action(&state.runtime, &state.worker_id, &action_id).await
                {
                    warn!(
                        worker_id = %state.worker_id,
                        action_id = %action_id,
                        error = %err,
                        "action execution errored"
                    );
                    let _ = state
                        .runtime
                        .store
                        .mark_action_failed(&action_id, &err.to_string())
                        .await;
                }
                let _ = state.dispatcher.send_message(DispatcherMessage::WorkerDone {
                    worker_id: state.worker_id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Claim an action, run it, and record the outcome.
///
/// Losing the claim is a normal exit: someone else owns the action.
/// Terminal outcomes mark the action, resolve its dependents and
/// re-notify any parent that became READY.
///
/// # Errors
///
/// Returns an error if a store call fails.
pub async fn execute_action(
    runtime: &Runtime,
    worker_id: &str,
    action_id: &str,
) -> EngineResult<()> {
    let Some(mut action) = runtime.store.acquire_action(action_id, worker_id).await? else {
        debug!(worker_id = %worker_id, action_id = %action_id, "claim lost, skipping");
        return Ok(());
    };
    if action.timeout_secs <= 0 {
        action.timeout_secs = runtime.config.default_action_timeout_secs;
    }

    info!(
        worker_id = %worker_id,
        action_id = %action.id,
        verb = %action.verb,
        target = %action.target,
        "executing action"
    );

    let mut reason_override = None;
    let outcome = match action.execute(runtime).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(action_id = %action.id, error = %err, "action handler failed");
            reason_override = Some(err.to_string());
            Outcome::Error
        }
    };

    if outcome == Outcome::Retry {
        let attempt = action.retry_count + 1;
        if let Some(delay) = runtime.config.retry_policy.backoff_delay(attempt) {
            runtime.store.requeue_action(&action.id, attempt).await?;
            debug!(
                action_id = %action.id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "redispatching after backoff"
            );
            let dispatcher = runtime.dispatcher.clone();
            let id = action.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                dispatcher.notify(&id);
            });
            return Ok(());
        }
        reason_override = Some(format!(
            "gave up after {} retry attempts",
            runtime.config.retry_policy.max_retries
        ));
    }

    match outcome {
        Outcome::Ok => {
            runtime
                .store
                .mark_action_succeeded(&action.id, "action completed")
                .await?;
        }
        Outcome::Cancel => {
            runtime
                .store
                .mark_action_cancelled(&action.id, "action cancelled")
                .await?;
        }
        Outcome::Error | Outcome::Timeout | Outcome::Retry => {
            let reason = reason_override.unwrap_or_else(|| {
                if outcome == Outcome::Timeout {
                    "action timed out".to_string()
                } else {
                    "action failed".to_string()
                }
            });
            runtime
                .store
                .mark_action_failed(&action.id, &reason)
                .await?;
        }
    }

    runtime.scheduler.clear(&action.id);
    let promoted = runtime.store.resolve_dependents(&action.id).await?;
    for parent in &promoted {
        runtime.dispatcher.notify(&parent.id);
    }

    info!(action_id = %action.id, outcome = ?outcome, "action finished");
    Ok(())
}
