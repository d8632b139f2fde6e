//! Cooperative cancellation and wait-loop pacing.
//!
//! Cancellation is a flag, not an interrupt: `request_cancel` records
//! the wish and the target action is expected to poll `is_cancelled`
//! at its next check point. Timeouts are derived from the action's own
//! `start_time` and budget, so any caller can evaluate them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::action::Action;

/// Shared cancellation registry plus the poll pacing for wait loops.
#[derive(Debug, Clone)]
pub struct Scheduler {
    cancelled: Arc<Mutex<HashSet<String>>>,
    poll_interval: Duration,
}

impl Scheduler {
    /// Create a scheduler with the given wait-loop poll interval.
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            cancelled: Arc::new(Mutex::new(HashSet::new())),
            poll_interval,
        }
    }

    /// Ask an action to stop at its next check point.
    pub fn request_cancel(&self, action_id: &str) {
        debug!(action_id = %action_id, "cancellation requested");
        self.registry().insert(action_id.to_string());
    }

    /// Whether cancellation has been requested for an action.
    #[must_use]
    pub fn is_cancelled(&self, action_id: &str) -> bool {
        self.registry().contains(action_id)
    }

    /// Drop any pending cancellation request for an action. Called once
    /// the action reaches a terminal status.
    pub fn clear(&self, action_id: &str) {
        self.registry().remove(action_id);
    }

    /// Whether an action has exceeded its wall-clock budget. Actions
    /// that never started cannot time out.
    #[must_use]
    pub fn is_timed_out(action: &Action) -> bool {
        match action.start_time {
            Some(start) => {
                let elapsed = Utc::now().signed_duration_since(start);
                elapsed > chrono::Duration::seconds(action.timeout_secs)
            }
            None => false,
        }
    }

    /// Yield before the next wait-loop iteration.
    pub async fn reschedule(&self) {
        if self.poll_interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.cancelled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionVerb;
    use crate::context::RequestContext;

    fn sample_action() -> Action {
        Action::new(
            RequestContext::new("user-1", "project-1"),
            ActionVerb::ClusterCreate,
            "cluster-1",
        )
    }

    #[test]
    fn should_track_cancellation_requests() {
        let scheduler = Scheduler::new(Duration::from_millis(1));

        assert!(!scheduler.is_cancelled("action-1"));
        scheduler.request_cancel("action-1");
        assert!(scheduler.is_cancelled("action-1"));
        assert!(!scheduler.is_cancelled("action-2"));

        scheduler.clear("action-1");
        assert!(!scheduler.is_cancelled("action-1"));
    }

    #[test]
    fn should_share_registry_between_clones() {
        let scheduler = Scheduler::new(Duration::from_millis(1));
        let clone = scheduler.clone();

        clone.request_cancel("action-1");
        assert!(scheduler.is_cancelled("action-1"));
    }

    #[test]
    fn should_not_time_out_before_start() {
        let action = sample_action();
        assert!(action.start_time.is_none());
        assert!(!Scheduler::is_timed_out(&action));
    }

    #[test]
    fn should_time_out_after_budget() {
        let mut action = sample_action().with_timeout(1);
        action.start_time = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(Scheduler::is_timed_out(&action));
    }

    #[test]
    fn should_stay_within_budget() {
        let mut action = sample_action().with_timeout(3600);
        action.start_time = Some(Utc::now());
        assert!(!Scheduler::is_timed_out(&action));
    }

    #[tokio::test]
    async fn should_yield_on_zero_interval() {
        let scheduler = Scheduler::new(Duration::ZERO);
        scheduler.reschedule().await;
    }
}
