//! Handler for policy-binding verbs.
//!
//! These are short, fully synchronous state flips on the cluster-policy
//! binding, bracketed by durable RUNNING/SUCCEEDED transitions so the
//! timeline of the flip survives in the action record.

use async_trait::async_trait;
use tracing::debug;

use super::{Action, ActionHandler, ActionStatus, ActionVerb, Outcome};
use crate::error::{EngineError, EngineResult};
use crate::runtime::Runtime;

pub struct PolicyActionHandler;

#[async_trait]
impl ActionHandler for PolicyActionHandler {
    async fn execute(&self, action: &mut Action, runtime: &Runtime) -> EngineResult<Outcome> {
        let Some(cluster_id) = action.input_str("cluster_id") else {
            return Err(EngineError::missing_target(action.verb.to_string()));
        };
        let Some(policy_id) = action.input_str("policy_id") else {
            return Err(EngineError::missing_policy(action.verb.to_string()));
        };

        action
            .set_status(&runtime.store, ActionStatus::Running, "policy operation started")
            .await?;

        match &action.verb {
            ActionVerb::PolicyEnable => {
                runtime
                    .store
                    .set_policy_enabled(&cluster_id, &policy_id, true)
                    .await?;
            }
            ActionVerb::PolicyDisable => {
                runtime
                    .store
                    .set_policy_enabled(&cluster_id, &policy_id, false)
                    .await?;
            }
            ActionVerb::PolicyUpdate => {
                // In-place update is unsafe while a policy may be shared
                // across clusters; a real update is clone-and-swap via
                // detach/attach. Kept as an explicit no-op.
                debug!(
                    cluster_id = %cluster_id,
                    policy_id = %policy_id,
                    "policy update is a placeholder"
                );
            }
            other => {
                return Err(EngineError::unsupported_action(
                    other.to_string(),
                    "policy",
                ));
            }
        }

        action
            .set_status(
                &runtime.store,
                ActionStatus::Succeeded,
                "policy operation completed",
            )
            .await?;
        Ok(Outcome::Ok)
    }

    async fn cancel(&self, action: &mut Action, runtime: &Runtime) -> EngineResult<Outcome> {
        if !action.status.is_terminal() {
            action
                .set_status(
                    &runtime.store,
                    ActionStatus::Cancelled,
                    "policy operation cancelled",
                )
                .await?;
        }
        Ok(Outcome::Ok)
    }
}
