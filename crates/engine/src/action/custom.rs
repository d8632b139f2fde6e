//! Pass-through handler for out-of-tree verbs.
//!
//! Custom actions exist so embedders can route their own verbs through
//! the same lifecycle (claim, terminal mark, fan-in). The engine itself
//! has no behavior to attach, so both hooks succeed trivially.

use async_trait::async_trait;
use tracing::debug;

use super::{Action, ActionHandler, Outcome};
use crate::error::EngineResult;
use crate::runtime::Runtime;

pub struct CustomActionHandler;

#[async_trait]
impl ActionHandler for CustomActionHandler {
    async fn execute(&self, action: &mut Action, _runtime: &Runtime) -> EngineResult<Outcome> {
        debug!(action_id = %action.id, verb = %action.verb, "running custom action");
        Ok(Outcome::Ok)
    }

    async fn cancel(&self, _action: &mut Action, _runtime: &Runtime) -> EngineResult<Outcome> {
        Ok(Outcome::Ok)
    }
}
