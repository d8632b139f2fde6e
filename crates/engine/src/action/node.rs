//! Handler for node verbs.
//!
//! Node operations delegate to the node entity, which reports plain
//! success or failure from the provider; that bool maps onto OK/ERROR.

use async_trait::async_trait;
use tracing::warn;

use super::{Action, ActionHandler, ActionVerb, Outcome};
use crate::error::{EngineError, EngineResult};
use crate::node::Node;
use crate::persistence::PersistenceError;
use crate::runtime::Runtime;

pub struct NodeActionHandler;

#[async_trait]
impl ActionHandler for NodeActionHandler {
    async fn execute(&self, action: &mut Action, runtime: &Runtime) -> EngineResult<Outcome> {
        let mut node = match Node::load(&runtime.store, &action.target).await {
            Ok(node) => node,
            Err(EngineError::Persistence(PersistenceError::NotFound { .. })) => {
                warn!(node_id = %action.target, "node is gone, nothing to do");
                return Ok(Outcome::Error);
            }
            Err(err) => return Err(err),
        };

        let store = &runtime.store;
        let provider = runtime.provider.as_ref();
        let succeeded = match &action.verb {
            ActionVerb::NodeCreate => node.do_create(store, provider).await?,
            ActionVerb::NodeDelete => node.do_delete(store, provider).await?,
            ActionVerb::NodeUpdate => match action.input_str("new_profile_id") {
                Some(profile_id) => node.do_update(store, provider, &profile_id).await?,
                None => {
                    warn!(node_id = %node.record.id, "node update without a new profile");
                    false
                }
            },
            ActionVerb::NodeJoinCluster => {
                let Some(cluster_id) = action.input_str("cluster_id") else {
                    return Err(EngineError::ClusterNotSpecified);
                };
                node.do_join(store, &cluster_id).await?
            }
            ActionVerb::NodeLeaveCluster => node.do_leave(store).await?,
            other => {
                return Err(EngineError::unsupported_action(other.to_string(), "node"));
            }
        };

        Ok(if succeeded { Outcome::Ok } else { Outcome::Error })
    }

    async fn cancel(&self, _action: &mut Action, _runtime: &Runtime) -> EngineResult<Outcome> {
        // Node operations are single provider calls with no safe
        // midpoint to stop at; the wish is simply acknowledged.
        Ok(Outcome::Ok)
    }
}
