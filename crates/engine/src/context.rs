//! Request context carried by every action.
//!
//! The context is persisted together with the action record so that any
//! worker in the pool can pick the action up and execute it on behalf of
//! the original caller.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the caller that created an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// User that initiated the request.
    pub user_id: String,
    /// Project the request was made in.
    pub project_id: String,
    /// Optional domain scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    /// Correlation id for tracing a request across workers.
    pub request_id: String,
}

impl RequestContext {
    /// Create a context for the given user and project.
    #[must_use]
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            domain_id: None,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Set the domain scope.
    #[must_use]
    pub fn with_domain(mut self, domain_id: impl Into<String>) -> Self {
        self.domain_id = Some(domain_id.into());
        self
    }
}
