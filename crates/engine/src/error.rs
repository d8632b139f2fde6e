//! Engine error taxonomy.

use crate::persistence::PersistenceError;
use thiserror::Error;

/// Errors surfaced by action construction, validation and orchestration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The verb does not belong to the category it was constructed for.
    #[error("action '{verb}' is not supported for {category} targets")]
    UnsupportedAction { verb: String, category: String },

    /// The action has no target to operate on.
    #[error("action '{verb}' requires a target")]
    MissingTarget { verb: String },

    /// A policy-scoped action is missing its policy reference.
    #[error("action '{verb}' requires a policy reference")]
    MissingPolicy { verb: String },

    /// Attach/detach inputs do not name a policy.
    #[error("no policy specified in the action inputs")]
    PolicyNotSpecified,

    /// A node join is missing the cluster to join.
    #[error("no cluster specified in the action inputs")]
    ClusterNotSpecified,

    /// A policy of the same type is already attached to the cluster.
    #[error("a policy of type '{type_name}' is already attached to the cluster")]
    PolicyTypeConflict { type_name: String },

    /// A referenced resource does not exist.
    #[error("{kind} '{id}' could not be found")]
    ResourceNotFound { kind: String, id: String },

    /// The cluster lock is held by another action when exclusivity was
    /// assumed. Not retryable.
    #[error("cluster '{cluster_id}' is already locked by action '{holder}'")]
    LockIntegrity { cluster_id: String, holder: String },

    /// Store failure.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Wiring failure inside the engine itself.
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    #[must_use]
    pub fn unsupported_action(verb: impl Into<String>, category: impl Into<String>) -> Self {
        Self::UnsupportedAction {
            verb: verb.into(),
            category: category.into(),
        }
    }

    #[must_use]
    pub fn missing_target(verb: impl Into<String>) -> Self {
        Self::MissingTarget { verb: verb.into() }
    }

    #[must_use]
    pub fn missing_policy(verb: impl Into<String>) -> Self {
        Self::MissingPolicy { verb: verb.into() }
    }

    #[must_use]
    pub fn policy_type_conflict(type_name: impl Into<String>) -> Self {
        Self::PolicyTypeConflict {
            type_name: type_name.into(),
        }
    }

    #[must_use]
    pub fn resource_not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn lock_integrity(cluster_id: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::LockIntegrity {
            cluster_id: cluster_id.into(),
            holder: holder.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether retrying the same call could succeed. Validation and
    /// lock-integrity failures are final; store failures delegate to
    /// the persistence layer's own classification.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_format_unsupported_action() {
        let err = EngineError::unsupported_action("NODE_CREATE", "cluster");
        assert_eq!(
            err.to_string(),
            "action 'NODE_CREATE' is not supported for cluster targets"
        );
    }

    #[test]
    fn should_not_retry_lock_integrity() {
        let err = EngineError::lock_integrity("cluster-1", "action-2");
        assert!(!err.is_retryable());
    }

    #[test]
    fn should_delegate_retryability_to_persistence() {
        let err = EngineError::from(PersistenceError::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn should_match_resource_not_found() {
        let err = EngineError::resource_not_found("policy", "policy-9");
        assert!(matches!(
            err,
            EngineError::ResourceNotFound { ref kind, .. } if kind == "policy"
        ));
    }
}
