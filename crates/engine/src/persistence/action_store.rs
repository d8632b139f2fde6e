//! Action persistence operations.
//!
//! Besides plain CRUD this module carries the three store-level
//! primitives the concurrency model leans on:
//!
//! - `acquire_action`: atomic owner claim (`WHERE owner IS NONE AND
//!   status = 'READY'`), so at most one worker ever runs an action;
//! - `mark_action_*`: terminal transitions that record `end_time` and
//!   clear the owner in the same statement;
//! - `resolve_dependents`: removes a finished child from each parent's
//!   `depends_on` array and promotes parents whose array drained.

use chrono::Utc;

use super::client::EngineStore;
use super::error::{from_surrealdb_error, PersistenceError, PersistenceResult};
use crate::action::{Action, ActionStatus};

const TERMINAL_STATUSES: &str = "['SUCCEEDED', 'FAILED', 'CANCELLED']";

/// Filter for listing actions.
#[derive(Debug, Clone, Default)]
pub struct ActionQuery {
    /// Only actions against this target.
    pub target: Option<String>,
    /// Only actions in this status.
    pub status: Option<ActionStatus>,
    /// Include soft-deleted actions.
    pub show_deleted: bool,
    /// Page size.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: Option<usize>,
}

impl ActionQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: ActionStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn include_deleted(mut self) -> Self {
        self.show_deleted = true;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl EngineStore {
    /// Save an action, replacing any existing record with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn save_action(&self, action: &Action) -> PersistenceResult<Action> {
        let result: Option<Action> = self
            .db()
            .upsert(("action", &action.id))
            .content(action.clone())
            .await
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::query_failed("failed to save action"))
    }

    /// Get a live action by id. Soft-deleted records are invisible.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no live record exists.
    pub async fn get_action(&self, action_id: &str) -> PersistenceResult<Action> {
        let result: Option<Action> = self
            .db()
            .select(("action", action_id))
            .await
            .map_err(from_surrealdb_error)?;

        match result {
            Some(action) if action.deleted_at.is_none() => Ok(action),
            _ => Err(PersistenceError::not_found("action", action_id)),
        }
    }

    /// List actions matching the query, ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_actions(&self, query: &ActionQuery) -> PersistenceResult<Vec<Action>> {
        let mut sql = String::from("SELECT * FROM action");
        let mut clauses: Vec<&str> = Vec::new();
        if !query.show_deleted {
            clauses.push("deleted_at IS NONE");
        }
        if query.target.is_some() {
            clauses.push("target = $target");
        }
        if query.status.is_some() {
            clauses.push("status = $status");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" START {offset}"));
        }

        let actions: Vec<Action> = self
            .db()
            .query(&sql)
            .bind(("target", query.target.clone().unwrap_or_default()))
            .bind((
                "status",
                query.status.map(|s| s.to_string()).unwrap_or_default(),
            ))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(actions)
    }

    /// Find the live, non-terminal action operating on a target, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_active_action_by_target(
        &self,
        target: &str,
    ) -> PersistenceResult<Option<Action>> {
        let sql = format!(
            "SELECT * FROM action \
             WHERE target = $target AND deleted_at IS NONE \
             AND status NOT IN {TERMINAL_STATUSES} \
             ORDER BY created_at LIMIT 1"
        );
        let actions: Vec<Action> = self
            .db()
            .query(sql)
            .bind(("target", target.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(actions.into_iter().next())
    }

    /// Claim an action for a worker. The claim succeeds only when the
    /// action is READY and unowned; the statement is atomic at the
    /// store, so concurrent claimers get at most one winner.
    ///
    /// Returns `None` when the claim was lost (already owned, not
    /// READY, or gone).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn acquire_action(
        &self,
        action_id: &str,
        owner: &str,
    ) -> PersistenceResult<Option<Action>> {
        let now = Utc::now();
        let result: Option<Action> = self
            .db()
            .query(
                "UPDATE action SET \
                     owner = $owner, \
                     status = 'RUNNING', \
                     status_reason = 'claimed by worker', \
                     start_time = start_time ?? $now, \
                     updated_at = $now \
                 WHERE id = type::thing('action', $id) \
                     AND owner IS NONE \
                     AND status = 'READY' \
                     AND deleted_at IS NONE \
                 RETURN AFTER",
            )
            .bind(("id", action_id.to_string()))
            .bind(("owner", owner.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(result)
    }

    /// Release a claimed action back to READY for redispatch, bumping
    /// its retry counter.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the action is gone or already terminal.
    pub async fn requeue_action(
        &self,
        action_id: &str,
        retry_count: u32,
    ) -> PersistenceResult<Action> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE action SET \
                 owner = NONE, \
                 status = 'READY', \
                 status_reason = 'requeued for retry', \
                 retry_count = $retry_count, \
                 updated_at = $now \
             WHERE id = type::thing('action', $id) \
                 AND status NOT IN {TERMINAL_STATUSES} \
             RETURN AFTER"
        );
        let result: Option<Action> = self
            .db()
            .query(sql)
            .bind(("id", action_id.to_string()))
            .bind(("retry_count", retry_count))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("action", action_id))
    }

    /// Record a non-terminal status transition.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the action is gone or already terminal.
    pub async fn update_action_status(
        &self,
        action_id: &str,
        status: ActionStatus,
        reason: &str,
        start_time: Option<chrono::DateTime<Utc>>,
    ) -> PersistenceResult<Action> {
        let now = Utc::now();
        let mut sql = String::from(
            "UPDATE action SET status = $status, status_reason = $reason, updated_at = $now",
        );
        if start_time.is_some() {
            sql.push_str(", start_time = $start_time");
        }
        sql.push_str(&format!(
            " WHERE id = type::thing('action', $id) \
              AND status NOT IN {TERMINAL_STATUSES} \
              RETURN AFTER"
        ));

        let result: Option<Action> = self
            .db()
            .query(&sql)
            .bind(("id", action_id.to_string()))
            .bind(("status", status.to_string()))
            .bind(("reason", reason.to_string()))
            .bind(("now", now))
            .bind(("start_time", start_time))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("action", action_id))
    }

    /// Mark an action SUCCEEDED, recording `end_time` and clearing the
    /// owner.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the action is gone.
    pub async fn mark_action_succeeded(
        &self,
        action_id: &str,
        reason: &str,
    ) -> PersistenceResult<Action> {
        self.mark_action_terminal(action_id, ActionStatus::Succeeded, reason)
            .await
    }

    /// Mark an action FAILED.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the action is gone.
    pub async fn mark_action_failed(
        &self,
        action_id: &str,
        reason: &str,
    ) -> PersistenceResult<Action> {
        self.mark_action_terminal(action_id, ActionStatus::Failed, reason)
            .await
    }

    /// Mark an action CANCELLED.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the action is gone.
    pub async fn mark_action_cancelled(
        &self,
        action_id: &str,
        reason: &str,
    ) -> PersistenceResult<Action> {
        self.mark_action_terminal(action_id, ActionStatus::Cancelled, reason)
            .await
    }

    async fn mark_action_terminal(
        &self,
        action_id: &str,
        status: ActionStatus,
        reason: &str,
    ) -> PersistenceResult<Action> {
        let now = Utc::now();
        let result: Option<Action> = self
            .db()
            .query(
                "UPDATE action SET \
                     status = $status, \
                     status_reason = $reason, \
                     end_time = $now, \
                     updated_at = $now, \
                     owner = NONE \
                 WHERE id = type::thing('action', $id) \
                 RETURN AFTER",
            )
            .bind(("id", action_id.to_string()))
            .bind(("status", status.to_string()))
            .bind(("reason", reason.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("action", action_id))
    }

    /// Soft-delete an action. The record stays for audit but becomes
    /// invisible to loads and claims.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the action is gone.
    pub async fn soft_delete_action(&self, action_id: &str) -> PersistenceResult<Action> {
        let now = Utc::now();
        let result: Option<Action> = self
            .db()
            .query(
                "UPDATE action SET deleted_at = $now, updated_at = $now, owner = NONE \
                 WHERE id = type::thing('action', $id) RETURN AFTER",
            )
            .bind(("id", action_id.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        result.ok_or_else(|| PersistenceError::not_found("action", action_id))
    }

    /// Register a dependency edge: `child_id` must finish before
    /// `parent_id` may run.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if either action is gone.
    pub async fn add_dependency(
        &self,
        child_id: &str,
        parent_id: &str,
    ) -> PersistenceResult<()> {
        let now = Utc::now();
        let parent: Option<Action> = self
            .db()
            .query(
                "UPDATE action SET depends_on += $child, updated_at = $now \
                 WHERE id = type::thing('action', $parent) RETURN AFTER",
            )
            .bind(("child", child_id.to_string()))
            .bind(("parent", parent_id.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;
        parent.ok_or_else(|| PersistenceError::not_found("action", parent_id))?;

        let child: Option<Action> = self
            .db()
            .query(
                "UPDATE action SET depended_by += $parent, updated_at = $now \
                 WHERE id = type::thing('action', $child) RETURN AFTER",
            )
            .bind(("child", child_id.to_string()))
            .bind(("parent", parent_id.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;
        child.ok_or_else(|| PersistenceError::not_found("action", child_id))?;

        Ok(())
    }

    /// Resolve a finished child against every parent waiting on it.
    ///
    /// Each parent's `depends_on` array loses the child in one atomic
    /// statement; the caller that observes an array drain to empty
    /// promotes that parent to READY. Returns the parents promoted by
    /// this call so they can be re-notified to the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub async fn resolve_dependents(&self, child_id: &str) -> PersistenceResult<Vec<Action>> {
        let child = self.get_action(child_id).await?;
        let mut promoted = Vec::new();
        let now = Utc::now();

        for parent_id in &child.depended_by {
            let parent: Option<Action> = self
                .db()
                .query(
                    "UPDATE action SET depends_on -= $child, updated_at = $now \
                     WHERE id = type::thing('action', $parent) RETURN AFTER",
                )
                .bind(("child", child_id.to_string()))
                .bind(("parent", parent_id.clone()))
                .bind(("now", now))
                .await
                .map_err(from_surrealdb_error)?
                .take(0)
                .map_err(from_surrealdb_error)?;

            let Some(parent) = parent else {
                continue;
            };
            if !parent.depends_on.is_empty() || parent.status.is_terminal() {
                continue;
            }

            // The owner stays untouched: a parent blocked in its wait
            // loop still holds its claim, and keeping it prevents a
            // second worker from claiming the promoted record.
            let sql = format!(
                "UPDATE action SET \
                     status = 'READY', \
                     status_reason = 'all dependencies resolved', \
                     updated_at = $now \
                 WHERE id = type::thing('action', $parent) \
                     AND status NOT IN {TERMINAL_STATUSES} \
                 RETURN AFTER"
            );
            let ready: Option<Action> = self
                .db()
                .query(sql)
                .bind(("parent", parent_id.clone()))
                .bind(("now", now))
                .await
                .map_err(from_surrealdb_error)?
                .take(0)
                .map_err(from_surrealdb_error)?;

            if let Some(ready) = ready {
                promoted.push(ready);
            }
        }

        Ok(promoted)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::action::ActionVerb;
    use crate::context::RequestContext;
    use crate::persistence::StoreConfig;

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

    fn sample_action(target: &str) -> Action {
        Action::new(
            RequestContext::new("user-1", "project-1"),
            ActionVerb::ClusterCreate,
            target,
        )
    }

    #[tokio::test]
    async fn should_save_and_get_action() {
        let store = test_store().await;
        let action = sample_action("cluster-1");

        store.save_action(&action).await.expect("save should work");
        let loaded = store.get_action(&action.id).await.expect("get should work");

        assert_eq!(loaded.id, action.id);
        assert_eq!(loaded.target, "cluster-1");
        assert_eq!(loaded.status, ActionStatus::Init);
    }

    #[tokio::test]
    async fn should_claim_ready_action_exactly_once() {
        let store = test_store().await;
        let mut action = sample_action("cluster-1");
        action.status = ActionStatus::Ready;
        store.save_action(&action).await.expect("save");

        let first = store
            .acquire_action(&action.id, "worker-0")
            .await
            .expect("claim query");
        let second = store
            .acquire_action(&action.id, "worker-1")
            .await
            .expect("claim query");

        let claimed = first.expect("first claim should win");
        assert_eq!(claimed.owner.as_deref(), Some("worker-0"));
        assert_eq!(claimed.status, ActionStatus::Running);
        assert!(claimed.start_time.is_some());
        assert!(second.is_none(), "second claim should lose");
    }

    #[tokio::test]
    async fn should_not_claim_init_action() {
        let store = test_store().await;
        let action = sample_action("cluster-1");
        store.save_action(&action).await.expect("save");

        let claim = store
            .acquire_action(&action.id, "worker-0")
            .await
            .expect("claim query");
        assert!(claim.is_none());
    }

    #[tokio::test]
    async fn should_clear_owner_on_terminal_mark() {
        let store = test_store().await;
        let mut action = sample_action("cluster-1");
        action.status = ActionStatus::Ready;
        store.save_action(&action).await.expect("save");
        store
            .acquire_action(&action.id, "worker-0")
            .await
            .expect("claim query")
            .expect("claim should win");

        let done = store
            .mark_action_succeeded(&action.id, "done")
            .await
            .expect("mark");

        assert_eq!(done.status, ActionStatus::Succeeded);
        assert!(done.owner.is_none());
        assert!(done.end_time.is_some());
        assert_eq!(done.status_reason, "done");
    }

    #[tokio::test]
    async fn should_promote_parent_when_last_child_resolves() {
        let store = test_store().await;
        let mut parent = sample_action("cluster-1");
        parent.status = ActionStatus::Running;
        store.save_action(&parent).await.expect("save parent");

        let mut children = Vec::new();
        for _ in 0..2 {
            let mut child = sample_action("node-x");
            child.verb = ActionVerb::NodeCreate;
            child.status = ActionStatus::Ready;
            store.save_action(&child).await.expect("save child");
            store
                .add_dependency(&child.id, &parent.id)
                .await
                .expect("edge");
            children.push(child);
        }

        store
            .mark_action_succeeded(&children[0].id, "done")
            .await
            .expect("mark");
        let promoted = store
            .resolve_dependents(&children[0].id)
            .await
            .expect("resolve");
        assert!(promoted.is_empty(), "one child still pending");

        store
            .mark_action_succeeded(&children[1].id, "done")
            .await
            .expect("mark");
        let promoted = store
            .resolve_dependents(&children[1].id)
            .await
            .expect("resolve");

        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, parent.id);
        assert_eq!(promoted[0].status, ActionStatus::Ready);
        assert!(promoted[0].depends_on.is_empty());
    }

    #[tokio::test]
    async fn should_hide_soft_deleted_action() {
        let store = test_store().await;
        let action = sample_action("cluster-1");
        store.save_action(&action).await.expect("save");

        store
            .soft_delete_action(&action.id)
            .await
            .expect("soft delete");

        let result = store.get_action(&action.id).await;
        assert!(matches!(result, Err(PersistenceError::NotFound { .. })));

        let listed = store
            .list_actions(&ActionQuery::new().target("cluster-1"))
            .await
            .expect("list");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn should_filter_and_page_listing() {
        let store = test_store().await;
        for i in 0..3 {
            let mut action = sample_action("cluster-1");
            action.name = format!("a-{i}");
            if i == 2 {
                action.status = ActionStatus::Ready;
            }
            store.save_action(&action).await.expect("save");
        }
        let other = sample_action("cluster-2");
        store.save_action(&other).await.expect("save");

        let by_target = store
            .list_actions(&ActionQuery::new().target("cluster-1"))
            .await
            .expect("list");
        assert_eq!(by_target.len(), 3);

        let ready = store
            .list_actions(&ActionQuery::new().status(ActionStatus::Ready))
            .await
            .expect("list");
        assert_eq!(ready.len(), 1);

        let paged = store
            .list_actions(&ActionQuery::new().target("cluster-1").limit(2).offset(1))
            .await
            .expect("list");
        assert_eq!(paged.len(), 2);
    }

    #[tokio::test]
    async fn should_requeue_claimed_action() {
        let store = test_store().await;
        let mut action = sample_action("cluster-1");
        action.status = ActionStatus::Ready;
        store.save_action(&action).await.expect("save");
        store
            .acquire_action(&action.id, "worker-0")
            .await
            .expect("claim query")
            .expect("claim");

        let requeued = store
            .requeue_action(&action.id, 1)
            .await
            .expect("requeue");

        assert_eq!(requeued.status, ActionStatus::Ready);
        assert!(requeued.owner.is_none());
        assert_eq!(requeued.retry_count, 1);

        let reclaimed = store
            .acquire_action(&action.id, "worker-1")
            .await
            .expect("claim query");
        assert!(reclaimed.is_some(), "requeued action should be claimable");
    }
}
