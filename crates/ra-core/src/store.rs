//! Persistence contract for agent contexts and the per-iteration ledger.
//!
//! The orchestrator only talks to storage through [`AgentStore`]. Two
//! adapters ship with the crate: [`crate::sqlite_store::SqliteAgentStore`]
//! for durable use and [`crate::memory_store::MemoryAgentStore`] for tests
//! and embedding.

use uuid::Uuid;

use crate::types::{AgentContext, AgentState, AutonomousIteration, FunctionCallResult};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A child was saved before its parent existed.
    #[error("parent agent not found: {0}")]
    ParentNotFound(Uuid),

    /// Iteration numbers start at 1.
    #[error("invalid iteration number {0}: must be a positive integer")]
    InvalidIteration(u32),

    #[error("agent not found: {0}")]
    NotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// StateChange
// ---------------------------------------------------------------------------

/// A narrow state write that only lands while the stored record still has
/// the expected execution id and state.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub expected_execution_id: Uuid,
    pub expected_state: AgentState,
    pub state: AgentState,
    /// Appended to `function_call_history`.
    pub history_entry: Option<FunctionCallResult>,
    pub error: Option<String>,
    /// Drop `invoking` and `awaiting_review`.
    pub drop_pending_calls: bool,
}

impl StateChange {
    pub fn new(expected_execution_id: Uuid, expected_state: AgentState, state: AgentState) -> Self {
        Self {
            expected_execution_id,
            expected_state,
            state,
            history_entry: None,
            error: None,
            drop_pending_calls: false,
        }
    }

    pub fn with_history_entry(mut self, entry: FunctionCallResult) -> Self {
        self.history_entry = Some(entry);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn dropping_pending_calls(mut self) -> Self {
        self.drop_pending_calls = true;
        self
    }

    /// Apply to `ctx` if it still matches. Returns whether anything changed.
    pub fn apply(self, ctx: &mut AgentContext) -> bool {
        if ctx.execution_id != self.expected_execution_id || ctx.state != self.expected_state {
            return false;
        }
        if let Some(entry) = self.history_entry {
            ctx.function_call_history.push(entry);
        }
        if let Some(message) = self.error {
            ctx.error = Some(message);
        }
        if self.drop_pending_calls {
            ctx.invoking.clear();
            ctx.awaiting_review = None;
        }
        ctx.state = self.state;
        ctx.touch();
        true
    }
}

// ---------------------------------------------------------------------------
// AgentStore
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait AgentStore: Send + Sync {
    /// Full upsert of `ctx`.
    ///
    /// When `parent_agent_id` is set the parent must already exist, and the
    /// parent's `child_agent_ids` gains this agent's id in the same
    /// transaction. `child_agent_ids` is append-only: ids already linked in
    /// storage are never dropped by a save carrying a shorter list.
    async fn save(&self, ctx: &AgentContext) -> Result<()>;

    /// Narrow write of `state` and `last_update`. `ctx` is updated to match.
    async fn update_state(&self, ctx: &mut AgentContext, state: AgentState) -> Result<()>;

    /// Conditional write of a loop cycle. Inside one transaction: if the
    /// stored record still has `expected_execution_id` and `expected_state`,
    /// write `iteration` (when given) and `ctx`, keeping the stored
    /// `hil_requested`, `functions` and child links since other writers own
    /// those. Returns the record as written, or `None` when the stored
    /// record has moved on (or is gone) and nothing was written.
    async fn save_if_owned(
        &self,
        ctx: &AgentContext,
        iteration: Option<&AutonomousIteration>,
        expected_execution_id: Uuid,
        expected_state: AgentState,
    ) -> Result<Option<AgentContext>>;

    /// Apply `change` to the stored record inside one transaction. Returns
    /// the updated record, or `None` if the expectation did not hold.
    /// [`StoreError::NotFound`] if there is no such agent.
    async fn change_state(
        &self,
        agent_id: Uuid,
        change: StateChange,
    ) -> Result<Option<AgentContext>>;

    async fn load(&self, agent_id: Uuid) -> Result<Option<AgentContext>>;

    /// All agents owned by `user_id`, most recently updated first.
    async fn list(&self, user_id: &str) -> Result<Vec<AgentContext>>;

    /// Like [`AgentStore::list`] but without agents in a terminal state.
    async fn list_running(&self, user_id: &str) -> Result<Vec<AgentContext>>;

    /// Delete root agents owned by `user_id`, cascading to their descendants
    /// and every iteration record of the deleted agents. Child ids, unknown
    /// ids and ids owned by someone else are skipped. Returns every id that
    /// was removed.
    async fn delete(&self, user_id: &str, ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Narrow write of the enabled function set.
    async fn update_functions(&self, agent_id: Uuid, names: &[String]) -> Result<()>;

    /// Narrow write of the explicit human-pause flag.
    async fn update_hil_requested(&self, agent_id: Uuid, requested: bool) -> Result<()>;

    /// Upsert keyed by `(agent_id, iteration)`.
    async fn save_iteration(&self, record: &AutonomousIteration) -> Result<()>;

    /// Iteration records ordered by iteration number ascending.
    async fn load_iterations(&self, agent_id: Uuid) -> Result<Vec<AutonomousIteration>>;

    /// Drop every iteration record of `agent_id`.
    async fn clear_iterations(&self, agent_id: Uuid) -> Result<()>;
}

/// Reject iteration numbers below 1.
pub(crate) fn check_iteration(record: &AutonomousIteration) -> Result<()> {
    if record.iteration == 0 {
        return Err(StoreError::InvalidIteration(record.iteration));
    }
    Ok(())
}

/// `ctx` with the fields other writers own taken from `stored`.
pub(crate) fn merge_owned_fields(ctx: &AgentContext, stored: &AgentContext) -> AgentContext {
    let mut record = ctx.clone();
    record.hil_requested = stored.hil_requested;
    record.functions = stored.functions.clone();
    for child in &stored.child_agent_ids {
        record.add_child(*child);
    }
    record
}

/// Whether `stored` still belongs to the given execution and state.
pub(crate) fn still_matches(
    stored: &AgentContext,
    expected_execution_id: Uuid,
    expected_state: AgentState,
) -> bool {
    stored.execution_id == expected_execution_id && stored.state == expected_state
}

/// Sort most recently updated first.
pub(crate) fn sort_recent_first(agents: &mut [AgentContext]) {
    agents.sort_by(|a, b| b.last_update.cmp(&a.last_update));
}
