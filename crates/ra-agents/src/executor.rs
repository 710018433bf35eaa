use std::sync::Arc;

use ra_core::store::{AgentStore, StateChange, StoreError};
use ra_core::types::{AgentContext, AgentState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failures inside an executor. The orchestrator catches any that escape
/// `run`, writes them into the agent's `error` field and moves it to `error`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("executor error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

// ---------------------------------------------------------------------------
// ExecutionOutcome
// ---------------------------------------------------------------------------

/// How a `run` call ended, as seen by the task that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The loop stopped and persisted this state.
    Settled(AgentState),
    /// The persisted record moved on (new execution id, or no longer in
    /// `agent`); the loop stopped without writing.
    Superseded,
    /// The work continues in a task this one does not wait for.
    Detached,
    /// `run` returned an error, recorded into the context by the orchestrator.
    Failed,
}

// ---------------------------------------------------------------------------
// IterationExecutor
// ---------------------------------------------------------------------------

/// Runs an agent's iteration loop for one subtype.
///
/// `run` receives the context exactly as it was just persisted, in state
/// `agent`. It must re-check ownership against the store before every write
/// and stop once the record shows a different execution or state.
#[async_trait::async_trait]
pub trait IterationExecutor: Send + Sync {
    fn subtype(&self) -> &str;

    async fn run(&self, ctx: AgentContext) -> Result<ExecutionOutcome>;
}

// ---------------------------------------------------------------------------
// DetachedExecutor
// ---------------------------------------------------------------------------

/// Fire-and-forget wrapper: starts the inner executor on its own task and
/// returns [`ExecutionOutcome::Detached`] immediately. The registry entry is
/// released as soon as `run` returns, so only the persisted state says when
/// the agent is done. An inner failure is recorded into that state.
pub struct DetachedExecutor {
    subtype: String,
    inner: Arc<dyn IterationExecutor>,
    store: Arc<dyn AgentStore>,
}

impl DetachedExecutor {
    pub fn new(
        subtype: impl Into<String>,
        inner: Arc<dyn IterationExecutor>,
        store: Arc<dyn AgentStore>,
    ) -> Self {
        Self {
            subtype: subtype.into(),
            inner,
            store,
        }
    }
}

#[async_trait::async_trait]
impl IterationExecutor for DetachedExecutor {
    fn subtype(&self) -> &str {
        &self.subtype
    }

    async fn run(&self, ctx: AgentContext) -> Result<ExecutionOutcome> {
        let inner = Arc::clone(&self.inner);
        let store = Arc::clone(&self.store);
        let agent_id = ctx.agent_id;
        let execution_id = ctx.execution_id;
        tokio::spawn(async move {
            match inner.run(ctx).await {
                Ok(outcome) => tracing::debug!(%agent_id, ?outcome, "detached execution settled"),
                Err(e) => {
                    tracing::warn!(%agent_id, error = %e, "detached execution failed");
                    record_failure(store.as_ref(), agent_id, execution_id, &e.to_string()).await;
                }
            }
        });
        Ok(ExecutionOutcome::Detached)
    }
}

/// Move an agent whose executor gave up into `error`, unless the record has
/// left `agent` or another execution has taken over in the meantime.
pub(crate) async fn record_failure(
    store: &dyn AgentStore,
    agent_id: Uuid,
    execution_id: Uuid,
    message: &str,
) {
    let change =
        StateChange::new(execution_id, AgentState::Agent, AgentState::Error).with_error(message);
    match store.change_state(agent_id, change).await {
        Ok(Some(_)) => tracing::info!(%agent_id, "executor failure recorded"),
        Ok(None) | Err(StoreError::NotFound(_)) => {
            tracing::debug!(%agent_id, "agent moved on; failure not recorded")
        }
        Err(e) => tracing::error!(%agent_id, error = %e, "could not record executor failure"),
    }
}
