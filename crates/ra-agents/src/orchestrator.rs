use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ra_core::config::AgentsConfig;
use ra_core::store::{AgentStore, StateChange, StoreError};
use ra_core::types::{
    AgentConfig, AgentContext, AgentState, AutonomousIteration, FunctionCall, FunctionCallResult,
    AGENT_CANCELLED, SUPERVISOR_RESUMED,
};
use ra_telemetry::metrics::{
    MetricsCollector, AGENT_EXECUTIONS_RUNNING, AGENT_EXECUTIONS_SETTLED_TOTAL,
    AGENT_RESUMES_TOTAL, AGENT_STARTS_TOTAL,
};
use ra_telemetry::tracing_setup::{execution_span, lifecycle_span};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::executor::{record_failure, ExecutionOutcome, IterationExecutor};
use crate::registry::{ExecutionClaim, ExecutionRegistry, RegistryError};
use crate::state_machine::{transition, LifecycleEvent};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("agent not found: {0}")]
    NotFound(Uuid),

    /// The caller's execution id is not the persisted one. Someone else
    /// resumed or restarted the agent first.
    #[error("stale execution for agent {agent_id}: caller has {supplied}, current is {current}")]
    StaleExecution {
        agent_id: Uuid,
        supplied: Uuid,
        current: Uuid,
    },

    #[error("cannot {operation} agent {agent_id} in state {state}")]
    InvalidStateTransition {
        agent_id: Uuid,
        state: AgentState,
        operation: LifecycleEvent,
    },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("agent {0} completed without a result")]
    MissingResult(Uuid),

    #[error("agent {0} is already executing in this process")]
    AlreadyExecuting(Uuid),

    #[error("agent {agent_id} failed: {message}")]
    AgentFailed { agent_id: Uuid, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// The in-flight task started by a lifecycle operation.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub agent_id: Uuid,
    pub execution_id: Uuid,
    pub(crate) join: JoinHandle<ExecutionOutcome>,
}

impl ExecutionHandle {
    /// Wait for the task. This says how *this task* ended; the persisted
    /// state is the authority on the agent.
    pub async fn wait(self) -> Result<ExecutionOutcome> {
        self.join
            .await
            .map_err(|e| OrchestratorError::AgentFailed {
                agent_id: self.agent_id,
                message: format!("execution task did not finish: {e}"),
            })
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Decrements the running gauge however the task ends.
struct RunningGauge(Arc<MetricsCollector>);

impl RunningGauge {
    fn new(metrics: Arc<MetricsCollector>) -> Self {
        metrics.add_gauge(AGENT_EXECUTIONS_RUNNING, 1);
        Self(metrics)
    }
}

impl Drop for RunningGauge {
    fn drop(&mut self) {
        self.0.add_gauge(AGENT_EXECUTIONS_RUNNING, -1);
    }
}

// ---------------------------------------------------------------------------
// LifecycleOrchestrator
// ---------------------------------------------------------------------------

/// Entry point for starting, resuming, cancelling and inspecting agents.
///
/// Every operation on an existing agent takes the acting user, loads the
/// record, and treats agents owned by someone else as not found. It then
/// compares the caller's execution id with the persisted one, which keeps
/// two operators from both resuming the same paused agent. Rejected
/// operations write nothing.
pub struct LifecycleOrchestrator {
    store: Arc<dyn AgentStore>,
    registry: ExecutionRegistry,
    executors: HashMap<String, Arc<dyn IterationExecutor>>,
    metrics: Arc<MetricsCollector>,
    poll_interval: Duration,
}

impl LifecycleOrchestrator {
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self {
            store,
            registry: ExecutionRegistry::new(),
            executors: HashMap::new(),
            metrics: Arc::new(MetricsCollector::with_defaults()),
            poll_interval: Duration::from_millis(1000),
        }
    }

    /// Register the executor for its subtype, replacing any previous one.
    pub fn with_executor(mut self, executor: Arc<dyn IterationExecutor>) -> Self {
        self.executors
            .insert(executor.subtype().to_string(), executor);
        self
    }

    pub fn with_registry(mut self, registry: ExecutionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_config(self, config: &AgentsConfig) -> Self {
        self.with_poll_interval(Duration::from_millis(config.completion_poll_ms))
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Create, persist and launch a new agent.
    pub async fn start(&self, config: AgentConfig) -> Result<ExecutionHandle> {
        validate_config(&config)?;
        let executor = self.executor_for(&config.subtype)?;

        let ctx = AgentContext::from_config(&config);
        let span = lifecycle_span("start", &ctx.agent_id);
        let claim = self.claim(&ctx)?;
        self.store.save(&ctx).instrument(span.clone()).await?;

        span.in_scope(|| {
            tracing::info!(
                subtype = %ctx.subtype,
                user_id = %ctx.user_id,
                parent_agent_id = ?ctx.parent_agent_id,
                "agent started"
            )
        });
        self.metrics
            .increment_counter(AGENT_STARTS_TOTAL, &[("subtype", ctx.subtype.as_str())]);
        Ok(self.launch(ctx, executor, claim))
    }

    /// Resume an agent out of `error`. The supervisor's feedback is recorded
    /// in the history and appended to the prompt. The execution id is kept.
    pub async fn resume_after_error(
        &self,
        user_id: &str,
        agent_id: Uuid,
        execution_id: Uuid,
        feedback: &str,
    ) -> Result<ExecutionHandle> {
        let event = LifecycleEvent::ResumeAfterError;
        let mut ctx = self.load_checked(user_id, agent_id, execution_id).await?;
        let next = self.next_state(&ctx, event)?;
        let executor = self.executor_for(&ctx.subtype)?;

        ctx.function_call_history.push(FunctionCallResult::success(
            FunctionCall::new(SUPERVISOR_RESUMED),
            feedback,
        ));
        ctx.error = None;
        if !feedback.is_empty() {
            ctx.append_to_prompt("supervisor_feedback", feedback);
        }
        ctx.state = next;
        self.relaunch(ctx, executor, event).await
    }

    /// Resume from `hitl_user`, `hitl_threshold` or `hitl_tool`. Resuming
    /// from `hitl_tool` approves the call held for review.
    pub async fn resume_hil(
        &self,
        user_id: &str,
        agent_id: Uuid,
        execution_id: Uuid,
        feedback: Option<&str>,
    ) -> Result<ExecutionHandle> {
        let event = LifecycleEvent::ResumeHil;
        let mut ctx = self.load_checked(user_id, agent_id, execution_id).await?;
        let next = self.next_state(&ctx, event)?;
        let executor = self.executor_for(&ctx.subtype)?;

        if ctx.state == AgentState::HitlUser {
            ctx.hil_requested = false;
        }
        ctx.reset_hil_window();
        if let Some(feedback) = feedback.filter(|f| !f.is_empty()) {
            ctx.append_to_prompt("human_feedback", feedback);
        }
        ctx.state = next;
        self.relaunch(ctx, executor, event).await
    }

    /// Restart a `completed` agent as a fresh execution with additional
    /// instructions. Execution-scoped state is reset and the previous
    /// execution's iteration records are dropped.
    pub async fn resume_completed(
        &self,
        user_id: &str,
        agent_id: Uuid,
        execution_id: Uuid,
        instructions: &str,
    ) -> Result<ExecutionHandle> {
        let event = LifecycleEvent::ResumeCompleted;
        let mut ctx = self.load_checked(user_id, agent_id, execution_id).await?;
        let next = self.next_state(&ctx, event)?;
        let executor = self.executor_for(&ctx.subtype)?;

        ctx.reset_for_restart();
        if !instructions.is_empty() {
            ctx.append_to_prompt("instructions", instructions);
        }
        ctx.state = next;
        self.relaunch(ctx, executor, event).await
    }

    /// Restart a `completed` agent with its user request replaced. History
    /// and iteration count are kept; the execution id is new.
    pub async fn resume_completed_with_updated_request(
        &self,
        user_id: &str,
        agent_id: Uuid,
        execution_id: Uuid,
        new_request: &str,
    ) -> Result<ExecutionHandle> {
        let event = LifecycleEvent::ResumeWithUpdatedRequest;
        let mut ctx = self.load_checked(user_id, agent_id, execution_id).await?;
        let next = self.next_state(&ctx, event)?;
        let executor = self.executor_for(&ctx.subtype)?;

        ctx.replace_user_request(new_request);
        ctx.regenerate_execution();
        ctx.error = None;
        ctx.state = next;
        self.relaunch(ctx, executor, event).await
    }

    /// Answer the agent's pending question. The answer is written into the
    /// `Agent_requestFeedback` entry the agent left at the end of its history.
    pub async fn provide_feedback(
        &self,
        user_id: &str,
        agent_id: Uuid,
        execution_id: Uuid,
        feedback: &str,
    ) -> Result<ExecutionHandle> {
        let event = LifecycleEvent::ProvideFeedback;
        let mut ctx = self.load_checked(user_id, agent_id, execution_id).await?;
        let next = self.next_state(&ctx, event)?;
        if !ctx.has_pending_feedback_request() {
            tracing::warn!(%agent_id, "provide_feedback without a pending feedback request");
            return Err(OrchestratorError::PreconditionFailed(format!(
                "agent {agent_id} has no pending feedback request"
            )));
        }
        let executor = self.executor_for(&ctx.subtype)?;

        if let Some(entry) = ctx.function_call_history.last_mut() {
            entry.stdout = Some(feedback.to_string());
        }
        ctx.reset_hil_window();
        ctx.state = next;
        self.relaunch(ctx, executor, LifecycleEvent::ProvideFeedback)
            .await
    }

    /// Stop an agent. The agent ends in `completed` with an `Agent_cancelled`
    /// record; a task still running notices at its next ownership check.
    ///
    /// The write is narrow and conditional on the state the checks saw, so
    /// progress a running loop commits in between is kept.
    pub async fn cancel(
        &self,
        user_id: &str,
        agent_id: Uuid,
        execution_id: Uuid,
        feedback: &str,
    ) -> Result<AgentContext> {
        let event = LifecycleEvent::Cancel;
        loop {
            let ctx = self.load_checked(user_id, agent_id, execution_id).await?;
            let next = self.next_state(&ctx, event)?;

            let change = StateChange::new(execution_id, ctx.state, next)
                .with_history_entry(FunctionCallResult::success(
                    FunctionCall::new(AGENT_CANCELLED),
                    feedback,
                ))
                .dropping_pending_calls();
            if let Some(ctx) = self.store.change_state(agent_id, change).await? {
                tracing::info!(
                    %agent_id,
                    %execution_id,
                    still_running = self.registry.is_executing(&agent_id),
                    "agent cancelled"
                );
                return Ok(ctx);
            }
            tracing::debug!(%agent_id, "agent changed state during cancel; checking again");
        }
    }

    // -----------------------------------------------------------------------
    // Inspection and narrow updates
    // -----------------------------------------------------------------------

    /// The agent's context, if `user_id` owns it. Agents owned by someone
    /// else are reported as not found.
    pub async fn load(&self, user_id: &str, agent_id: Uuid) -> Result<AgentContext> {
        let ctx = self.fetch(agent_id).await?;
        if ctx.user_id != user_id {
            tracing::warn!(%agent_id, user_id, "agent belongs to another user");
            return Err(OrchestratorError::NotFound(agent_id));
        }
        Ok(ctx)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<AgentContext>> {
        Ok(self.store.list(user_id).await?)
    }

    pub async fn list_running(&self, user_id: &str) -> Result<Vec<AgentContext>> {
        Ok(self.store.list_running(user_id).await?)
    }

    pub async fn iterations(
        &self,
        user_id: &str,
        agent_id: Uuid,
    ) -> Result<Vec<AutonomousIteration>> {
        self.load(user_id, agent_id).await?;
        Ok(self.store.load_iterations(agent_id).await?)
    }

    /// Delete root agents owned by `user_id` with everything under them.
    /// Ids with a task running in this process are skipped.
    pub async fn delete(&self, user_id: &str, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let (busy, idle): (Vec<Uuid>, Vec<Uuid>) =
            ids.iter().partition(|id| self.registry.is_executing(id));
        if !busy.is_empty() {
            tracing::info!(?busy, "skipping delete of executing agents");
        }
        let deleted = self.store.delete(user_id, &idle).await?;
        tracing::info!(user_id, count = deleted.len(), "agents deleted");
        Ok(deleted)
    }

    /// Ask the loop to pause into `hitl_user` at its next cycle end.
    pub async fn request_hil(&self, user_id: &str, agent_id: Uuid) -> Result<()> {
        let ctx = self.load(user_id, agent_id).await?;
        if ctx.state.is_terminal() {
            return Err(OrchestratorError::InvalidStateTransition {
                agent_id,
                state: ctx.state,
                operation: LifecycleEvent::UserPause,
            });
        }
        self.store.update_hil_requested(agent_id, true).await?;
        tracing::info!(%agent_id, "human pause requested");
        Ok(())
    }

    pub async fn update_functions(
        &self,
        user_id: &str,
        agent_id: Uuid,
        names: &[String],
    ) -> Result<()> {
        self.load(user_id, agent_id).await?;
        self.store
            .update_functions(agent_id, names)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => OrchestratorError::NotFound(id),
                other => other.into(),
            })
    }

    pub fn is_executing(&self, agent_id: &Uuid) -> bool {
        self.registry.is_executing(agent_id)
    }

    /// Record a failure for a task that ended without settling the agent.
    pub(crate) async fn record_failure(&self, agent_id: Uuid, execution_id: Uuid, message: &str) {
        record_failure(self.store.as_ref(), agent_id, execution_id, message).await;
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Unscoped read, for callers that already hold the agent's handle.
    pub(crate) async fn fetch(&self, agent_id: Uuid) -> Result<AgentContext> {
        self.store
            .load(agent_id)
            .await?
            .ok_or(OrchestratorError::NotFound(agent_id))
    }

    async fn load_checked(
        &self,
        user_id: &str,
        agent_id: Uuid,
        execution_id: Uuid,
    ) -> Result<AgentContext> {
        let ctx = self.load(user_id, agent_id).await?;
        if ctx.execution_id != execution_id {
            tracing::warn!(
                %agent_id,
                supplied = %execution_id,
                current = %ctx.execution_id,
                "rejected stale execution id"
            );
            return Err(OrchestratorError::StaleExecution {
                agent_id,
                supplied: execution_id,
                current: ctx.execution_id,
            });
        }
        Ok(ctx)
    }

    fn next_state(&self, ctx: &AgentContext, event: LifecycleEvent) -> Result<AgentState> {
        transition(ctx.state, event).map_err(|_| {
            tracing::warn!(agent_id = %ctx.agent_id, state = %ctx.state, %event, "rejected lifecycle operation");
            OrchestratorError::InvalidStateTransition {
                agent_id: ctx.agent_id,
                state: ctx.state,
                operation: event,
            }
        })
    }

    fn executor_for(&self, subtype: &str) -> Result<Arc<dyn IterationExecutor>> {
        self.executors.get(subtype).cloned().ok_or_else(|| {
            OrchestratorError::InvalidConfiguration(format!(
                "no executor registered for subtype `{subtype}`"
            ))
        })
    }

    fn claim(&self, ctx: &AgentContext) -> Result<ExecutionClaim> {
        self.registry
            .claim(ctx.agent_id, ctx.execution_id)
            .map_err(|e| match e {
                RegistryError::AlreadyExecuting { agent_id, .. } => {
                    OrchestratorError::AlreadyExecuting(agent_id)
                }
            })
    }

    /// Claim, persist and launch an already-mutated context.
    async fn relaunch(
        &self,
        mut ctx: AgentContext,
        executor: Arc<dyn IterationExecutor>,
        event: LifecycleEvent,
    ) -> Result<ExecutionHandle> {
        let claim = self.claim(&ctx)?;
        ctx.touch();
        self.store.save(&ctx).await?;
        if event == LifecycleEvent::ResumeCompleted {
            // iteration numbers start over; drop the old execution's records
            self.store.clear_iterations(ctx.agent_id).await?;
        }

        tracing::info!(
            agent_id = %ctx.agent_id,
            execution_id = %ctx.execution_id,
            operation = %event,
            "agent resumed"
        );
        self.metrics
            .increment_counter(AGENT_RESUMES_TOTAL, &[("operation", event.as_str())]);
        Ok(self.launch(ctx, executor, claim))
    }

    fn launch(
        &self,
        ctx: AgentContext,
        executor: Arc<dyn IterationExecutor>,
        claim: ExecutionClaim,
    ) -> ExecutionHandle {
        let agent_id = ctx.agent_id;
        let execution_id = ctx.execution_id;
        let span = execution_span(&agent_id, &execution_id, &ctx.trace_id);
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let gauge = RunningGauge::new(Arc::clone(&metrics));

        let join = tokio::spawn(
            async move {
                let _claim = claim;
                let _gauge = gauge;
                let outcome = match executor.run(ctx).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(error = %e, "executor failed");
                        record_failure(store.as_ref(), agent_id, execution_id, &e.to_string())
                            .await;
                        ExecutionOutcome::Failed
                    }
                };
                let label = if outcome == ExecutionOutcome::Failed {
                    "failed"
                } else {
                    "ok"
                };
                metrics.increment_counter(AGENT_EXECUTIONS_SETTLED_TOTAL, &[("outcome", label)]);
                outcome
            }
            .instrument(span),
        );

        ExecutionHandle {
            agent_id,
            execution_id,
            join,
        }
    }
}

fn validate_config(config: &AgentConfig) -> Result<()> {
    if !config.hil_budget.is_finite() || config.hil_budget < 0.0 {
        return Err(OrchestratorError::InvalidConfiguration(format!(
            "hil_budget must be a non-negative number, got {}",
            config.hil_budget
        )));
    }
    if config.user_id.trim().is_empty() {
        return Err(OrchestratorError::InvalidConfiguration(
            "user_id must not be empty".into(),
        ));
    }
    Ok(())
}
