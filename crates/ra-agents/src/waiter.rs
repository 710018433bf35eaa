use ra_core::types::{AgentConfig, AgentContext, AgentState};
use tokio::time::MissedTickBehavior;

use crate::orchestrator::{ExecutionHandle, LifecycleOrchestrator, OrchestratorError, Result};

// ---------------------------------------------------------------------------
// Completion waiter
//
// The persisted state decides when an agent is done. The task handle only
// tells us the local task ended, which for a detached executor says nothing
// about the agent.
// ---------------------------------------------------------------------------

impl LifecycleOrchestrator {
    /// Start an agent and block until it reaches a terminal state. Returns
    /// the `note` of its final `Agent_completed` call.
    ///
    /// Pauses for human input do not end the wait: another caller resuming
    /// the agent lets it carry on to completion.
    pub async fn start_and_wait_for_completion(&self, config: AgentConfig) -> Result<String> {
        let handle = self.start(config).await?;
        self.wait_for_completion(handle).await
    }

    /// Poll the store until the agent behind `handle` is terminal.
    pub async fn wait_for_completion(&self, handle: ExecutionHandle) -> Result<String> {
        let ExecutionHandle {
            agent_id,
            execution_id,
            mut join,
        } = handle;
        let mut ticker = tokio::time::interval(self.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut task_done = false;

        loop {
            tokio::select! {
                joined = &mut join, if !task_done => {
                    task_done = true;
                    match joined {
                        Ok(outcome) => tracing::debug!(%agent_id, ?outcome, "execution task finished"),
                        Err(e) => {
                            tracing::error!(%agent_id, error = %e, "execution task aborted");
                            self.record_failure(agent_id, execution_id, &format!("execution task aborted: {e}"))
                                .await;
                        }
                    }
                }
                _ = ticker.tick() => {}
            }

            let ctx = self.fetch(agent_id).await?;
            if ctx.state.is_terminal() {
                return settle(ctx);
            }
        }
    }
}

fn settle(ctx: AgentContext) -> Result<String> {
    match ctx.state {
        AgentState::Completed if ctx.was_cancelled() => {
            tracing::info!(agent_id = %ctx.agent_id, "agent was cancelled");
            Err(OrchestratorError::MissingResult(ctx.agent_id))
        }
        AgentState::Completed => ctx
            .completion_result()
            .ok_or(OrchestratorError::MissingResult(ctx.agent_id)),
        _ => Err(OrchestratorError::AgentFailed {
            agent_id: ctx.agent_id,
            message: ctx
                .error
                .unwrap_or_else(|| "agent ended in error without a message".to_string()),
        }),
    }
}
