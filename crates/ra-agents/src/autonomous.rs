use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ra_core::config::AgentsConfig;
use ra_core::store::AgentStore;
use ra_core::types::{
    AgentContext, AgentState, AutonomousIteration, FunctionCall, FunctionCallResult,
    AGENT_COMPLETED, AGENT_REQUEST_FEEDBACK, DEFAULT_SUBTYPE,
};
use ra_harness::envelope::format_function_results;
use ra_harness::functions::{AgentFunction, FunctionError, FunctionRegistry};
use ra_harness::provider::{ReasoningEngine, StepRequest};
use ra_telemetry::metrics::{MetricsCollector, AGENT_ITERATION_SECONDS};
use tracing::Instrument;

use crate::executor::{ExecutionOutcome, ExecutorError, IterationExecutor, Result};
use crate::hil;
use crate::state_machine::{transition, LifecycleEvent};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Subtype this loop registers under.
    pub subtype: String,
    pub system_prompt: String,
    /// Most recent function results replayed into each prompt.
    pub max_history_in_prompt: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            subtype: DEFAULT_SUBTYPE.to_string(),
            system_prompt: String::new(),
            max_history_in_prompt: 50,
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &AgentsConfig) -> Self {
        Self {
            subtype: config.default_subtype.clone(),
            max_history_in_prompt: config.max_history_in_prompt,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// AutonomousLoop
// ---------------------------------------------------------------------------

/// The default executor: ask the engine for a plan, run the planned calls,
/// record the cycle, ask the HIL gate, repeat.
///
/// Every cycle starts and ends with an ownership check against the store,
/// and the cycle's write only lands if the record is still this execution's
/// and still in `agent`. Once the record has moved on (a cancel, a restart)
/// the loop returns without writing.
pub struct AutonomousLoop {
    store: Arc<dyn AgentStore>,
    engine: Arc<dyn ReasoningEngine>,
    functions: Arc<FunctionRegistry>,
    settings: LoopSettings,
    metrics: Option<Arc<MetricsCollector>>,
}

impl AutonomousLoop {
    pub fn new(
        store: Arc<dyn AgentStore>,
        engine: Arc<dyn ReasoningEngine>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        Self {
            store,
            engine,
            functions,
            settings: LoopSettings::default(),
            metrics: None,
        }
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Input prompt, then the memory scratchpad, then the most recent
    /// function results in the envelope format.
    pub fn build_prompt(&self, ctx: &AgentContext) -> String {
        let mut prompt = ctx.input_prompt.clone();
        if !ctx.memory.is_empty() {
            let lines: Vec<String> = ctx
                .memory
                .iter()
                .map(|(key, value)| format!("{key}: {value}"))
                .collect();
            prompt.push_str(&format!("\n\n<memory>\n{}\n</memory>", lines.join("\n")));
        }
        let history = &ctx.function_call_history;
        let skip = history
            .len()
            .saturating_sub(self.settings.max_history_in_prompt);
        let envelope = format_function_results(&history[skip..]);
        if !envelope.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&envelope);
        }
        prompt
    }

    /// Reload the record and confirm this task still owns it. Fields other
    /// writers may change while a cycle runs are merged into `ctx`.
    async fn still_owns(&self, ctx: &mut AgentContext) -> Result<bool> {
        let Some(stored) = self.store.load(ctx.agent_id).await? else {
            tracing::warn!("agent record disappeared; stopping");
            return Ok(false);
        };
        if stored.execution_id != ctx.execution_id || stored.state != AgentState::Agent {
            tracing::info!(
                stored_execution_id = %stored.execution_id,
                stored_state = %stored.state,
                "execution superseded; stopping without writing"
            );
            return Ok(false);
        }
        ctx.hil_requested = stored.hil_requested;
        ctx.functions = stored.functions;
        for child in stored.child_agent_ids {
            ctx.add_child(child);
        }
        Ok(true)
    }

    fn enabled_function(&self, ctx: &AgentContext, name: &str) -> Option<Arc<dyn AgentFunction>> {
        if !ctx.functions.iter().any(|enabled| enabled == name) {
            return None;
        }
        self.functions.get(name)
    }

    fn record_call(ctx: &mut AgentContext, record: &mut AutonomousIteration, result: FunctionCallResult) {
        record.function_calls.push(result.clone());
        ctx.function_call_history.push(result);
    }

    /// Hold `call` (and everything after it) for human review.
    fn hold_for_review(ctx: &mut AgentContext, call: FunctionCall) -> Option<LifecycleEvent> {
        tracing::info!(function = %call.function_name, "function call held for review");
        ctx.awaiting_review = Some(call.function_name.clone());
        ctx.invoking.insert(0, call);
        Some(LifecycleEvent::ReviewRequired)
    }

    /// Run `ctx.invoking` in order. Returns the event that ends the
    /// execution, if a call produced one.
    async fn run_calls(
        &self,
        ctx: &mut AgentContext,
        record: &mut AutonomousIteration,
    ) -> Option<LifecycleEvent> {
        let approved = ctx.awaiting_review.take();
        let mut first = true;

        while !ctx.invoking.is_empty() {
            let call = ctx.invoking.remove(0);
            let review_approved =
                first && approved.as_deref() == Some(call.function_name.as_str());
            first = false;

            if call.function_name == AGENT_COMPLETED {
                Self::record_call(ctx, record, FunctionCallResult::success(call, ""));
                ctx.invoking.clear();
                return Some(LifecycleEvent::Complete);
            }
            if call.function_name == AGENT_REQUEST_FEEDBACK {
                Self::record_call(ctx, record, FunctionCallResult::pending(call));
                ctx.invoking.clear();
                return Some(LifecycleEvent::RequestFeedback);
            }

            let Some(function) = self.enabled_function(ctx, &call.function_name) else {
                let message = format!("function `{}` is not available", call.function_name);
                tracing::warn!(function = %call.function_name, "engine called an unavailable function");
                Self::record_call(ctx, record, FunctionCallResult::failure(call, message));
                continue;
            };

            if function.descriptor().requires_review && !review_approved {
                return Self::hold_for_review(ctx, call);
            }

            match function.invoke(&call.parameters, review_approved).await {
                Ok(stdout) => {
                    Self::record_call(ctx, record, FunctionCallResult::success(call, stdout));
                }
                Err(FunctionError::ReviewRequired { reason }) if !review_approved => {
                    ctx.notes
                        .push(format!("{} requested review: {reason}", call.function_name));
                    return Self::hold_for_review(ctx, call);
                }
                Err(e) => {
                    tracing::debug!(function = %call.function_name, error = %e, "function call failed");
                    Self::record_call(ctx, record, FunctionCallResult::failure(call, e.to_string()));
                }
            }
        }
        None
    }

    /// One loop cycle. `Some` ends the execution.
    async fn cycle(&self, ctx: &mut AgentContext) -> Result<Option<ExecutionOutcome>> {
        if !self.still_owns(ctx).await? {
            return Ok(Some(ExecutionOutcome::Superseded));
        }

        let started = Instant::now();
        let iteration = ctx.iterations + 1;
        let mut event: Option<LifecycleEvent> = None;

        let mut record = if ctx.invoking.is_empty() {
            let prompt = self.build_prompt(ctx);
            let mut record = AutonomousIteration::new(ctx, iteration, prompt.clone());
            record.stats.started_at = Some(Utc::now());
            let request = StepRequest {
                agent_id: ctx.agent_id,
                iteration,
                system_prompt: self.settings.system_prompt.clone(),
                prompt,
                functions: self.functions.descriptors_for(&ctx.functions),
            };
            match self.engine.next_step(request).await {
                Ok(step) => {
                    ctx.add_cost(step.cost);
                    record.cost = step.cost;
                    record.agent_plan = step.reasoning;
                    record.stats.input_tokens = step.input_tokens;
                    record.stats.output_tokens = step.output_tokens;
                    ctx.invoking = step.function_calls;
                    if let Some(reason) = hil::budget_exhausted(ctx) {
                        tracing::info!(
                            ?reason,
                            deferred = ctx.invoking.len(),
                            "hil budget reached; deferring planned calls"
                        );
                        event = Some(LifecycleEvent::ThresholdReached);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reasoning engine failed");
                    ctx.error = Some(e.to_string());
                    record.error = ctx.error.clone();
                    event = Some(LifecycleEvent::Fail);
                }
            }
            record
        } else {
            let mut record = AutonomousIteration::new(ctx, iteration, String::new());
            record.agent_plan = format!("running {} deferred call(s)", ctx.invoking.len());
            record.stats.started_at = Some(Utc::now());
            record
        };

        if event.is_none() {
            event = self.run_calls(ctx, &mut record).await;
        }

        ctx.iterations = iteration;
        ctx.iterations_since_hil += 1;
        record.memory = ctx.memory.clone();
        record.tool_state = ctx.tool_state.clone();
        record.stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        // An operator may have cancelled, paused or restarted meanwhile.
        if !self.still_owns(ctx).await? {
            return Ok(Some(ExecutionOutcome::Superseded));
        }

        if event.is_none() {
            event = hil::evaluate(ctx).event();
        }
        if let Some(ev) = event {
            ctx.state = transition(ctx.state, ev).map_err(|e| ExecutorError::Other(e.to_string()))?;
        }

        // Ownership is checked again inside the write.
        ctx.touch();
        let written = self
            .store
            .save_if_owned(ctx, Some(&record), ctx.execution_id, AgentState::Agent)
            .await?;
        let Some(written) = written else {
            tracing::info!("execution superseded while recording the cycle; nothing written");
            return Ok(Some(ExecutionOutcome::Superseded));
        };
        *ctx = written;

        if let Some(metrics) = &self.metrics {
            metrics.record_histogram(AGENT_ITERATION_SECONDS, started.elapsed().as_secs_f64());
        }
        tracing::debug!(iteration, state = %ctx.state, cost = ctx.cost, "cycle recorded");

        Ok(event.map(|_| ExecutionOutcome::Settled(ctx.state)))
    }
}

#[async_trait::async_trait]
impl IterationExecutor for AutonomousLoop {
    fn subtype(&self) -> &str {
        &self.settings.subtype
    }

    async fn run(&self, mut ctx: AgentContext) -> Result<ExecutionOutcome> {
        tracing::info!(iterations = ctx.iterations, "autonomous loop starting");
        loop {
            let span = tracing::debug_span!("cycle", iteration = ctx.iterations + 1);
            if let Some(outcome) = self.cycle(&mut ctx).instrument(span).await? {
                tracing::info!(?outcome, iterations = ctx.iterations, "autonomous loop stopped");
                return Ok(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ra_core::memory_store::MemoryAgentStore;
    use ra_core::types::AgentConfig;
    use ra_harness::provider::ScriptedEngine;

    fn make_loop(history: usize) -> AutonomousLoop {
        AutonomousLoop::new(
            Arc::new(MemoryAgentStore::new()),
            Arc::new(ScriptedEngine::new(Vec::new())),
            Arc::new(FunctionRegistry::new()),
        )
        .with_settings(LoopSettings {
            max_history_in_prompt: history,
            ..LoopSettings::default()
        })
    }

    #[test]
    fn prompt_replays_only_recent_history() {
        let mut ctx = AgentContext::from_config(
            &AgentConfig::new("a", "u", "do it").with_memory("lang", "rust"),
        );
        for i in 0..5 {
            ctx.function_call_history.push(FunctionCallResult::success(
                FunctionCall::new(format!("F{i}")),
                "ok",
            ));
        }
        let prompt = make_loop(2).build_prompt(&ctx);
        assert!(prompt.starts_with("<user_request>\ndo it\n</user_request>"));
        assert!(prompt.contains("<memory>\nlang: rust\n</memory>"));
        assert!(!prompt.contains("<function_name>F2</function_name>"));
        assert!(prompt.contains("<function_name>F3</function_name>"));
        assert!(prompt.ends_with("</function_results>"));
    }

    #[test]
    fn prompt_without_history_has_no_envelope() {
        let ctx = AgentContext::from_config(&AgentConfig::new("a", "u", "x"));
        assert_eq!(make_loop(10).build_prompt(&ctx), ctx.input_prompt);
    }
}
