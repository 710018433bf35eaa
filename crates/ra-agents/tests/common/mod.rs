#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ra_agents::autonomous::{AutonomousLoop, LoopSettings};
use ra_agents::orchestrator::LifecycleOrchestrator;
use ra_agents::registry::ExecutionRegistry;
use ra_core::memory_store::MemoryAgentStore;
use ra_core::store::{AgentStore, StateChange};
use ra_core::types::{AgentConfig, AgentContext, AgentState, AutonomousIteration};
use uuid::Uuid;
use ra_harness::functions::{
    required_str, AgentFunction, FunctionDescriptor, FunctionError, FunctionRegistry,
};
use ra_harness::provider::{ReasoningEngine, ScriptedEngine, StepResponse};
use serde_json::{json, Value};

pub const USER: &str = "alice";

// ---------------------------------------------------------------------------
// Fake tools
// ---------------------------------------------------------------------------

/// Uppercases its `text` parameter.
pub struct Upper;

#[async_trait::async_trait]
impl AgentFunction for Upper {
    fn descriptor(&self) -> FunctionDescriptor {
        FunctionDescriptor {
            name: "Text_upper".into(),
            description: "uppercase text".into(),
            parameters: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            requires_review: false,
        }
    }

    async fn invoke(
        &self,
        params: &BTreeMap<String, Value>,
        _review_approved: bool,
    ) -> Result<String, FunctionError> {
        Ok(required_str(params, "text")?.to_uppercase())
    }
}

/// Always needs a human before running. Counts invocations.
#[derive(Default)]
pub struct Deploy {
    pub calls: AtomicUsize,
    pub approved_calls: AtomicUsize,
}

#[async_trait::async_trait]
impl AgentFunction for Deploy {
    fn descriptor(&self) -> FunctionDescriptor {
        FunctionDescriptor {
            name: "Deploy_run".into(),
            description: "deploy to production".into(),
            parameters: json!({"type": "object"}),
            requires_review: true,
        }
    }

    async fn invoke(
        &self,
        _params: &BTreeMap<String, Value>,
        review_approved: bool,
    ) -> Result<String, FunctionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if review_approved {
            self.approved_calls.fetch_add(1, Ordering::SeqCst);
        }
        Ok("deployed".into())
    }
}

/// Decides on its own that a call is risky and asks for review.
#[derive(Default)]
pub struct Shell {
    pub calls: AtomicUsize,
}

#[async_trait::async_trait]
impl AgentFunction for Shell {
    fn descriptor(&self) -> FunctionDescriptor {
        FunctionDescriptor {
            name: "Shell_run".into(),
            description: "run a shell command".into(),
            parameters: json!({"type": "object", "properties": {"cmd": {"type": "string"}}}),
            requires_review: false,
        }
    }

    async fn invoke(
        &self,
        params: &BTreeMap<String, Value>,
        review_approved: bool,
    ) -> Result<String, FunctionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let cmd = required_str(params, "cmd")?;
        if cmd.starts_with("rm") && !review_approved {
            return Err(FunctionError::ReviewRequired {
                reason: format!("`{cmd}` deletes files"),
            });
        }
        Ok(format!("ran {cmd}"))
    }
}

// ---------------------------------------------------------------------------
// Slow store
// ---------------------------------------------------------------------------

/// Holds every cycle commit for `delay` before handing it to `inner`, which
/// leaves a window between a loop's last ownership check and its write.
pub struct SlowCommitStore {
    pub inner: Arc<dyn AgentStore>,
    pub delay: Duration,
}

impl SlowCommitStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryAgentStore::new()),
            delay,
        }
    }
}

#[async_trait::async_trait]
impl AgentStore for SlowCommitStore {
    async fn save(&self, ctx: &AgentContext) -> ra_core::store::Result<()> {
        self.inner.save(ctx).await
    }

    async fn update_state(
        &self,
        ctx: &mut AgentContext,
        state: AgentState,
    ) -> ra_core::store::Result<()> {
        self.inner.update_state(ctx, state).await
    }

    async fn save_if_owned(
        &self,
        ctx: &AgentContext,
        iteration: Option<&AutonomousIteration>,
        expected_execution_id: Uuid,
        expected_state: AgentState,
    ) -> ra_core::store::Result<Option<AgentContext>> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .save_if_owned(ctx, iteration, expected_execution_id, expected_state)
            .await
    }

    async fn change_state(
        &self,
        agent_id: Uuid,
        change: StateChange,
    ) -> ra_core::store::Result<Option<AgentContext>> {
        self.inner.change_state(agent_id, change).await
    }

    async fn load(&self, agent_id: Uuid) -> ra_core::store::Result<Option<AgentContext>> {
        self.inner.load(agent_id).await
    }

    async fn list(&self, user_id: &str) -> ra_core::store::Result<Vec<AgentContext>> {
        self.inner.list(user_id).await
    }

    async fn list_running(&self, user_id: &str) -> ra_core::store::Result<Vec<AgentContext>> {
        self.inner.list_running(user_id).await
    }

    async fn delete(&self, user_id: &str, ids: &[Uuid]) -> ra_core::store::Result<Vec<Uuid>> {
        self.inner.delete(user_id, ids).await
    }

    async fn update_functions(&self, agent_id: Uuid, names: &[String]) -> ra_core::store::Result<()> {
        self.inner.update_functions(agent_id, names).await
    }

    async fn update_hil_requested(
        &self,
        agent_id: Uuid,
        requested: bool,
    ) -> ra_core::store::Result<()> {
        self.inner.update_hil_requested(agent_id, requested).await
    }

    async fn save_iteration(&self, record: &AutonomousIteration) -> ra_core::store::Result<()> {
        self.inner.save_iteration(record).await
    }

    async fn load_iterations(
        &self,
        agent_id: Uuid,
    ) -> ra_core::store::Result<Vec<AutonomousIteration>> {
        self.inner.load_iterations(agent_id).await
    }

    async fn clear_iterations(&self, agent_id: Uuid) -> ra_core::store::Result<()> {
        self.inner.clear_iterations(agent_id).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<dyn AgentStore>,
    pub engine: Arc<ScriptedEngine>,
    pub deploy: Arc<Deploy>,
    pub shell: Arc<Shell>,
    pub registry: ExecutionRegistry,
    pub orchestrator: LifecycleOrchestrator,
}

impl Harness {
    pub fn new(script: Vec<StepResponse>) -> Self {
        Self::build(Arc::new(MemoryAgentStore::new()), ScriptedEngine::new(script))
    }

    pub fn with_engine(engine: ScriptedEngine) -> Self {
        Self::build(Arc::new(MemoryAgentStore::new()), engine)
    }

    pub fn build(store: Arc<dyn AgentStore>, engine: ScriptedEngine) -> Self {
        let engine = Arc::new(engine);
        let deploy = Arc::new(Deploy::default());
        let shell = Arc::new(Shell::default());

        let mut functions = FunctionRegistry::new();
        functions.register(Arc::new(Upper)).unwrap();
        functions.register(deploy.clone()).unwrap();
        functions.register(shell.clone()).unwrap();

        let engine_dyn: Arc<dyn ReasoningEngine> = engine.clone();
        let executor = AutonomousLoop::new(store.clone(), engine_dyn, Arc::new(functions))
            .with_settings(LoopSettings::default());

        let registry = ExecutionRegistry::new();
        let orchestrator = LifecycleOrchestrator::new(store.clone())
            .with_registry(registry.clone())
            .with_executor(Arc::new(executor))
            .with_poll_interval(Duration::from_millis(10));

        Self {
            store,
            engine,
            deploy,
            shell,
            registry,
            orchestrator,
        }
    }

    pub async fn load(&self, agent_id: Uuid) -> AgentContext {
        self.orchestrator.load(USER, agent_id).await.unwrap()
    }

    /// Store a fresh agent directly in `state`, without running it. A
    /// `hitl_feedback` agent gets a pending question.
    pub async fn seed(&self, state: AgentState) -> AgentContext {
        let mut ctx = AgentContext::from_config(&config("seeded"));
        ctx.state = state;
        ctx.iterations = 3;
        if state == AgentState::HitlFeedback {
            ctx.function_call_history.push(ra_core::types::FunctionCallResult::pending(
                ra_core::types::FunctionCall::request_feedback("which one?"),
            ));
        }
        if state == AgentState::Error {
            ctx.error = Some("engine down".into());
        }
        self.store.save(&ctx).await.unwrap();
        ctx
    }

    /// Start an agent and wait for its task to settle.
    pub async fn run_until_settled(&self, config: AgentConfig) -> AgentContext {
        let handle = self.orchestrator.start(config).await.unwrap();
        let agent_id = handle.agent_id;
        handle.wait().await.unwrap();
        self.load(agent_id).await
    }
}

pub fn config(prompt: &str) -> AgentConfig {
    AgentConfig::new("worker", USER, prompt)
        .with_functions(["Text_upper", "Deploy_run", "Shell_run"])
        .with_hil(0.0, 0)
}

/// Snapshot for "nothing changed" assertions.
pub fn snapshot(ctx: &AgentContext) -> Value {
    serde_json::to_value(ctx).unwrap()
}

pub fn assert_state(ctx: &AgentContext, state: AgentState) {
    assert_eq!(ctx.state, state, "agent {} error: {:?}", ctx.agent_id, ctx.error);
}
