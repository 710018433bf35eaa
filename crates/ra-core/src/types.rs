use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version written into every persisted [`AgentContext`].
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Sentinel function names
// ---------------------------------------------------------------------------

/// The agent finished; `parameters.note` carries the final result.
pub const AGENT_COMPLETED: &str = "Agent_completed";
pub const AGENT_COMPLETED_PARAM: &str = "note";

/// The agent asked a human a question; the answer is written into `stdout`.
pub const AGENT_REQUEST_FEEDBACK: &str = "Agent_requestFeedback";
pub const REQUEST_FEEDBACK_PARAM: &str = "request";

/// Appended by a cancellation. The agent is left in `completed`.
pub const AGENT_CANCELLED: &str = "Agent_cancelled";

/// Appended when a supervisor resumes an agent out of `error`.
pub const SUPERVISOR_RESUMED: &str = "Supervisor_resumed";

const USER_REQUEST_OPEN: &str = "<user_request>";
const USER_REQUEST_CLOSE: &str = "</user_request>";

pub const DEFAULT_SUBTYPE: &str = "autonomous";
pub const DEFAULT_HIL_BUDGET: f64 = 2.0;
pub const DEFAULT_HIL_COUNT: u32 = 10;

/// Generate a trace ID (32 lowercase hex characters).
pub fn new_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Actively iterating.
    Agent,
    /// A human explicitly paused it.
    HitlUser,
    /// Budget or iteration ceiling reached.
    HitlThreshold,
    /// A tool asked for human review before a side-effecting action.
    HitlTool,
    /// The agent asked a human a question and is waiting for the answer.
    HitlFeedback,
    Completed,
    Error,
}

impl AgentState {
    pub const ALL: [AgentState; 7] = [
        AgentState::Agent,
        AgentState::HitlUser,
        AgentState::HitlThreshold,
        AgentState::HitlTool,
        AgentState::HitlFeedback,
        AgentState::Completed,
        AgentState::Error,
    ];

    /// The canonical terminal set. Every "is this agent finished" check goes
    /// through here.
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Error)
    }

    pub fn is_hil(self) -> bool {
        matches!(
            self,
            AgentState::HitlUser
                | AgentState::HitlThreshold
                | AgentState::HitlTool
                | AgentState::HitlFeedback
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Agent => "agent",
            AgentState::HitlUser => "hitl_user",
            AgentState::HitlThreshold => "hitl_threshold",
            AgentState::HitlTool => "hitl_tool",
            AgentState::HitlFeedback => "hitl_feedback",
            AgentState::Completed => "completed",
            AgentState::Error => "error",
        }
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// - `agent` may enter any `hitl_*` state, `completed` or `error`
    /// - each `hitl_*` state returns to `agent` on resume, or to `completed`
    ///   when cancelled
    /// - `completed` and `error` only go back to `agent`
    pub fn can_transition_to(self, target: AgentState) -> bool {
        match (self, target) {
            (AgentState::Agent, next) => next != AgentState::Agent,
            (from, AgentState::Agent) if from.is_hil() || from.is_terminal() => true,
            (from, AgentState::Completed) if from.is_hil() => true,
            _ => false,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown agent state: `{0}`")]
pub struct ParseStateError(pub String);

impl FromStr for AgentState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Function calls
// ---------------------------------------------------------------------------

/// A function call planned by the reasoning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub function_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl FunctionCall {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// `Agent_completed` call carrying the final result.
    pub fn completed(note: impl Into<String>) -> Self {
        Self::new(AGENT_COMPLETED).with_param(AGENT_COMPLETED_PARAM, note.into())
    }

    /// `Agent_requestFeedback` call carrying the question.
    pub fn request_feedback(request: impl Into<String>) -> Self {
        Self::new(AGENT_REQUEST_FEEDBACK).with_param(REQUEST_FEEDBACK_PARAM, request.into())
    }
}

/// One entry of `function_call_history`. Immutable once appended, except for
/// the answer written into a pending `Agent_requestFeedback` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResult {
    pub function_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FunctionCallResult {
    pub fn success(call: FunctionCall, stdout: impl Into<String>) -> Self {
        Self {
            function_name: call.function_name,
            parameters: call.parameters,
            stdout: Some(stdout.into()),
            error: None,
        }
    }

    pub fn failure(call: FunctionCall, error: impl Into<String>) -> Self {
        Self {
            function_name: call.function_name,
            parameters: call.parameters,
            stdout: None,
            error: Some(error.into()),
        }
    }

    /// A call that has been recorded but has no output yet.
    pub fn pending(call: FunctionCall) -> Self {
        Self {
            function_name: call.function_name,
            parameters: call.parameters,
            stdout: None,
            error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Read a parameter as text. Non-string JSON values are rendered as JSON.
    pub fn param_text(&self, key: &str) -> Option<String> {
        self.parameters.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// ToolStateValue
// ---------------------------------------------------------------------------

/// Per-tool scratch state. Tagged so the stored form says what it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolStateValue {
    Text(String),
    List(Vec<String>),
    Flag(bool),
    Json(serde_json::Value),
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

/// Everything needed to start a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_name: String,
    pub user_id: String,
    pub subtype: String,
    pub user_prompt: String,
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub initial_memory: BTreeMap<String, String>,
    pub hil_budget: f64,
    pub hil_count: u32,
    #[serde(default)]
    pub parent_agent_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AgentConfig {
    pub fn new(
        agent_name: impl Into<String>,
        user_id: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            user_id: user_id.into(),
            subtype: DEFAULT_SUBTYPE.to_string(),
            user_prompt: user_prompt.into(),
            functions: Vec::new(),
            initial_memory: BTreeMap::new(),
            hil_budget: DEFAULT_HIL_BUDGET,
            hil_count: DEFAULT_HIL_COUNT,
            parent_agent_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = subtype.into();
        self
    }

    pub fn with_functions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.functions = names.into_iter().map(Into::into).collect();
        self
    }

    /// Spend ceiling and iteration ceiling between human check-ins. Zero
    /// disables the corresponding gate.
    pub fn with_hil(mut self, budget: f64, count: u32) -> Self {
        self.hil_budget = budget;
        self.hil_count = count;
        self
    }

    pub fn with_parent(mut self, parent_agent_id: Uuid) -> Self {
        self.parent_agent_id = Some(parent_agent_id);
        self
    }

    pub fn with_memory(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.initial_memory.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// AgentContext
// ---------------------------------------------------------------------------

/// Single source of truth for one agent: identity, configuration,
/// conversation state and accounting.
///
/// Collection fields default to empty when absent so older records still
/// load; unknown fields are ignored on read and dropped on the next write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    // -- identity --
    pub agent_id: Uuid,
    pub execution_id: Uuid,
    pub trace_id: String,
    #[serde(default)]
    pub parent_agent_id: Option<Uuid>,
    #[serde(default)]
    pub child_agent_ids: Vec<Uuid>,
    pub user_id: String,
    pub name: String,
    pub subtype: String,

    // -- prompts --
    pub user_prompt: String,
    pub input_prompt: String,

    // -- execution state --
    pub state: AgentState,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub call_stack: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub memory: BTreeMap<String, String>,
    #[serde(default)]
    pub live_files: Vec<String>,
    /// Planned calls not yet run: the rest of a cycle paused by the HIL
    /// gate or by a review request. They run first when the loop resumes.
    #[serde(default)]
    pub invoking: Vec<FunctionCall>,
    /// Name of the call at the head of `invoking` that is waiting for human
    /// review. Resuming from `hitl_tool` counts as approval.
    #[serde(default)]
    pub awaiting_review: Option<String>,
    #[serde(default)]
    pub tool_state: BTreeMap<String, ToolStateValue>,

    // -- accounting --
    #[serde(default)]
    pub cost: f64,
    pub hil_budget: f64,
    pub hil_count: u32,
    #[serde(default)]
    pub iterations_since_hil: u32,
    pub budget_remaining: f64,
    #[serde(default)]
    pub hil_requested: bool,

    // -- history & tooling --
    #[serde(default)]
    pub function_call_history: Vec<FunctionCallResult>,
    #[serde(default)]
    pub functions: Vec<String>,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl AgentContext {
    /// Build a fresh context in state `agent` from a start request.
    pub fn from_config(config: &AgentConfig) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            agent_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            trace_id: new_trace_id(),
            parent_agent_id: config.parent_agent_id,
            child_agent_ids: Vec::new(),
            user_id: config.user_id.clone(),
            name: config.agent_name.clone(),
            subtype: config.subtype.clone(),
            user_prompt: config.user_prompt.clone(),
            input_prompt: Self::wrap_user_request(&config.user_prompt),
            state: AgentState::Agent,
            iterations: 0,
            call_stack: Vec::new(),
            notes: Vec::new(),
            memory: config.initial_memory.clone(),
            live_files: Vec::new(),
            invoking: Vec::new(),
            awaiting_review: None,
            tool_state: BTreeMap::new(),
            cost: 0.0,
            hil_budget: config.hil_budget,
            hil_count: config.hil_count,
            iterations_since_hil: 0,
            budget_remaining: config.hil_budget,
            hil_requested: false,
            function_call_history: Vec::new(),
            functions: config.functions.clone(),
            error: None,
            metadata: config.metadata.clone(),
            created_at: now,
            last_update: now,
        }
    }

    // -- prompt handling --

    /// `<user_request>\n{text}\n</user_request>`
    pub fn wrap_user_request(text: &str) -> String {
        format!("{USER_REQUEST_OPEN}\n{text}\n{USER_REQUEST_CLOSE}")
    }

    /// Extract the raw request from the delimited region of `input_prompt`.
    pub fn extract_user_request(&self) -> Option<&str> {
        let start = self.input_prompt.find(USER_REQUEST_OPEN)? + USER_REQUEST_OPEN.len();
        let len = self.input_prompt[start..].find(USER_REQUEST_CLOSE)?;
        let inner = &self.input_prompt[start..start + len];
        let inner = inner.strip_prefix('\n').unwrap_or(inner);
        Some(inner.strip_suffix('\n').unwrap_or(inner))
    }

    /// Replace the user request inside `input_prompt`, keeping whatever was
    /// appended after it.
    pub fn replace_user_request(&mut self, new_request: &str) {
        let wrapped_old = Self::wrap_user_request(&self.user_prompt);
        let wrapped_new = Self::wrap_user_request(new_request);
        if self.input_prompt.contains(&wrapped_old) {
            self.input_prompt = self.input_prompt.replacen(&wrapped_old, &wrapped_new, 1);
        } else if !self.user_prompt.is_empty() && self.input_prompt.contains(&self.user_prompt) {
            self.input_prompt = self.input_prompt.replacen(&self.user_prompt, new_request, 1);
        } else {
            self.input_prompt = format!("{wrapped_new}{}", self.input_prompt);
        }
        self.user_prompt = new_request.to_string();
    }

    /// Append a tagged block to `input_prompt`.
    pub fn append_to_prompt(&mut self, tag: &str, text: &str) {
        self.input_prompt
            .push_str(&format!("\n\n<{tag}>\n{text}\n</{tag}>"));
    }

    // -- accounting --

    /// Record spend: `cost` goes up and `budget_remaining` down by `delta`.
    pub fn add_cost(&mut self, delta: f64) {
        if delta.is_finite() && delta > 0.0 {
            self.cost += delta;
            self.budget_remaining -= delta;
        }
    }

    /// Open a new HIL window after a human checked in.
    pub fn reset_hil_window(&mut self) {
        self.iterations_since_hil = 0;
        self.budget_remaining = self.hil_budget;
    }

    /// Reset execution-scoped state for a restart out of `completed`.
    /// Identity, ownership, configuration and prompt lineage are kept.
    pub fn reset_for_restart(&mut self) {
        self.execution_id = Uuid::new_v4();
        self.trace_id = new_trace_id();
        self.iterations = 0;
        self.function_call_history.clear();
        self.call_stack.clear();
        self.notes.clear();
        self.memory.clear();
        self.tool_state.clear();
        self.invoking.clear();
        self.awaiting_review = None;
        self.hil_requested = false;
        self.error = None;
        self.reset_hil_window();
    }

    /// New execution identity without touching anything else.
    pub fn regenerate_execution(&mut self) {
        self.execution_id = Uuid::new_v4();
        self.trace_id = new_trace_id();
    }

    // -- history --

    pub fn last_function_call(&self) -> Option<&FunctionCallResult> {
        self.function_call_history.last()
    }

    /// `true` when the last history entry is an unanswered feedback request.
    pub fn has_pending_feedback_request(&self) -> bool {
        self.last_function_call()
            .is_some_and(|call| call.function_name == AGENT_REQUEST_FEEDBACK)
    }

    /// Final result from the most recent `Agent_completed` entry.
    pub fn completion_result(&self) -> Option<String> {
        self.function_call_history
            .iter()
            .rev()
            .find(|call| call.function_name == AGENT_COMPLETED)
            .map(|call| call.param_text(AGENT_COMPLETED_PARAM).unwrap_or_default())
    }

    /// `true` when the agent ended because it was cancelled.
    pub fn was_cancelled(&self) -> bool {
        self.state == AgentState::Completed
            && self
                .last_function_call()
                .is_some_and(|call| call.function_name == AGENT_CANCELLED)
    }

    /// Record a child agent id. Returns `false` when already present.
    pub fn add_child(&mut self, child_id: Uuid) -> bool {
        if self.child_agent_ids.contains(&child_id) {
            return false;
        }
        self.child_agent_ids.push(child_id);
        true
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// AutonomousIteration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationStats {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Ledger entry for one loop cycle, keyed by `(agent_id, iteration)`.
/// `iteration` starts at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomousIteration {
    pub agent_id: Uuid,
    pub iteration: u32,
    pub execution_id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub agent_plan: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub code_review: Option<String>,
    #[serde(default)]
    pub function_calls: Vec<FunctionCallResult>,
    #[serde(default)]
    pub memory: BTreeMap<String, String>,
    #[serde(default)]
    pub tool_state: BTreeMap<String, ToolStateValue>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub stats: IterationStats,
    pub created_at: DateTime<Utc>,
}

impl AutonomousIteration {
    pub fn new(ctx: &AgentContext, iteration: u32, prompt: impl Into<String>) -> Self {
        Self {
            agent_id: ctx.agent_id,
            iteration,
            execution_id: ctx.execution_id,
            prompt: prompt.into(),
            agent_plan: String::new(),
            code: None,
            code_review: None,
            function_calls: Vec::new(),
            memory: BTreeMap::new(),
            tool_state: BTreeMap::new(),
            error: None,
            cost: 0.0,
            stats: IterationStats::default(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
