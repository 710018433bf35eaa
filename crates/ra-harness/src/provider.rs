//! Reasoning-engine abstraction.
//!
//! The iteration loop treats the model call as an opaque capability: given
//! the assembled prompt and the functions on offer, it returns the engine's
//! reasoning, the function calls it wants made, and what the call cost.
//! Prompt templating and model selection live behind [`ReasoningEngine`].
//!
//! [`ScriptedEngine`] replays canned responses and is what the tests and the
//! `ra run` command use.

use std::collections::VecDeque;
use std::time::Duration;

use ra_core::types::FunctionCall;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::functions::FunctionDescriptor;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors surfaced by a reasoning engine. The loop records any of these into
/// the agent's `error` field and moves it to `error`.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Missing credentials, or a scripted engine with nothing left to say.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("rate limited – retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Input for one loop cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub agent_id: Uuid,
    /// The cycle being planned (1-based).
    pub iteration: u32,
    pub system_prompt: String,
    pub prompt: String,
    pub functions: Vec<FunctionDescriptor>,
}

/// What the engine decided for one cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResponse {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
    /// Spend attributed to this call, in the same unit as `hil_budget`.
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl StepResponse {
    pub fn new(reasoning: impl Into<String>) -> Self {
        Self {
            reasoning: reasoning.into(),
            ..Self::default()
        }
    }

    pub fn call(mut self, call: FunctionCall) -> Self {
        self.function_calls.push(call);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Plan the next cycle.
    async fn next_step(&self, request: StepRequest) -> Result<StepResponse, ProviderError>;
}

// ---------------------------------------------------------------------------
// ScriptedEngine
// ---------------------------------------------------------------------------

/// Replays a fixed queue of responses in order and remembers every request
/// it was sent. Once the queue is empty each call fails with
/// [`ProviderError::NotConfigured`].
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Result<StepResponse, ProviderError>>>,
    requests: Mutex<Vec<StepRequest>>,
    delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = StepResponse>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a failure after the responses already scripted.
    pub async fn push_error(&self, err: ProviderError) {
        self.script.lock().await.push_back(Err(err));
    }

    pub async fn push(&self, response: StepResponse) {
        self.script.lock().await.push_back(Ok(response));
    }

    /// Requests received so far, oldest first.
    pub async fn requests(&self) -> Vec<StepRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.script.lock().await.len()
    }
}

#[async_trait::async_trait]
impl ReasoningEngine for ScriptedEngine {
    async fn next_step(&self, request: StepRequest) -> Result<StepResponse, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        tracing::debug!(
            agent_id = %request.agent_id,
            iteration = request.iteration,
            "scripted engine step"
        );
        self.requests.lock().await.push(request);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("script exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(iteration: u32) -> StepRequest {
        StepRequest {
            agent_id: Uuid::new_v4(),
            iteration,
            system_prompt: String::new(),
            prompt: "p".into(),
            functions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_fails() {
        let engine = ScriptedEngine::new([
            StepResponse::new("first").with_cost(0.5),
            StepResponse::new("second"),
        ]);
        assert_eq!(engine.next_step(request(1)).await.unwrap().reasoning, "first");
        assert_eq!(engine.next_step(request(2)).await.unwrap().reasoning, "second");
        let err = engine.next_step(request(3)).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert_eq!(engine.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn pushed_error_is_returned() {
        let engine = ScriptedEngine::new(Vec::new());
        engine.push_error(ProviderError::Timeout).await;
        assert!(matches!(
            engine.next_step(request(1)).await,
            Err(ProviderError::Timeout)
        ));
    }

    #[test]
    fn response_deserializes_with_defaults() {
        let resp: StepResponse = serde_json::from_str(
            r#"{"function_calls":[{"function_name":"Agent_completed","parameters":{"note":"done"}}]}"#,
        )
        .unwrap();
        assert_eq!(resp.function_calls.len(), 1);
        assert_eq!(resp.cost, 0.0);
        assert!(resp.reasoning.is_empty());
    }
}
