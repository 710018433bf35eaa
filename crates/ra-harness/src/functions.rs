use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::builtin_functions::{builtin_function_definitions, is_builtin};

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// What the reasoning engine is told about a callable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the parameters object.
    pub parameters: Value,
    /// Ask a human before the first invocation of each planned call.
    #[serde(default)]
    pub requires_review: bool,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),

    /// The call must not proceed until a human has reviewed it.
    #[error("review required: {reason}")]
    ReviewRequired { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("function already registered: {0}")]
    Duplicate(String),

    #[error("function name is reserved: {0}")]
    Reserved(String),
}

// ---------------------------------------------------------------------------
// AgentFunction
// ---------------------------------------------------------------------------

/// A named capability the loop can invoke on the engine's behalf.
#[async_trait::async_trait]
pub trait AgentFunction: Send + Sync {
    fn descriptor(&self) -> FunctionDescriptor;

    /// Run the function. `review_approved` is `true` when a human already
    /// approved this exact call after a review pause.
    async fn invoke(
        &self,
        params: &BTreeMap<String, Value>,
        review_approved: bool,
    ) -> Result<String, FunctionError>;
}

/// Read a required string parameter.
pub fn required_str<'a>(
    params: &'a BTreeMap<String, Value>,
    key: &str,
) -> Result<&'a str, FunctionError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| FunctionError::InvalidParams(format!("missing string parameter `{key}`")))
}

// ---------------------------------------------------------------------------
// FunctionRegistry
// ---------------------------------------------------------------------------

/// Explicit name → function table, filled by `register` calls at startup.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Arc<dyn AgentFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function. Names are unique and the sentinel names are reserved.
    pub fn register(&mut self, function: Arc<dyn AgentFunction>) -> Result<(), RegistryError> {
        let name = function.descriptor().name;
        if is_builtin(&name) {
            return Err(RegistryError::Reserved(name));
        }
        if self.functions.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!(function = %name, "registered function");
        self.functions.insert(name, function);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentFunction>> {
        self.functions.get(name).cloned()
    }

    /// Registered names in sorted order. Sentinels are not included.
    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Descriptors offered to the engine for an agent: the built-in sentinels
    /// first, then every enabled name that is registered. Unknown names are
    /// skipped.
    pub fn descriptors_for(&self, enabled: &[String]) -> Vec<FunctionDescriptor> {
        let mut out = builtin_function_definitions();
        out.extend(
            enabled
                .iter()
                .filter_map(|name| self.functions.get(name))
                .map(|f| f.descriptor()),
        );
        out
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
