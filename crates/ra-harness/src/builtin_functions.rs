use ra_core::types::{
    AGENT_CANCELLED, AGENT_COMPLETED, AGENT_COMPLETED_PARAM, AGENT_REQUEST_FEEDBACK,
    REQUEST_FEEDBACK_PARAM, SUPERVISOR_RESUMED,
};
use serde_json::json;

use crate::functions::FunctionDescriptor;

// ---------------------------------------------------------------------------
// Built-in sentinel functions
//
// Offered to every agent. The loop handles these itself: they change the
// agent's state instead of running a tool.
// ---------------------------------------------------------------------------

/// Sentinel functions the engine may call.
pub fn builtin_function_definitions() -> Vec<FunctionDescriptor> {
    vec![agent_completed(), agent_request_feedback()]
}

/// `true` for every sentinel name, including the ones only the orchestrator
/// writes into the history.
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        AGENT_COMPLETED | AGENT_REQUEST_FEEDBACK | AGENT_CANCELLED | SUPERVISOR_RESUMED
    )
}

fn agent_completed() -> FunctionDescriptor {
    FunctionDescriptor {
        name: AGENT_COMPLETED.to_string(),
        description: "Finish the task. Call this once the user request is fully handled."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                AGENT_COMPLETED_PARAM: {
                    "type": "string",
                    "description": "The final result to report back to the user"
                }
            },
            "required": [AGENT_COMPLETED_PARAM]
        }),
        requires_review: false,
    }
}

fn agent_request_feedback() -> FunctionDescriptor {
    FunctionDescriptor {
        name: AGENT_REQUEST_FEEDBACK.to_string(),
        description: "Ask the user a question and pause until they answer.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                REQUEST_FEEDBACK_PARAM: {
                    "type": "string",
                    "description": "The question or the decision needed from the user"
                }
            },
            "required": [REQUEST_FEEDBACK_PARAM]
        }),
        requires_review: false,
    }
}
