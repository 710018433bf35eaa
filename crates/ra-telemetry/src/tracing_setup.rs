use uuid::Uuid;

/// Generate a trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Span wrapping one execution of an agent. Every event logged inside it
/// carries the ids needed to correlate a log line with a stored record.
pub fn execution_span(agent_id: &Uuid, execution_id: &Uuid, trace_id: &str) -> tracing::Span {
    tracing::info_span!(
        "agent_execution",
        agent_id = %agent_id,
        execution_id = %execution_id,
        trace_id = %trace_id,
        span_id = %generate_span_id(),
    )
}

/// Span for a single lifecycle operation (start, resume, cancel, ...).
pub fn lifecycle_span(operation: &str, agent_id: &Uuid) -> tracing::Span {
    tracing::info_span!(
        "agent_lifecycle",
        operation = %operation,
        agent_id = %agent_id,
    )
}
