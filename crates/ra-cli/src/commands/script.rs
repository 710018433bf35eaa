use std::path::Path;

use anyhow::Context;
use ra_harness::provider::{ScriptedEngine, StepResponse};

/// Read a JSON array of engine steps, e.g.
///
/// ```json
/// [{"reasoning": "done", "function_calls": [
///     {"function_name": "Agent_completed", "parameters": {"note": "hi"}}]}]
/// ```
pub fn load_steps(path: &Path) -> anyhow::Result<Vec<StepResponse>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read script {}", path.display()))?;
    let steps: Vec<StepResponse> = serde_json::from_str(&text)
        .with_context(|| format!("invalid script {}", path.display()))?;
    Ok(steps)
}

pub fn load_engine(path: &Path) -> anyhow::Result<ScriptedEngine> {
    Ok(ScriptedEngine::new(load_steps(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_steps_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"function_calls": [{{"function_name": "Agent_completed", "parameters": {{"note": "hi"}}}}]}}, {{"cost": 0.5}}]"#
        )
        .unwrap();

        let steps = load_steps(file.path()).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].function_calls[0].function_name, "Agent_completed");
        assert_eq!(steps[1].cost, 0.5);
        assert!(steps[1].function_calls.is_empty());
    }

    #[test]
    fn rejects_non_array() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"reasoning": "x"}}"#).unwrap();
        let err = load_steps(file.path()).unwrap_err();
        assert!(err.to_string().contains("invalid script"));
    }
}
