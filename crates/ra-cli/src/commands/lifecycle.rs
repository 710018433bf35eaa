use std::path::Path;

use ra_agents::orchestrator::{ExecutionHandle, LifecycleOrchestrator};
use ra_core::config::Config;
use ra_core::types::{AgentConfig, AgentContext, AgentState};
use uuid::Uuid;

use super::script::load_engine;
use super::{open_store, orchestrator};

pub struct RunOptions {
    pub name: String,
    pub prompt: String,
    pub budget: Option<f64>,
    pub count: Option<u32>,
}

impl RunOptions {
    pub fn into_agent_config(self, config: &Config, user: &str) -> AgentConfig {
        let defaults = &config.agents;
        AgentConfig::new(self.name, user, self.prompt)
            .with_subtype(defaults.default_subtype.clone())
            .with_hil(
                self.budget.unwrap_or(defaults.default_hil_budget),
                self.count.unwrap_or(defaults.default_hil_count),
            )
    }
}

/// What to tell the operator once an execution has settled.
pub fn summarize(ctx: &AgentContext) -> String {
    let mut out = format!(
        "agent {} is {} after {} iteration(s)\n  execution: {}",
        ctx.agent_id,
        ctx.state.as_str(),
        ctx.iterations,
        ctx.execution_id
    );
    match ctx.state {
        AgentState::Completed if ctx.was_cancelled() => out.push_str("\n  cancelled"),
        AgentState::Completed => {
            if let Some(result) = ctx.completion_result() {
                out.push_str(&format!("\n  result: {result}"));
            }
        }
        AgentState::Error => {
            out.push_str(&format!(
                "\n  error: {}",
                ctx.error.as_deref().unwrap_or("unknown")
            ));
        }
        AgentState::HitlFeedback => {
            if let Some(question) = ctx
                .last_function_call()
                .and_then(|call| call.param_text(ra_core::types::REQUEST_FEEDBACK_PARAM))
            {
                out.push_str(&format!("\n  question: {question}"));
            }
        }
        AgentState::HitlTool => {
            if let Some(name) = &ctx.awaiting_review {
                out.push_str(&format!("\n  awaiting review: {name}"));
            }
        }
        _ => {}
    }
    out
}

async fn settle(
    orchestrator: &LifecycleOrchestrator,
    user: &str,
    handle: ExecutionHandle,
) -> anyhow::Result<()> {
    let agent_id = handle.agent_id;
    let outcome = handle.wait().await?;
    tracing::debug!(%agent_id, ?outcome, "execution settled");
    let ctx = orchestrator.load(user, agent_id).await?;
    println!("{}", summarize(&ctx));
    Ok(())
}

pub async fn run(config: &Config, user: &str, script: &Path, opts: RunOptions) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, open_store(config).await?, Some(load_engine(script)?));
    let handle = orchestrator.start(opts.into_agent_config(config, user)).await?;
    settle(&orchestrator, user, handle).await
}

pub async fn resume(
    config: &Config,
    user: &str,
    script: &Path,
    agent_id: Uuid,
    execution_id: Uuid,
    feedback: Option<String>,
) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, open_store(config).await?, Some(load_engine(script)?));
    let ctx = orchestrator.load(user, agent_id).await?;
    let feedback_text = feedback.as_deref().unwrap_or("");
    let handle = match ctx.state {
        AgentState::Error => {
            orchestrator
                .resume_after_error(user, agent_id, execution_id, feedback_text)
                .await?
        }
        AgentState::Completed => {
            orchestrator
                .resume_completed(user, agent_id, execution_id, feedback_text)
                .await?
        }
        _ => {
            orchestrator
                .resume_hil(user, agent_id, execution_id, feedback.as_deref())
                .await?
        }
    };
    settle(&orchestrator, user, handle).await
}

pub async fn feedback(
    config: &Config,
    user: &str,
    script: &Path,
    agent_id: Uuid,
    execution_id: Uuid,
    answer: &str,
) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, open_store(config).await?, Some(load_engine(script)?));
    let handle = orchestrator
        .provide_feedback(user, agent_id, execution_id, answer)
        .await?;
    settle(&orchestrator, user, handle).await
}

pub async fn cancel(
    config: &Config,
    user: &str,
    agent_id: Uuid,
    execution_id: Uuid,
    feedback: &str,
) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, open_store(config).await?, None);
    let ctx = orchestrator.cancel(user, agent_id, execution_id, feedback).await?;
    println!("{}", summarize(&ctx));
    Ok(())
}

pub async fn pause(config: &Config, user: &str, agent_id: Uuid) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, open_store(config).await?, None);
    orchestrator.request_hil(user, agent_id).await?;
    println!("Pause requested for agent {agent_id}.");
    Ok(())
}

pub async fn delete(config: &Config, user: &str, agent_ids: &[Uuid]) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, open_store(config).await?, None);
    let deleted = orchestrator.delete(user, agent_ids).await?;
    println!("Deleted {} agent(s).", deleted.len());
    for id in deleted {
        println!("  {id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ra_core::types::{FunctionCall, FunctionCallResult};
    use ra_harness::provider::{ScriptedEngine, StepResponse};

    fn temp_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.store.path = dir.path().join("agents.db").display().to_string();
        config
    }

    #[test]
    fn options_fall_back_to_configured_defaults() {
        let mut config = Config::default();
        config.agents.default_hil_budget = 7.0;
        let opts = RunOptions {
            name: "n".into(),
            prompt: "p".into(),
            budget: None,
            count: Some(3),
        };
        let agent = opts.into_agent_config(&config, "carol");
        assert_eq!(agent.hil_budget, 7.0);
        assert_eq!(agent.hil_count, 3);
        assert_eq!(agent.user_id, "carol");
    }

    #[test]
    fn summary_mentions_question_and_result() {
        let mut ctx = AgentContext::from_config(&AgentConfig::new("a", "u", "x"));
        ctx.state = AgentState::HitlFeedback;
        ctx.function_call_history
            .push(FunctionCallResult::pending(FunctionCall::request_feedback("which port?")));
        assert!(summarize(&ctx).contains("question: which port?"));

        ctx.state = AgentState::Completed;
        ctx.function_call_history
            .push(FunctionCallResult::success(FunctionCall::completed("8080"), ""));
        let summary = summarize(&ctx);
        assert!(summary.contains("is completed"));
        assert!(summary.contains("result: 8080"));
    }

    #[tokio::test]
    async fn run_then_feedback_against_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(&dir);

        let engine = ScriptedEngine::new(vec![
            StepResponse::new("ask").call(FunctionCall::request_feedback("which port?")),
            StepResponse::new("done").call(FunctionCall::completed("using 8080")),
        ]);
        let store = open_store(&config).await.unwrap();
        let orch = orchestrator(&config, store, Some(engine));
        let opts = RunOptions {
            name: "porter".into(),
            prompt: "pick a port".into(),
            budget: Some(0.0),
            count: Some(0),
        };
        let handle = orch.start(opts.into_agent_config(&config, "dave")).await.unwrap();
        let agent_id = handle.agent_id;
        handle.wait().await.unwrap();

        let paused = orch.load("dave", agent_id).await.unwrap();
        assert_eq!(paused.state, AgentState::HitlFeedback);

        let handle = orch
            .provide_feedback("dave", agent_id, paused.execution_id, "8080")
            .await
            .unwrap();
        handle.wait().await.unwrap();

        // a fresh process sees the same record
        let reopened = orchestrator(&config, open_store(&config).await.unwrap(), None);
        let done = reopened.load("dave", agent_id).await.unwrap();
        assert_eq!(done.completion_result().as_deref(), Some("using 8080"));
        assert_eq!(reopened.list("dave").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commands_only_reach_the_callers_agents() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(&dir);

        let engine = ScriptedEngine::new(vec![
            StepResponse::new("ask").call(FunctionCall::request_feedback("which port?")),
        ]);
        let orch = orchestrator(&config, open_store(&config).await.unwrap(), Some(engine));
        let opts = RunOptions {
            name: "porter".into(),
            prompt: "pick a port".into(),
            budget: Some(0.0),
            count: Some(0),
        };
        let handle = orch.start(opts.into_agent_config(&config, "dave")).await.unwrap();
        let agent_id = handle.agent_id;
        handle.wait().await.unwrap();
        let paused = orch.load("dave", agent_id).await.unwrap();

        assert!(crate::commands::inspect::show(&config, "erin", agent_id)
            .await
            .is_err());
        assert!(cancel(&config, "erin", agent_id, paused.execution_id, "mine now")
            .await
            .is_err());
        assert!(pause(&config, "erin", agent_id).await.is_err());

        let after = orch.load("dave", agent_id).await.unwrap();
        assert_eq!(after.state, AgentState::HitlFeedback);
        assert!(!after.was_cancelled());
        assert!(!after.hil_requested);
    }
}
