use ra_core::config::Config;
use ra_core::types::AgentContext;
use uuid::Uuid;

use super::{open_store, orchestrator};

/// One line per agent: id, state, iterations, cost, name.
pub fn format_row(ctx: &AgentContext) -> String {
    format!(
        "{}  {:<15} {:>5}  {:>8.3}  {}",
        ctx.agent_id,
        ctx.state.as_str(),
        ctx.iterations,
        ctx.cost,
        ctx.name
    )
}

pub async fn list(config: &Config, user: &str, running: bool) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, open_store(config).await?, None);
    let agents = if running {
        orchestrator.list_running(user).await?
    } else {
        orchestrator.list(user).await?
    };

    if agents.is_empty() {
        println!("No agents for {user}.");
        return Ok(());
    }
    println!("{:<36}  {:<15} {:>5}  {:>8}  NAME", "AGENT", "STATE", "ITER", "COST");
    for ctx in &agents {
        println!("{}", format_row(ctx));
    }
    Ok(())
}

pub async fn show(config: &Config, user: &str, agent_id: Uuid) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, open_store(config).await?, None);
    let ctx = orchestrator.load(user, agent_id).await?;
    println!("{}", serde_json::to_string_pretty(&ctx)?);
    Ok(())
}

pub async fn iterations(config: &Config, user: &str, agent_id: Uuid) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, open_store(config).await?, None);
    let records = orchestrator.iterations(user, agent_id).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
