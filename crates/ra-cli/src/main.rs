mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ra_core::config::{Config, LogFormat};
use uuid::Uuid;

/// reagent CLI -- inspect and drive resumable autonomous agents.
#[derive(Parser)]
#[command(name = "ra", version, about)]
struct Cli {
    /// Config file (default: ~/.reagent/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Act as this user (default: $USER).
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List agents, most recently updated first.
    List {
        /// Hide completed and failed agents.
        #[arg(long)]
        running: bool,
    },

    /// Print an agent's full context as JSON.
    Show { agent_id: Uuid },

    /// Print an agent's iteration records as JSON.
    Iterations { agent_id: Uuid },

    /// Start an agent driven by a scripted engine and wait for it to settle.
    Run {
        /// The user request.
        prompt: String,
        /// JSON array of engine steps to replay.
        #[arg(long)]
        script: PathBuf,
        #[arg(long, default_value = "agent")]
        name: String,
        /// Spend ceiling between human check-ins (0 disables).
        #[arg(long)]
        budget: Option<f64>,
        /// Iteration ceiling between human check-ins (0 disables).
        #[arg(long)]
        count: Option<u32>,
    },

    /// Resume an agent paused for human input.
    Resume {
        agent_id: Uuid,
        execution_id: Uuid,
        #[arg(long)]
        script: PathBuf,
        #[arg(short, long)]
        feedback: Option<String>,
    },

    /// Answer an agent's pending question.
    Feedback {
        agent_id: Uuid,
        execution_id: Uuid,
        answer: String,
        #[arg(long)]
        script: PathBuf,
    },

    /// Cancel an agent.
    Cancel {
        agent_id: Uuid,
        execution_id: Uuid,
        #[arg(short, long, default_value = "")]
        feedback: String,
    },

    /// Ask a running agent to pause at the end of its current cycle.
    Pause { agent_id: Uuid },

    /// Delete agents and everything under them.
    Delete {
        #[arg(required = true)]
        agent_ids: Vec<Uuid>,
    },

    /// Print the effective configuration as TOML.
    Config,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match config.general.log_format {
        LogFormat::Pretty => ra_telemetry::logging::init_logging("ra", &config.general.log_level),
        LogFormat::Json => {
            ra_telemetry::logging::init_logging_json("ra", &config.general.log_level)
        }
    }

    let user = cli
        .user
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "local".to_string());

    match cli.command {
        Commands::List { running } => commands::inspect::list(&config, &user, running).await?,
        Commands::Show { agent_id } => {
            commands::inspect::show(&config, &user, agent_id).await?
        }
        Commands::Iterations { agent_id } => {
            commands::inspect::iterations(&config, &user, agent_id).await?
        }
        Commands::Run {
            prompt,
            script,
            name,
            budget,
            count,
        } => {
            let opts = commands::lifecycle::RunOptions {
                name,
                prompt,
                budget,
                count,
            };
            commands::lifecycle::run(&config, &user, &script, opts).await?
        }
        Commands::Resume {
            agent_id,
            execution_id,
            script,
            feedback,
        } => {
            commands::lifecycle::resume(&config, &user, &script, agent_id, execution_id, feedback)
                .await?
        }
        Commands::Feedback {
            agent_id,
            execution_id,
            answer,
            script,
        } => {
            commands::lifecycle::feedback(&config, &user, &script, agent_id, execution_id, &answer)
                .await?
        }
        Commands::Cancel {
            agent_id,
            execution_id,
            feedback,
        } => {
            commands::lifecycle::cancel(&config, &user, agent_id, execution_id, &feedback).await?
        }
        Commands::Pause { agent_id } => {
            commands::lifecycle::pause(&config, &user, agent_id).await?
        }
        Commands::Delete { agent_ids } => {
            commands::lifecycle::delete(&config, &user, &agent_ids).await?
        }
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let id = Uuid::new_v4();
        let id_arg = id.to_string();
        let cli = Cli::try_parse_from(["ra", "show", id_arg.as_str(), "--user", "bob"]).unwrap();
        assert_eq!(cli.user.as_deref(), Some("bob"));
        assert!(matches!(cli.command, Commands::Show { agent_id } if agent_id == id));
    }

    #[test]
    fn run_requires_script() {
        assert!(Cli::try_parse_from(["ra", "run", "do things"]).is_err());
        let cli =
            Cli::try_parse_from(["ra", "run", "do things", "--script", "s.json", "--budget", "2.5"])
                .unwrap();
        match cli.command {
            Commands::Run { budget, count, .. } => {
                assert_eq!(budget, Some(2.5));
                assert_eq!(count, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn delete_needs_ids_and_rejects_garbage() {
        assert!(Cli::try_parse_from(["ra", "delete"]).is_err());
        assert!(Cli::try_parse_from(["ra", "delete", "not-a-uuid"]).is_err());
    }
}
