//! `paid-orchestrator` CLI entrypoint (spec §6).

use clap::{Parser, Subcommand};
use paid_orchestrator::config::{init_tracing, EngineConfig};
use paid_orchestrator::github::client::{GitHubClient, GithubOperations};
use paid_orchestrator::models::project::Project;
use paid_orchestrator::Engine;

#[derive(Parser)]
#[command(name = "paid-orchestrator", about = "GitHub-driven autonomous coding agent orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the poll workflow for every active project and block forever.
    Serve,
    /// Run one poll tick for a single project, then exit.
    PollOnce {
        #[arg(long)]
        project_id: uuid::Uuid,
    },
    /// Validate the configured GitHub token and exit.
    ValidateToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    init_tracing(&config.telemetry);

    let cli = Cli::parse();
    let github_token = std::env::var("GITHUB_TOKEN").map_err(|_| anyhow::anyhow!("GITHUB_TOKEN must be set"))?;

    match cli.command {
        Command::Serve => {
            let engine = Engine::bootstrap(config, github_token).await?;
            let started = engine.start_all_active_projects().await?;
            tracing::info!(projects = started, "poll workflows started");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown signal received");
        }
        Command::PollOnce { project_id } => {
            let engine = Engine::bootstrap(config, github_token).await?;
            let project = Project::find_by_id(&engine.pool, project_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("project {project_id} not found"))?;
            let summary = engine.poll_workflow.run_once(&project).await?;
            tracing::info!(
                %project_id,
                issues_synced = summary.issues_synced,
                agent_runs_started = summary.agent_runs_started,
                prs_followed_up = summary.prs_followed_up,
                "poll tick complete"
            );
        }
        Command::ValidateToken => {
            let client = GitHubClient::new(github_token)?;
            let valid = client.validate_token().await?;
            if valid {
                println!("token is valid");
            } else {
                println!("token is invalid");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
