//! PAID orchestration engine: polls GitHub for actionable issues/PRs and drives a
//! containerized coding agent through clone -> implement -> push -> open/update PR.

pub mod config;
pub mod container;
pub mod error;
pub mod git;
pub mod github;
pub mod models;
pub mod poll;
pub mod prompt;
pub mod scanner;
pub mod tokens;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::container::{AgentSandbox, DockerSandbox, NetworkPolicy};
use crate::error::WorkflowError;
use crate::git::InContainerGit;
use crate::github::client::{GitHubClient, GithubOperations};
use crate::models::agent_run::{AgentRun, AgentRunStatus, AgentType};
use crate::models::issue::Issue;
use crate::models::project::Project;
use crate::poll::{AgentRunSpawner, GitHubPollWorkflow, ProjectWorkflowManager};
use crate::workflow::engine::{LocalEngine, TokioActivityRetry};
use crate::workflow::{AgentExecutionWorkflow, ContainerAuthContext};

/// Everything wired together at process startup: one database pool, one GitHub client
/// per token (here simplified to one shared client), the container sandbox, and the
/// poll manager that owns one background loop per active project.
pub struct Engine {
    pub pool: sqlx::PgPool,
    pub config: Arc<EngineConfig>,
    pub manager: Arc<ProjectWorkflowManager>,
    pub poll_workflow: Arc<GitHubPollWorkflow>,
}

impl Engine {
    pub async fn bootstrap(config: EngineConfig, github_token: String) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await?;

        let config = Arc::new(config);
        let github: Arc<dyn GithubOperations> = Arc::new(GitHubClient::new(github_token)?);
        let sandbox: Arc<dyn AgentSandbox> =
            Arc::new(DockerSandbox::connect(config.container.clone(), config.network.clone())?);

        let agent_execution = Arc::new(AgentExecutionWorkflow::new(pool.clone(), sandbox.clone(), github.clone(), TokioActivityRetry));
        let network_policy = NetworkPolicy::new(config.network.clone());

        let spawner: Arc<dyn AgentRunSpawner> = Arc::new(DefaultAgentRunSpawner {
            pool: pool.clone(),
            config: config.clone(),
            agent_execution,
            github: github.clone(),
            sandbox,
            network_policy,
            engine: LocalEngine::new(),
        });

        let poll_workflow = Arc::new(GitHubPollWorkflow::new(pool.clone(), github, spawner));
        let manager = Arc::new(ProjectWorkflowManager::new(poll_workflow.clone()));

        Ok(Self { pool, config, manager, poll_workflow })
    }

    /// Starts the poll loop for every currently active project (spec §6: process
    /// startup reconciles with the database rather than relying on durable replay).
    pub async fn start_all_active_projects(&self) -> anyhow::Result<usize> {
        let projects = Project::active_projects(&self.pool).await?;
        let count = projects.len();
        for project in projects {
            self.manager.start_polling(project).await;
        }
        Ok(count)
    }
}

/// Drives the full C7 activity pipeline for one `AgentRun` in a background task,
/// spawned by the poll loop (spec §4.8) with workflow id `agent-exec-<run_id>`.
struct DefaultAgentRunSpawner {
    pool: sqlx::PgPool,
    config: Arc<EngineConfig>,
    agent_execution: Arc<AgentExecutionWorkflow<TokioActivityRetry>>,
    github: Arc<dyn GithubOperations>,
    sandbox: Arc<dyn AgentSandbox>,
    network_policy: NetworkPolicy,
    engine: Arc<LocalEngine>,
}

#[async_trait::async_trait]
impl AgentRunSpawner for DefaultAgentRunSpawner {
    async fn spawn_for_issue(&self, project: &Project, issue: &Issue) -> Result<(), WorkflowError> {
        let run = self
            .agent_execution
            .create_agent_run(project, Some(issue), AgentType::ClaudeCode, None, None)
            .await?;
        self.spawn(project.clone(), Some(issue.clone()), run).await;
        Ok(())
    }

    async fn spawn_for_pr(&self, project: &Project, issue_id: Uuid, pr_number: i64) -> Result<(), WorkflowError> {
        let issue = sqlx::query_as::<_, Issue>(
            r#"SELECT id, project_id, github_issue_id, github_number, title, body,
                      labels, github_state, is_pull_request, github_creator_login,
                      paid_state, pr_followup_count
               FROM issues WHERE id = $1"#,
        )
        .bind(issue_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(WorkflowError::Database)?;

        let run = self
            .agent_execution
            .create_agent_run(project, issue.as_ref(), AgentType::ClaudeCode, None, Some(pr_number))
            .await?;
        Issue::increment_followup_count(&self.pool, issue_id)
            .await
            .map_err(WorkflowError::Database)?;
        self.spawn(project.clone(), issue, run).await;
        Ok(())
    }
}

impl DefaultAgentRunSpawner {
    async fn spawn(&self, project: Project, issue: Option<Issue>, run: AgentRun) {
        let workflow_id = format!("agent-exec-{}", run.id);
        let agent_execution = self.agent_execution.clone();
        let github = self.github.clone();
        let sandbox = self.sandbox.clone();
        let network_policy = self.network_policy.clone();
        let auth = ContainerAuthContext {
            proxy_host: self.config.proxy.host.clone(),
            proxy_port: self.config.proxy.port,
            subscription_mode: self.config.container.subscription_mode(),
        };
        let exec_timeout = self.config.container.default_exec_timeout;

        let pool = self.pool.clone();
        self.engine
            .spawn_child(&workflow_id, async move {
                if let Err(err) = run_pipeline(pool, agent_execution, github, sandbox, network_policy, auth, exec_timeout, project, issue, run).await {
                    tracing::error!(error = %err, %workflow_id, "agent execution pipeline failed");
                }
            })
            .await;
    }
}

/// The full clone -> implement -> push -> open/update-PR pipeline (spec §4.7). Runs to
/// completion inside one background task; every terminal transition is applied exactly
/// once via `AgentRun::transition_status`'s idempotent guard.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    pool: sqlx::PgPool,
    agent_execution: Arc<AgentExecutionWorkflow<TokioActivityRetry>>,
    github: Arc<dyn GithubOperations>,
    sandbox: Arc<dyn AgentSandbox>,
    network_policy: NetworkPolicy,
    auth: ContainerAuthContext,
    exec_timeout: Duration,
    project: Project,
    issue: Option<Issue>,
    run: AgentRun,
) -> Result<(), WorkflowError> {
    run.transition_status(&pool, AgentRunStatus::Running, None).await?;

    let firewall_script = if auth.subscription_mode {
        None
    } else {
        let github_cidrs = network_policy.resolved_github_cidrs().await;
        match container::build_firewall_script(&auth.proxy_host, auth.proxy_port, &github_cidrs) {
            Ok(script) => Some(script),
            Err(err) => {
                tracing::warn!(error = %err, "firewall script build failed, provisioning without egress policy");
                None
            }
        }
    };

    let handle = match agent_execution.provision_container(&run, firewall_script.as_deref(), &auth).await {
        Ok(h) => h,
        Err(err) => {
            agent_execution.mark_failed(&run, &err.to_string()).await?;
            return Err(err);
        }
    };

    let git = InContainerGit::new(sandbox.clone());
    let outcome: Result<(), WorkflowError> = async {
        let branch_name = agent_execution.clone_repo(&run, &project, issue.as_ref(), &git, &handle).await?;

        let pr_prompt = if run.is_pr_followup() {
            Some(agent_execution.rebase_and_prepare_pr_prompt(&run, &project, issue.as_ref(), &git, &handle).await?)
        } else {
            None
        };

        let mut pr_run = run.clone();
        if let Some(prompt) = pr_prompt {
            pr_run.custom_prompt = Some(prompt);
        }

        let (agent_succeeded, has_changes) = agent_execution
            .run_agent(&pr_run, issue.as_ref(), &project, &git, &handle, &[], Some(exec_timeout))
            .await?;

        if !agent_succeeded {
            return Err(WorkflowError::RetriesExhausted("agent harness exited non-zero".to_string()));
        }
        if !has_changes {
            tracing::info!(run_id = %run.id, "agent produced no changes, nothing to push");
            return Ok(());
        }

        agent_execution.push_branch(&run, &git, &handle, &branch_name).await?;

        if run.is_pr_followup() {
            let pr_number = run.source_pull_request_number.expect("is_pr_followup guarantees Some");
            let review_threads = github
                .review_threads(&project.owner, &project.repo, pr_number)
                .await
                .unwrap_or_default();
            agent_execution.resolve_review_threads_and_complete(&project, pr_number, &review_threads).await?;
            agent_execution.mark_complete(&run, None).await?;
        } else if let Some(issue) = &issue {
            let pr_url = agent_execution.create_pull_request_for_issue(&project, issue, &branch_name).await?;
            agent_execution.mark_complete(&run, Some(&pr_url)).await?;
        } else {
            agent_execution.mark_complete(&run, None).await?;
        }

        Ok(())
    }
    .await;

    agent_execution.cleanup(&run, Some(&handle)).await?;

    if let Err(err) = &outcome {
        agent_execution.mark_failed(&run, &err.to_string()).await?;
    }
    outcome
}
