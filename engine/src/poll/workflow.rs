//! GitHubPollWorkflow (C8, spec §4.8): one loop body per active Project, run forever
//! with a deterministic sleep between ticks.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{GitHubError, WorkflowError};
use crate::github::client::GithubOperations;
use crate::models::issue::{Issue, PaidState};
use crate::models::project::Project;
use crate::scanner::{evaluate_triggers, fetch_issues, is_eligible, PrScanInput};
use crate::workflow::engine::WorkflowEngine;

pub fn workflow_id_for(project_id: Uuid) -> String {
    format!("github-poll-{project_id}")
}

/// Abstraction the poll loop spawns work through, so it doesn't need to know how to
/// construct a full `AgentExecutionWorkflow` (that requires container/git wiring that
/// belongs to the process entrypoint).
#[async_trait]
pub trait AgentRunSpawner: Send + Sync {
    async fn spawn_for_issue(&self, project: &Project, issue: &Issue) -> Result<(), WorkflowError>;
    async fn spawn_for_pr(&self, project: &Project, issue_id: Uuid, pr_number: i64) -> Result<(), WorkflowError>;
}

#[derive(Debug, Default, Clone)]
pub struct PollTickSummary {
    pub issues_synced: usize,
    pub agent_runs_started: usize,
    pub prs_followed_up: usize,
}

pub struct GitHubPollWorkflow {
    pool: sqlx::PgPool,
    github: Arc<dyn GithubOperations>,
    spawner: Arc<dyn AgentRunSpawner>,
}

impl GitHubPollWorkflow {
    pub fn new(pool: sqlx::PgPool, github: Arc<dyn GithubOperations>, spawner: Arc<dyn AgentRunSpawner>) -> Self {
        Self { pool, github, spawner }
    }

    /// One iteration of the poll loop (spec §4.8). Returns a summary for logging/tests.
    #[tracing::instrument(skip(self), fields(project_id = %project.id))]
    pub async fn run_once(&self, project: &Project) -> Result<PollTickSummary, WorkflowError> {
        let mut summary = PollTickSummary::default();

        let fetched = match fetch_issues(&self.pool, self.github.as_ref(), project).await {
            Ok(summaries) => summaries,
            Err(GitHubError::RateLimit(reset_at)) => {
                tracing::warn!(%reset_at, "rate limited while fetching issues, will retry next tick");
                return Ok(summary);
            }
            Err(other) => return Err(WorkflowError::GitHub(other)),
        };
        summary.issues_synced = fetched.len();

        for item in fetched.into_iter().filter(|i| !i.is_pull_request) {
            if !item.trusted {
                tracing::warn!(number = item.github_number, "untrusted issue, skipping agent scheduling");
                continue;
            }

            let issue = sqlx::query_as::<_, Issue>(
                r#"SELECT id, project_id, github_issue_id, github_number, title, body,
                          labels, github_state, is_pull_request, github_creator_login,
                          paid_state, pr_followup_count
                   FROM issues WHERE project_id = $1 AND github_number = $2"#,
            )
            .bind(project.id)
            .bind(item.github_number)
            .fetch_optional(&self.pool)
            .await
            .map_err(WorkflowError::Database)?;

            let Some(issue) = issue else { continue };
            if issue.paid_state != PaidState::New {
                continue;
            }
            let has_trigger_label = project
                .label_mappings
                .values()
                .any(|label| issue.labels.contains(label));
            if !has_trigger_label {
                continue;
            }

            self.spawner.spawn_for_issue(project, &issue).await?;
            summary.agent_runs_started += 1;
        }

        if project.auto_scan_prs {
            summary.prs_followed_up += self.scan_prs(project).await?;
        }

        Ok(summary)
    }

    async fn scan_prs(&self, project: &Project) -> Result<usize, WorkflowError> {
        let prs = sqlx::query_as::<_, Issue>(
            r#"SELECT id, project_id, github_issue_id, github_number, title, body,
                      labels, github_state, is_pull_request, github_creator_login,
                      paid_state, pr_followup_count
               FROM issues
               WHERE project_id = $1 AND is_pull_request = true AND github_state = 'open'
                 AND labels ? $2"#,
        )
        .bind(project.id)
        .bind(Project::ACTIONABLE_PR_LABEL)
        .fetch_all(&self.pool)
        .await
        .map_err(WorkflowError::Database)?;

        let mut started = 0;
        for issue in prs {
            let active_run: Option<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM agent_runs WHERE issue_id = $1 AND status IN ('pending', 'running')",
            )
            .bind(issue.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(WorkflowError::Database)?;

            let scan_input = PrScanInput {
                issue_id: issue.id,
                pr: &crate::github::client::PullRequestInfo {
                    number: issue.github_number,
                    title: issue.title.clone(),
                    head_ref: String::new(),
                    base_ref: project.default_branch.clone(),
                    head_sha: String::new(),
                    merge_conflict: false,
                    labels: issue.labels.iter().cloned().collect(),
                },
                last_completed_at: None,
                pr_followup_count: issue.pr_followup_count,
                has_active_run: active_run.is_some(),
            };
            if !is_eligible(&scan_input, project) {
                continue;
            }

            let pr = match self.github.pull_request(&project.owner, &project.repo, issue.github_number).await {
                Ok(pr) => pr,
                Err(err) => {
                    tracing::warn!(error = %err, number = issue.github_number, "failed to fetch PR while scanning");
                    continue;
                }
            };
            let check_runs = self
                .github
                .check_runs_for_ref(&project.owner, &project.repo, &pr.head_sha)
                .await
                .unwrap_or_default();
            let review_threads = self
                .github
                .review_threads(&project.owner, &project.repo, issue.github_number)
                .await
                .unwrap_or_default();
            let reviews = self
                .github
                .pull_request_reviews(&project.owner, &project.repo, issue.github_number)
                .await
                .unwrap_or_default();
            let comments = self
                .github
                .issue_comments(&project.owner, &project.repo, issue.github_number)
                .await
                .unwrap_or_default();

            let triggers = evaluate_triggers(
                project,
                &pr,
                &check_runs,
                &review_threads,
                &comments,
                |_| chrono::Utc::now(),
                &reviews,
                None,
            );

            if triggers.any() {
                self.spawner.spawn_for_pr(project, issue.id, issue.github_number).await?;
                started += 1;
                if triggers.actionable_labels {
                    for label in &project.pr_action_labels {
                        let _ = self
                            .github
                            .remove_label_from_issue(&project.owner, &project.repo, issue.github_number, label)
                            .await;
                    }
                }
            }
        }
        Ok(started)
    }

    /// Runs `run_once` forever, sleeping `project.poll_interval_seconds` between ticks,
    /// until the engine reports cancellation or the project disappears.
    ///
    /// Generic over `E` rather than `&dyn WorkflowEngine`: `WorkflowEngine::spawn_child`
    /// takes a generic future parameter, so the trait is not object-safe.
    pub async fn run_forever<E: WorkflowEngine>(&self, engine: &E, mut project: Project) -> Result<(), WorkflowError> {
        loop {
            if engine.is_cancelled() {
                return Ok(());
            }

            let refreshed = Project::find_by_id(&self.pool, project.id)
                .await
                .map_err(WorkflowError::Database)?;
            let Some(refreshed) = refreshed else {
                tracing::info!(project_id = %project.id, "project no longer exists, terminating poll workflow");
                return Ok(());
            };
            project = refreshed;

            if let Err(err) = self.run_once(&project).await {
                tracing::error!(error = %err, project_id = %project.id, "poll tick failed");
            }

            engine
                .sleep(std::time::Duration::from_secs(project.poll_interval_seconds.max(Project::MIN_POLL_INTERVAL_SECONDS) as u64))
                .await;
        }
    }
}
