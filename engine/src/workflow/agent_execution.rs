//! Agent Execution Workflow (C7, spec §4.7): the activity pipeline that turns one
//! `AgentRun` into a pushed branch and, for new-issue runs, an opened pull request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::container::{AgentSandbox, SandboxHandle};
use crate::error::WorkflowError;
use crate::git::InContainerGit;
use crate::github::client::GithubOperations;
use crate::models::agent_run::{AgentRun, AgentRunStatus, AgentType};
use crate::models::agent_run_log::{AgentRunLog, LogType};
use crate::models::issue::{Issue, PaidState};
use crate::models::project::Project;
use crate::models::prompt::PromptVersion;
use crate::models::worktree::{ClaimOutcome, Worktree};
use crate::prompt::{build_issue_prompt, build_pr_follow_up_prompt, CodebaseChunk, PrFollowUpInput};
use crate::workflow::engine::{ActivityRetry, RetryPolicy};

const ISSUE_PROMPT_SLUG: &str = "coding.issue_implementation";

/// Maps `AgentType` to the CLI provider name the container harness expects
/// (spec §4.7 step 5). `Api` has no mapped provider and is rejected as unsupported.
fn provider_for(agent_type: AgentType) -> Result<&'static str, WorkflowError> {
    Ok(match agent_type {
        AgentType::ClaudeCode => "claude",
        AgentType::Cursor => "cursor",
        AgentType::Codex => "codex",
        AgentType::Copilot => "github_copilot",
        AgentType::Aider => "aider",
        AgentType::Gemini => "gemini",
        AgentType::Opencode => "opencode",
        AgentType::Kilocode => "kilocode",
        AgentType::Api => {
            return Err(WorkflowError::UnsupportedAgentType("api".to_string()));
        }
    })
}

pub struct RunOutcome {
    pub agent_run_id: Uuid,
    pub status: AgentRunStatus,
    pub pull_request_url: Option<String>,
}

/// Per-run container authentication wiring (spec §4.1 authentication modes). Built
/// before `provision_container` so the proxy token reaches the container's environment
/// at creation time rather than only being persisted afterward.
#[derive(Debug, Clone)]
pub struct ContainerAuthContext {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub subscription_mode: bool,
}

impl ContainerAuthContext {
    fn container_env(&self, run_id: &str, proxy_token: &str) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("X-AGENT-RUN-ID".to_string(), run_id.to_string());
        env.insert("X-PROXY-TOKEN".to_string(), proxy_token.to_string());
        if !self.subscription_mode {
            let base_url = format!("http://{}:{}", self.proxy_host, self.proxy_port);
            env.insert("ANTHROPIC_BASE_URL".to_string(), base_url.clone());
            env.insert("OPENAI_BASE_URL".to_string(), base_url);
        }
        env
    }
}

pub struct AgentExecutionWorkflow<R: ActivityRetry> {
    pool: sqlx::PgPool,
    sandbox: Arc<dyn AgentSandbox>,
    github: Arc<dyn GithubOperations>,
    retry: R,
}

impl<R: ActivityRetry> AgentExecutionWorkflow<R> {
    pub fn new(pool: sqlx::PgPool, sandbox: Arc<dyn AgentSandbox>, github: Arc<dyn GithubOperations>, retry: R) -> Self {
        Self {
            pool,
            sandbox,
            github,
            retry,
        }
    }

    /// Step 1: `CreateAgentRun`.
    #[tracing::instrument(skip(self, custom_prompt))]
    pub async fn create_agent_run(
        &self,
        project: &Project,
        issue: Option<&Issue>,
        agent_type: AgentType,
        custom_prompt: Option<String>,
        source_pull_request_number: Option<i64>,
    ) -> Result<AgentRun, WorkflowError> {
        let resolved_prompt = if let (Some(issue), None) = (issue, &custom_prompt) {
            PromptVersion::resolve(&self.pool, ISSUE_PROMPT_SLUG, project.account_id, project.id)
                .await?
                .map(|pv| {
                    let mut values = HashMap::new();
                    values.insert("issue_title".to_string(), issue.title.clone());
                    values.insert("issue_number".to_string(), issue.github_number.to_string());
                    pv.render(&values).unwrap_or_default()
                })
        } else {
            None
        };

        let run = AgentRun::create(
            &self.pool,
            project.id,
            issue.map(|i| i.id),
            agent_type,
            custom_prompt.as_deref().or(resolved_prompt.as_deref()),
            source_pull_request_number,
        )
        .await?;

        if let Some(issue) = issue {
            Issue::set_paid_state(&self.pool, issue.id, PaidState::InProgress).await?;
        }

        AgentRunLog::system_event(&self.pool, run.id, "workflow.run_created", "agent run created").await?;
        Ok(run)
    }

    /// Step 2: `ProvisionContainer`.
    #[tracing::instrument(skip(self, auth))]
    pub async fn provision_container(
        &self,
        run: &AgentRun,
        firewall_script: Option<&str>,
        auth: &ContainerAuthContext,
    ) -> Result<SandboxHandle, WorkflowError> {
        AgentRunLog::system_event(&self.pool, run.id, "container.provision.start", "provisioning container").await?;

        let proxy_token = run.proxy_token.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let env = auth.container_env(&run.id.to_string(), &proxy_token);

        let handle = self
            .retry
            .with_retry(RetryPolicy::default(), || {
                self.sandbox.provision(&run.id.to_string(), firewall_script, &env)
            })
            .await?;

        AgentRun::set_branch_and_container(&self.pool, run.id, Some(&handle.container_id), Some(&proxy_token)).await?;
        Ok(handle)
    }

    /// Step 3: `CloneRepo`.
    #[tracing::instrument(skip(self, git, handle))]
    pub async fn clone_repo(
        &self,
        run: &AgentRun,
        project: &Project,
        issue: Option<&Issue>,
        git: &InContainerGit,
        handle: &SandboxHandle,
    ) -> Result<String, WorkflowError> {
        let branch_name = if run.is_pr_followup() {
            let pr_number = run.source_pull_request_number.expect("is_pr_followup guarantees Some");
            let pr = self.github.pull_request(&project.owner, &project.repo, pr_number).await?;
            git.clone_and_checkout_branch(handle, &project.owner, &project.repo, &pr.head_ref, &project.default_branch)
                .await?;
            pr.head_ref
        } else {
            let (branch, base_commit) = git
                .clone_and_setup_branch(
                    handle,
                    &project.owner,
                    &project.repo,
                    issue.map(|i| i.github_number),
                    issue.map(|i| i.title.as_str()),
                    run.custom_prompt.as_deref(),
                    &run.id.to_string(),
                )
                .await?;
            let _ = base_commit;
            git.install_git_hooks(handle, None, None).await?;
            branch
        };

        let mut tx = self.pool.begin().await.map_err(WorkflowError::Database)?;
        let outcome = Worktree::claim(
            &mut tx,
            project.id,
            &branch_name,
            &handle.workspace_path,
            "", // base_commit_sha recorded separately by the caller once known
            run.id,
        )
        .await
        .map_err(WorkflowError::Database)?;
        tx.commit().await.map_err(WorkflowError::Database)?;

        match outcome {
            ClaimOutcome::Created(_) | ClaimOutcome::Reclaimed(_) | ClaimOutcome::AlreadyOwned(_) => Ok(branch_name),
            ClaimOutcome::Conflict(_) => Err(WorkflowError::WorktreeConflict(branch_name)),
        }
    }

    /// Step 4 (PR runs only): `RebaseBranch` + `PreparePrPrompt`.
    #[tracing::instrument(skip(self, git, handle))]
    pub async fn rebase_and_prepare_pr_prompt(
        &self,
        run: &AgentRun,
        project: &Project,
        issue: Option<&Issue>,
        git: &InContainerGit,
        handle: &SandboxHandle,
    ) -> Result<String, WorkflowError> {
        let rebase_succeeded = git.rebase_onto(handle, &project.default_branch).await?;

        let pr_number = run.source_pull_request_number.expect("PR runs always have a source PR number");
        let pr = self.github.pull_request(&project.owner, &project.repo, pr_number).await?;
        let check_runs = self.github.check_runs_for_ref(&project.owner, &project.repo, &pr.head_sha).await.unwrap_or_default();
        let review_threads = self.github.review_threads(&project.owner, &project.repo, pr_number).await.unwrap_or_default();
        let reviews = self.github.pull_request_reviews(&project.owner, &project.repo, pr_number).await.unwrap_or_default();
        let comments = self.github.issue_comments(&project.owner, &project.repo, pr_number).await.unwrap_or_default();

        let prompt = build_pr_follow_up_prompt(&PrFollowUpInput {
            pr_number,
            pr_title: &pr.title,
            base_branch: &project.default_branch,
            pr_body: "",
            linked_issue: issue,
            rebase_failed: !rebase_succeeded,
            check_runs: &check_runs,
            review_threads: &review_threads,
            conversation_comments: &comments,
            detected_language: Some(&project.detected_language),
        });
        let _ = reviews;

        Ok(prompt)
    }

    /// Step 5: `RunAgent`.
    #[tracing::instrument(skip(self, git, handle, codebase_chunks))]
    #[allow(clippy::too_many_arguments)]
    pub async fn run_agent(
        &self,
        run: &AgentRun,
        issue: Option<&Issue>,
        project: &Project,
        git: &InContainerGit,
        handle: &SandboxHandle,
        codebase_chunks: &[CodebaseChunk],
        timeout: Option<Duration>,
    ) -> Result<(bool, bool), WorkflowError> {
        let provider = provider_for(run.agent_type)?;

        let prompt = if let Some(custom) = &run.custom_prompt {
            custom.clone()
        } else {
            let issue = issue.ok_or_else(|| WorkflowError::UnsupportedAgentType("no issue or custom prompt available".to_string()))?;
            build_issue_prompt(
                project.is_trusted(&issue.github_creator_login),
                issue.github_number,
                &issue.title,
                issue.body.as_deref().unwrap_or_default(),
                Some(&project.detected_language),
                codebase_chunks,
            )?
        };

        let prompt_file = format!("{}/.paid-prompt", handle.workspace_path);
        self.sandbox
            .execute(
                handle,
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("cat > {prompt_file} <<'PAID_PROMPT_EOF'\n{prompt}\nPAID_PROMPT_EOF"),
                ],
                Some(Duration::from_secs(10)),
            )
            .await
            .map_err(crate::error::WorkflowError::Container)?;

        let outcome = self
            .sandbox
            .execute(
                handle,
                &[
                    "paid-agent-harness".to_string(),
                    "--provider".to_string(),
                    provider.to_string(),
                    "--dangerous-mode".to_string(),
                    "--prompt-file".to_string(),
                    prompt_file,
                ],
                timeout,
            )
            .await
            .map_err(crate::error::WorkflowError::Container)?;

        if !outcome.stdout.is_empty() {
            AgentRunLog::append(&self.pool, run.id, LogType::Stdout, &outcome.stdout, None).await?;
        }
        if !outcome.stderr.is_empty() {
            AgentRunLog::append(&self.pool, run.id, LogType::Stderr, &outcome.stderr, None).await?;
        }

        let success = outcome.succeeded();
        let base = run.base_commit_sha.as_deref().unwrap_or("HEAD");
        let has_changes = git.has_changes_since(handle, base).await;

        Ok((success, has_changes))
    }

    /// Step 7: `PushBranch`.
    #[tracing::instrument(skip(self, git, handle))]
    pub async fn push_branch(
        &self,
        run: &AgentRun,
        git: &InContainerGit,
        handle: &SandboxHandle,
        branch_name: &str,
    ) -> Result<String, WorkflowError> {
        git.commit_uncommitted_changes(handle).await?;
        let commit_sha = git.push_branch(handle, branch_name, run.is_pr_followup()).await?;
        if let Some(worktree_id) = self.find_worktree_id(run).await? {
            Worktree::mark_pushed(&self.pool, worktree_id).await.map_err(WorkflowError::Database)?;
        }
        Ok(commit_sha)
    }

    async fn find_worktree_id(&self, run: &AgentRun) -> Result<Option<Uuid>, WorkflowError> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM worktrees WHERE agent_run_id = $1")
            .bind(run.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(WorkflowError::Database)?;
        Ok(row.map(|(id,)| id))
    }

    /// Step 8 (new-issue branch): `CreatePullRequest` + `UpdateIssueWithPR`.
    #[tracing::instrument(skip(self))]
    pub async fn create_pull_request_for_issue(
        &self,
        project: &Project,
        issue: &Issue,
        branch_name: &str,
    ) -> Result<String, WorkflowError> {
        let title = format!("Fix #{}: {}", issue.github_number, issue.title);
        let body = format!("Closes #{}", issue.github_number);
        let pr = self
            .github
            .create_pull_request(&project.owner, &project.repo, &title, branch_name, &project.default_branch, &body)
            .await?;
        let pr_url = format!("https://github.com/{}/{}/pull/{}", project.owner, project.repo, pr.number);

        self.github
            .add_comment(&project.owner, &project.repo, issue.github_number, &format!("Opened {pr_url}"))
            .await?;
        for stage_label in [Project::ACTIONABLE_PR_LABEL, "build", "plan"] {
            let _ = self
                .github
                .remove_label_from_issue(&project.owner, &project.repo, issue.github_number, stage_label)
                .await;
        }

        Ok(pr_url)
    }

    /// Step 8 (PR follow-up branch): `ResolveReviewThreads` + `CompleteExistingPrRun`.
    #[tracing::instrument(skip(self, review_threads))]
    pub async fn resolve_review_threads_and_complete(
        &self,
        project: &Project,
        pr_number: i64,
        review_threads: &[crate::github::graphql::ReviewThread],
    ) -> Result<(), WorkflowError> {
        let mut failures = 0u32;
        for thread in review_threads.iter().filter(|t| !t.is_resolved) {
            if self.github.resolve_review_thread(&thread.id).await.is_err() {
                failures += 1;
            }
        }
        if failures > 0 {
            tracing::warn!(failures, "some review threads could not be resolved");
        }

        self.github
            .add_comment(&project.owner, &project.repo, pr_number, "Agent pushed updates to this PR.")
            .await?;
        Ok(())
    }

    /// Step 9 cleanup: always runs regardless of how the pipeline above exited.
    #[tracing::instrument(skip(self, handle))]
    pub async fn cleanup(&self, run: &AgentRun, handle: Option<&SandboxHandle>) -> Result<(), WorkflowError> {
        if let Some(handle) = handle {
            let _ = self.sandbox.cleanup(handle).await;
        }
        if let Some(worktree_id) = self.find_worktree_id(run).await? {
            Worktree::mark_cleaned(&self.pool, worktree_id).await.map_err(WorkflowError::Database)?;
        }
        Ok(())
    }

    /// Terminal status helpers (spec §4.7 state machine).
    pub async fn mark_complete(&self, run: &AgentRun, pull_request_url: Option<&str>) -> Result<(), WorkflowError> {
        if let Some(url) = pull_request_url {
            sqlx::query("UPDATE agent_runs SET pull_request_url = $2 WHERE id = $1")
                .bind(run.id)
                .bind(url)
                .execute(&self.pool)
                .await
                .map_err(WorkflowError::Database)?;
        }
        run.transition_status(&self.pool, AgentRunStatus::Completed, None).await
    }

    pub async fn mark_failed(&self, run: &AgentRun, error: &str) -> Result<(), WorkflowError> {
        run.transition_status(&self.pool, AgentRunStatus::Failed, Some(error)).await
    }

    pub async fn mark_timeout(&self, run: &AgentRun) -> Result<(), WorkflowError> {
        run.transition_status(&self.pool, AgentRunStatus::Timeout, None).await
    }
}
