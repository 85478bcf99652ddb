//! AgentRun (spec §3): one invocation of a coding agent. Status transitions are
//! monotone and terminal-once (invariant 1, spec §8).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    ClaudeCode,
    Cursor,
    Codex,
    Copilot,
    Aider,
    Gemini,
    Opencode,
    Kilocode,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl AgentRunStatus {
    /// `true` once a run has reached a status it can never leave (spec invariant 1 & 8).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentRunStatus::Completed
                | AgentRunStatus::Failed
                | AgentRunStatus::Cancelled
                | AgentRunStatus::Timeout
        )
    }

    /// Whether `self -> next` is a legal transition under the monotone state machine in
    /// spec §4.7/§8. Terminal states accept only a no-op transition to themselves
    /// (idempotent activity replay).
    pub fn can_transition_to(self, next: AgentRunStatus) -> bool {
        use AgentRunStatus::*;
        if self.is_terminal() {
            return next == self;
        }
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Running)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
                | (Pending, Failed)
                | (Pending, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRun {
    pub id: Uuid,
    pub project_id: Uuid,
    pub issue_id: Option<Uuid>,
    pub agent_type: AgentType,
    pub status: AgentRunStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_seconds: Option<i64>,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub base_commit_sha: Option<String>,
    pub result_commit_sha: Option<String>,
    pub pull_request_url: Option<String>,
    pub pull_request_number: Option<i64>,
    pub source_pull_request_number: Option<i64>,
    pub custom_prompt: Option<String>,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost_cents: i64,
    pub proxy_token: Option<String>,
    pub container_id: Option<String>,
    pub error_message: Option<String>,
}

impl AgentRun {
    /// `true` when this run operates on an existing PR's branch rather than creating a
    /// new one.
    pub fn is_pr_followup(&self) -> bool {
        self.source_pull_request_number.is_some()
    }

    pub async fn create(
        pool: &sqlx::PgPool,
        project_id: Uuid,
        issue_id: Option<Uuid>,
        agent_type: AgentType,
        custom_prompt: Option<&str>,
        source_pull_request_number: Option<i64>,
    ) -> sqlx::Result<Self> {
        sqlx::query_as::<_, AgentRun>(
            r#"
            INSERT INTO agent_runs (id, project_id, issue_id, agent_type, status,
                                     custom_prompt, source_pull_request_number,
                                     tokens_input, tokens_output, cost_cents)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, 0, 0, 0)
            RETURNING id, project_id, issue_id, agent_type, status, started_at,
                      completed_at, duration_seconds, worktree_path, branch_name,
                      base_commit_sha, result_commit_sha, pull_request_url,
                      pull_request_number, source_pull_request_number, custom_prompt,
                      tokens_input, tokens_output, cost_cents, proxy_token,
                      container_id, error_message
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(issue_id)
        .bind(agent_type)
        .bind(custom_prompt)
        .bind(source_pull_request_number)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &sqlx::PgPool, id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, AgentRun>(
            r#"SELECT id, project_id, issue_id, agent_type, status, started_at,
                      completed_at, duration_seconds, worktree_path, branch_name,
                      base_commit_sha, result_commit_sha, pull_request_url,
                      pull_request_number, source_pull_request_number, custom_prompt,
                      tokens_input, tokens_output, cost_cents, proxy_token,
                      container_id, error_message
               FROM agent_runs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Apply a status transition, silently tolerating a retry that lands on the run's
    /// already-reached terminal state (spec invariant 8: cleanup/terminal activities are
    /// idempotent).
    ///
    /// Validates against the row's current status in the database rather than `self`:
    /// activity functions pass around the `AgentRun` they loaded at the start of the
    /// pipeline, so `self.status` is generally stale by the time a later step
    /// transitions it again.
    pub async fn transition_status(
        &self,
        pool: &sqlx::PgPool,
        next: AgentRunStatus,
        error_message: Option<&str>,
    ) -> Result<(), crate::error::WorkflowError> {
        let (current_status, started_at): (AgentRunStatus, Option<chrono::DateTime<chrono::Utc>>) =
            sqlx::query_as("SELECT status, started_at FROM agent_runs WHERE id = $1")
                .bind(self.id)
                .fetch_one(pool)
                .await?;

        if !current_status.can_transition_to(next) {
            return Err(crate::error::WorkflowError::RetriesExhausted(format!(
                "illegal status transition {current_status:?} -> {next:?}"
            )));
        }
        if current_status == next {
            return Ok(());
        }
        let set_started = next == AgentRunStatus::Running && started_at.is_none();
        sqlx::query(
            r#"UPDATE agent_runs SET
                  status = $2,
                  error_message = COALESCE($3, error_message),
                  started_at = CASE WHEN $4 THEN now() ELSE started_at END,
                  completed_at = CASE WHEN $5 THEN now() ELSE completed_at END
               WHERE id = $1"#,
        )
        .bind(self.id)
        .bind(next)
        .bind(error_message)
        .bind(set_started)
        .bind(next.is_terminal())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_branch_and_container(
        pool: &sqlx::PgPool,
        id: Uuid,
        container_id: Option<&str>,
        proxy_token: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE agent_runs SET container_id = COALESCE($2, container_id), \
             proxy_token = COALESCE($3, proxy_token) WHERE id = $1",
        )
        .bind(id)
        .bind(container_id)
        .bind(proxy_token)
        .execute(pool)
        .await?;
        Ok(())
    }
}
