//! Issue (spec §3): belongs to Project. Untrusted issues have their body dropped at
//! ingestion (invariant 2, spec §8).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaidState {
    New,
    Planning,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GithubState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Issue {
    pub id: Uuid,
    pub project_id: Uuid,
    pub github_issue_id: i64,
    pub github_number: i64,
    pub title: String,
    pub body: Option<String>,
    #[sqlx(json)]
    pub labels: HashSet<String>,
    pub github_state: GithubState,
    pub is_pull_request: bool,
    pub github_creator_login: String,
    pub paid_state: PaidState,
    pub pr_followup_count: i32,
}

impl Issue {
    /// An issue is trusted iff its creator is in the project's allow-list. Call sites
    /// should drop `body` at ingestion time when this is false.
    pub fn is_trusted(creator_login: &str, allowed_usernames: &HashSet<String>) -> bool {
        allowed_usernames.contains(creator_login)
    }

    /// `true` for any GitHub login that looks like a bot: ends with `[bot]` or contains
    /// the literal substring `bot` (spec §4.5: "Bot users... are always excluded").
    pub fn is_bot_login(login: &str) -> bool {
        let lower = login.to_lowercase();
        lower.ends_with("[bot]") || lower.contains("bot")
    }

    pub async fn upsert(
        pool: &sqlx::PgPool,
        project_id: Uuid,
        github_issue_id: i64,
        github_number: i64,
        title: &str,
        body: Option<&str>,
        labels: &HashSet<String>,
        github_state: GithubState,
        is_pull_request: bool,
        github_creator_login: &str,
    ) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Issue>(
            r#"
            INSERT INTO issues (id, project_id, github_issue_id, github_number, title,
                                 body, labels, github_state, is_pull_request,
                                 github_creator_login, paid_state, pr_followup_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'new', 0)
            ON CONFLICT (project_id, github_issue_id) DO UPDATE SET
                title = EXCLUDED.title,
                body = EXCLUDED.body,
                labels = EXCLUDED.labels,
                github_state = EXCLUDED.github_state,
                is_pull_request = EXCLUDED.is_pull_request,
                github_creator_login = EXCLUDED.github_creator_login
            RETURNING id, project_id, github_issue_id, github_number, title, body,
                      labels, github_state, is_pull_request, github_creator_login,
                      paid_state, pr_followup_count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(github_issue_id)
        .bind(github_number)
        .bind(title)
        .bind(body)
        .bind(sqlx::types::Json(labels))
        .bind(github_state)
        .bind(is_pull_request)
        .bind(github_creator_login)
        .fetch_one(pool)
        .await
    }

    pub async fn mark_closed_if_missing(
        pool: &sqlx::PgPool,
        project_id: Uuid,
        seen_github_issue_ids: &[i64],
    ) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"UPDATE issues SET github_state = 'closed'
               WHERE project_id = $1 AND github_state = 'open'
                 AND NOT (github_issue_id = ANY($2))"#,
        )
        .bind(project_id)
        .bind(seen_github_issue_ids)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_paid_state(
        pool: &sqlx::PgPool,
        issue_id: Uuid,
        state: PaidState,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE issues SET paid_state = $1 WHERE id = $2")
            .bind(state)
            .bind(issue_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn increment_followup_count(pool: &sqlx::PgPool, issue_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE issues SET pr_followup_count = pr_followup_count + 1 WHERE id = $1")
            .bind(issue_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
