//! Worktree (spec §3): bookkeeping record of a cloned-and-branched working copy inside
//! a container. Reclaimed (re-activated) when a later run targets the same PR branch.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Cleaned,
    CleanupFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worktree {
    pub id: Uuid,
    pub project_id: Uuid,
    pub agent_run_id: Option<Uuid>,
    pub path: String,
    pub branch_name: String,
    pub base_commit: String,
    pub status: WorktreeStatus,
    pub pushed: bool,
    pub cleaned_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of attempting to claim a worktree row for `(project_id, branch_name)`.
pub enum ClaimOutcome {
    Created(Worktree),
    Reclaimed(Worktree),
    /// Active for a different run: the caller must fail with a conflict error.
    Conflict(Worktree),
    /// Active for this same run already: no-op.
    AlreadyOwned(Worktree),
}

impl Worktree {
    /// Create-or-reclaim a worktree keyed by `(project_id, branch_name)`, per spec
    /// §4.7 step 3. Runs inside the caller's transaction so the `SELECT ... FOR UPDATE`
    /// and the subsequent write are atomic with respect to concurrent activity retries.
    pub async fn claim(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        project_id: Uuid,
        branch_name: &str,
        path: &str,
        base_commit: &str,
        agent_run_id: Uuid,
    ) -> sqlx::Result<ClaimOutcome> {
        let existing = sqlx::query_as::<_, Worktree>(
            r#"SELECT id, project_id, agent_run_id, path, branch_name, base_commit,
                      status, pushed, cleaned_at, created_at
               FROM worktrees WHERE project_id = $1 AND branch_name = $2
               FOR UPDATE"#,
        )
        .bind(project_id)
        .bind(branch_name)
        .fetch_optional(&mut **tx)
        .await?;

        match existing {
            None => {
                let created = sqlx::query_as::<_, Worktree>(
                    r#"
                    INSERT INTO worktrees (id, project_id, agent_run_id, path,
                                            branch_name, base_commit, status, pushed,
                                            cleaned_at, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, 'active', false, NULL, now())
                    RETURNING id, project_id, agent_run_id, path, branch_name,
                              base_commit, status, pushed, cleaned_at, created_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(project_id)
                .bind(agent_run_id)
                .bind(path)
                .bind(branch_name)
                .bind(base_commit)
                .fetch_one(&mut **tx)
                .await?;
                Ok(ClaimOutcome::Created(created))
            }
            Some(row) if row.status != WorktreeStatus::Active => {
                let reclaimed = sqlx::query_as::<_, Worktree>(
                    r#"UPDATE worktrees SET
                          agent_run_id = $2, path = $3, base_commit = $4,
                          status = 'active', pushed = false, cleaned_at = NULL,
                          created_at = now()
                       WHERE id = $1
                       RETURNING id, project_id, agent_run_id, path, branch_name,
                                 base_commit, status, pushed, cleaned_at, created_at"#,
                )
                .bind(row.id)
                .bind(agent_run_id)
                .bind(path)
                .bind(base_commit)
                .fetch_one(&mut **tx)
                .await?;
                Ok(ClaimOutcome::Reclaimed(reclaimed))
            }
            Some(row) if row.agent_run_id == Some(agent_run_id) => Ok(ClaimOutcome::AlreadyOwned(row)),
            Some(row) => Ok(ClaimOutcome::Conflict(row)),
        }
    }

    pub async fn mark_pushed(pool: &sqlx::PgPool, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE worktrees SET pushed = true WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Mark this worktree cleaned. Safe to call twice: the second call is a no-op
    /// (spec invariant 8).
    pub async fn mark_cleaned(pool: &sqlx::PgPool, id: Uuid) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE worktrees SET status = 'cleaned', cleaned_at = now() \
             WHERE id = $1 AND status != 'cleaned'",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
