//! Project (spec §3): belongs to Account and GithubToken; owns Issues, AgentRuns,
//! Worktrees, WorkflowStates.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Label-mapping stage: which GitHub label schedules which kind of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Plan,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Build => write!(f, "build"),
            Stage::Plan => write!(f, "plan"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub account_id: Uuid,
    pub github_token_id: Uuid,
    pub owner: String,
    pub repo: String,
    pub github_id: i64,
    pub default_branch: String,
    pub active: bool,
    pub poll_interval_seconds: i64,
    /// Stored as JSON in Postgres (`label_mappings JSONB`); keyed by `Stage`'s
    /// `snake_case` serde representation.
    #[sqlx(json)]
    pub label_mappings: HashMap<Stage, String>,
    #[sqlx(json)]
    pub pr_action_labels: HashSet<String>,
    #[sqlx(json)]
    pub allowed_github_usernames: HashSet<String>,
    pub auto_scan_prs: bool,
    pub auto_fix_merge_conflicts: bool,
    pub max_pr_followup_runs: i32,
    pub total_cost_cents: i64,
    pub total_tokens_used: i64,
    pub detected_language: String,
}

impl Project {
    pub const MIN_POLL_INTERVAL_SECONDS: i64 = 60;
    pub const ACTIONABLE_PR_LABEL: &'static str = "paid-generated";

    /// A login is trusted iff it appears in `allowed_github_usernames`.
    pub fn is_trusted(&self, login: &str) -> bool {
        self.allowed_github_usernames.contains(login)
    }

    pub fn label_for_stage(&self, stage: Stage) -> Option<&str> {
        self.label_mappings.get(&stage).map(String::as_str)
    }

    /// The repository's `owner/repo` spec, as GitHub's API expects it.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub async fn find_by_id(pool: &sqlx::PgPool, id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Project>(
            r#"SELECT id, account_id, github_token_id, owner, repo, github_id,
                      default_branch, active, poll_interval_seconds, label_mappings,
                      pr_action_labels, allowed_github_usernames, auto_scan_prs,
                      auto_fix_merge_conflicts, max_pr_followup_runs, total_cost_cents,
                      total_tokens_used, detected_language
               FROM projects WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn active_projects(pool: &sqlx::PgPool) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as::<_, Project>(
            r#"SELECT id, account_id, github_token_id, owner, repo, github_id,
                      default_branch, active, poll_interval_seconds, label_mappings,
                      pr_action_labels, allowed_github_usernames, auto_scan_prs,
                      auto_fix_merge_conflicts, max_pr_followup_runs, total_cost_cents,
                      total_tokens_used, detected_language
               FROM projects WHERE active = true"#,
        )
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            github_token_id: Uuid::new_v4(),
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            github_id: 1,
            default_branch: "main".to_string(),
            active: true,
            poll_interval_seconds: 60,
            label_mappings: HashMap::from([(Stage::Build, "paid-build".to_string())]),
            pr_action_labels: HashSet::new(),
            allowed_github_usernames: HashSet::from(["alice".to_string()]),
            auto_scan_prs: true,
            auto_fix_merge_conflicts: false,
            max_pr_followup_runs: 5,
            total_cost_cents: 0,
            total_tokens_used: 0,
            detected_language: "ruby".to_string(),
        }
    }

    #[test]
    fn trust_is_exact_login_membership() {
        let p = project();
        assert!(p.is_trusted("alice"));
        assert!(!p.is_trusted("attacker"));
    }

    #[test]
    fn full_name_is_owner_slash_repo() {
        assert_eq!(project().full_name(), "acme/widgets");
    }
}
