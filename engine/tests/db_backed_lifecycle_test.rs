//! Lifecycle tests that exercise real Postgres transactions: worktree
//! create/reclaim/conflict, issue upsert idempotence, and one full poll tick end to
//! end. These require a live database and are `#[ignore]`d by default, mirroring this
//! repository's convention for tests that need an external service.
//!
//! Run with: `DATABASE_URL=postgres://... cargo test -p paid-orchestrator --test db_backed_lifecycle_test -- --ignored`
//! after applying `engine/migrations/20260101000000_init.sql`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use paid_orchestrator::error::{GitHubError, WorkflowError};
use paid_orchestrator::github::client::{
    CheckRunInfo, CommentInfo, GithubOperations, IssueInfo, PullRequestInfo, RepoInfo, ReviewInfo,
};
use paid_orchestrator::github::graphql::ReviewThread;
use paid_orchestrator::models::issue::{GithubState, Issue};
use paid_orchestrator::models::project::Project;
use paid_orchestrator::models::worktree::{ClaimOutcome, Worktree};
use paid_orchestrator::poll::{AgentRunSpawner, GitHubPollWorkflow};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn pool() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for db-backed tests");
    PgPoolOptions::new().max_connections(5).connect(&url).await.expect("connect to test database")
}

async fn seed_account_and_project(pool: &sqlx::PgPool) -> Project {
    let account_id = Uuid::new_v4();
    sqlx::query("INSERT INTO accounts (id, slug, name) VALUES ($1, $2, $3)")
        .bind(account_id)
        .bind(format!("acct-{account_id}"))
        .bind("Test Account")
        .execute(pool)
        .await
        .unwrap();

    let token_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO github_tokens (id, account_id, name, encrypted_token, scopes) \
         VALUES ($1, $2, 'default', 'enc:ghp_test', ARRAY['repo'])",
    )
    .bind(token_id)
    .bind(account_id)
    .execute(pool)
    .await
    .unwrap();

    let project_id = Uuid::new_v4();
    sqlx::query(
        r#"INSERT INTO projects (id, account_id, github_token_id, owner, repo, github_id,
                                  label_mappings, pr_action_labels, allowed_github_usernames,
                                  auto_scan_prs)
           VALUES ($1, $2, $3, 'acme', 'widgets', 1, $4, $5, $6, true)"#,
    )
    .bind(project_id)
    .bind(account_id)
    .bind(token_id)
    .bind(sqlx::types::Json(HashMap::from([("build", "paid-build")])))
    .bind(sqlx::types::Json(HashSet::from(["needs-agent"])))
    .bind(sqlx::types::Json(HashSet::from(["alice"])))
    .execute(pool)
    .await
    .unwrap();

    Project::find_by_id(pool, project_id).await.unwrap().unwrap()
}

#[tokio::test]
#[ignore = "requires a live Postgres database; set DATABASE_URL"]
async fn worktree_claim_creates_then_reclaims_then_conflicts() {
    let pool = pool().await;
    let project = seed_account_and_project(&pool).await;
    let run_a = Uuid::new_v4();
    let run_b = Uuid::new_v4();

    let mut tx = pool.begin().await.unwrap();
    let created = Worktree::claim(&mut tx, project.id, "paid/issue-1", "/workspace/run-a", "sha1", run_a)
        .await
        .unwrap();
    assert!(matches!(created, ClaimOutcome::Created(_)));
    tx.commit().await.unwrap();

    // Same run claiming again is a no-op.
    let mut tx = pool.begin().await.unwrap();
    let again = Worktree::claim(&mut tx, project.id, "paid/issue-1", "/workspace/run-a", "sha1", run_a)
        .await
        .unwrap();
    assert!(matches!(again, ClaimOutcome::AlreadyOwned(_)));
    tx.commit().await.unwrap();

    // A different run on the same branch while it's still active is a conflict.
    let mut tx = pool.begin().await.unwrap();
    let conflict = Worktree::claim(&mut tx, project.id, "paid/issue-1", "/workspace/run-b", "sha2", run_b)
        .await
        .unwrap();
    assert!(matches!(conflict, ClaimOutcome::Conflict(_)));
    tx.commit().await.unwrap();

    // Once marked cleaned, the branch can be reclaimed by a new run.
    if let ClaimOutcome::Created(w) = created {
        Worktree::mark_cleaned(&pool, w.id).await.unwrap();
    }
    let mut tx = pool.begin().await.unwrap();
    let reclaimed = Worktree::claim(&mut tx, project.id, "paid/issue-1", "/workspace/run-b", "sha2", run_b)
        .await
        .unwrap();
    assert!(matches!(reclaimed, ClaimOutcome::Reclaimed(_)));
    tx.commit().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a live Postgres database; set DATABASE_URL"]
async fn issue_upsert_drops_body_for_untrusted_creator_and_is_idempotent() {
    let pool = pool().await;
    let project = seed_account_and_project(&pool).await;

    let first = Issue::upsert(
        &pool,
        project.id,
        9001,
        5,
        "Widget overflows on negative width",
        Some("steps to reproduce..."),
        &HashSet::from(["paid-build".to_string()]),
        GithubState::Open,
        false,
        "attacker",
    )
    .await
    .unwrap();

    // The caller is responsible for dropping the body before calling `upsert` when the
    // creator is untrusted (spec invariant 2); this asserts the upsert itself is a
    // faithful round-trip of whatever the caller passed.
    assert_eq!(first.body.as_deref(), Some("steps to reproduce..."));
    assert_eq!(first.paid_state, paid_orchestrator::models::issue::PaidState::New);

    // Re-upserting the same github_issue_id is idempotent: same row, updated fields.
    let second = Issue::upsert(
        &pool,
        project.id,
        9001,
        5,
        "Widget overflows on negative width (edited)",
        Some("steps to reproduce..."),
        &HashSet::from(["paid-build".to_string()]),
        GithubState::Open,
        false,
        "attacker",
    )
    .await
    .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.title, "Widget overflows on negative width (edited)");
}

struct FakeGithub {
    issues: Vec<IssueInfo>,
}

#[async_trait]
impl GithubOperations for FakeGithub {
    async fn validate_token(&self) -> Result<bool, GitHubError> {
        Ok(true)
    }
    async fn repository(&self, _owner: &str, _repo: &str) -> Result<RepoInfo, GitHubError> {
        unreachable!()
    }
    async fn repositories(&self) -> Result<Vec<RepoInfo>, GitHubError> {
        unreachable!()
    }
    async fn write_accessible(&self, _owner: &str, _repo: &str) -> Result<bool, GitHubError> {
        Ok(true)
    }
    async fn issues(
        &self,
        _owner: &str,
        _repo: &str,
        _labels: Option<&[String]>,
        _state: Option<&str>,
        page: u32,
    ) -> Result<Vec<IssueInfo>, GitHubError> {
        if page == 1 {
            Ok(self.issues.clone())
        } else {
            Ok(vec![])
        }
    }
    async fn pull_request(&self, _owner: &str, _repo: &str, _number: i64) -> Result<PullRequestInfo, GitHubError> {
        unreachable!()
    }
    async fn create_pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        _title: &str,
        _head: &str,
        _base: &str,
        _body: &str,
    ) -> Result<PullRequestInfo, GitHubError> {
        unreachable!()
    }
    async fn labels(&self, _owner: &str, _repo: &str) -> Result<Vec<String>, GitHubError> {
        Ok(vec![])
    }
    async fn create_label(&self, _owner: &str, _repo: &str, _name: &str, _color: &str) -> Result<(), GitHubError> {
        Ok(())
    }
    async fn add_labels_to_issue(&self, _owner: &str, _repo: &str, _number: i64, _labels: &[String]) -> Result<(), GitHubError> {
        Ok(())
    }
    async fn remove_label_from_issue(&self, _owner: &str, _repo: &str, _number: i64, _label: &str) -> Result<(), GitHubError> {
        Ok(())
    }
    async fn add_comment(&self, _owner: &str, _repo: &str, _number: i64, _body: &str) -> Result<(), GitHubError> {
        Ok(())
    }
    async fn check_runs_for_ref(&self, _owner: &str, _repo: &str, _sha: &str) -> Result<Vec<CheckRunInfo>, GitHubError> {
        Ok(vec![])
    }
    async fn issue_comments(&self, _owner: &str, _repo: &str, _number: i64) -> Result<Vec<CommentInfo>, GitHubError> {
        Ok(vec![])
    }
    async fn review_threads(&self, _owner: &str, _repo: &str, _number: i64) -> Result<Vec<ReviewThread>, GitHubError> {
        Ok(vec![])
    }
    async fn resolve_review_thread(&self, _node_id: &str) -> Result<(), GitHubError> {
        Ok(())
    }
    async fn pull_request_reviews(&self, _owner: &str, _repo: &str, _number: i64) -> Result<Vec<ReviewInfo>, GitHubError> {
        Ok(vec![])
    }
    async fn create_pull_request_comment_reply(&self, _owner: &str, _repo: &str, _comment_id: i64, _body: &str) -> Result<(), GitHubError> {
        Ok(())
    }
    async fn rate_limit_remaining(&self) -> Result<u32, GitHubError> {
        Ok(5000)
    }
    async fn rate_limit_low(&self, _threshold: u32) -> Result<bool, GitHubError> {
        Ok(false)
    }
}

struct RecordingSpawner {
    issues_spawned: std::sync::Mutex<Vec<i64>>,
}

#[async_trait]
impl AgentRunSpawner for RecordingSpawner {
    async fn spawn_for_issue(&self, _project: &Project, issue: &Issue) -> Result<(), WorkflowError> {
        self.issues_spawned.lock().unwrap().push(issue.github_number);
        Ok(())
    }
    async fn spawn_for_pr(&self, _project: &Project, _issue_id: Uuid, _pr_number: i64) -> Result<(), WorkflowError> {
        Ok(())
    }
}

/// One full poll tick: a trusted, correctly-labeled issue that already exists in the
/// database as `new` must be picked up and scheduled exactly once.
#[tokio::test]
#[ignore = "requires a live Postgres database; set DATABASE_URL"]
async fn poll_tick_schedules_trusted_labeled_issue_exactly_once() {
    let pool = pool().await;
    let project = seed_account_and_project(&pool).await;

    // No issue row is pre-seeded: `run_once`'s own call to `fetch_issues` creates it
    // from the fake GitHub response, exactly as a real first tick would.
    let github = Arc::new(FakeGithub {
        issues: vec![IssueInfo {
            number: 11,
            title: "Add retry to the export job".to_string(),
            body: Some("it should retry on transient failure".to_string()),
            creator_login: "alice".to_string(),
            labels: vec!["paid-build".to_string()],
            state: "open".to_string(),
            is_pull_request: false,
        }],
    });
    let spawner = Arc::new(RecordingSpawner { issues_spawned: std::sync::Mutex::new(vec![]) });
    let workflow = GitHubPollWorkflow::new(pool.clone(), github, spawner.clone());

    let summary = workflow.run_once(&project).await.unwrap();
    assert_eq!(summary.issues_synced, 1);
    assert_eq!(summary.agent_runs_started, 1);
    assert_eq!(*spawner.issues_spawned.lock().unwrap(), vec![11]);

    // A second tick against the same unchanged issue must not re-schedule it: by then
    // the real spawner would have flipped `paid_state` away from `new`, but this fake
    // doesn't, so we simulate that transition directly to assert the guard in
    // `run_once` (it only schedules issues still in `new`).
    sqlx::query("UPDATE issues SET paid_state = 'in_progress' WHERE project_id = $1 AND github_number = 11")
        .bind(project.id)
        .execute(&pool)
        .await
        .unwrap();

    let second = workflow.run_once(&project).await.unwrap();
    assert_eq!(second.agent_runs_started, 0);
}
