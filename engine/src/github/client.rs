//! REST v3 wrapper (C4, spec §4.4), backed by `octocrab` with explicit retry/backoff
//! since octocrab itself does not retry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use octocrab::Octocrab;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GitHubError;
use crate::github::graphql::{GraphQlClient, ReviewThread};

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoInfo {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub can_push: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueInfo {
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub creator_login: String,
    pub labels: Vec<String>,
    pub state: String,
    pub is_pull_request: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub number: i64,
    pub title: String,
    pub head_ref: String,
    pub base_ref: String,
    pub head_sha: String,
    pub merge_conflict: bool,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRunInfo {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentInfo {
    pub id: i64,
    pub author_login: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewInfo {
    pub author_login: String,
    pub state: String,
    pub body: Option<String>,
    pub submitted_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Contract the scanner (C6) and workflow (C7) drive; faked in tests with a hand-rolled
/// implementation rather than `mockall`.
#[async_trait]
pub trait GithubOperations: Send + Sync {
    async fn validate_token(&self) -> Result<bool, GitHubError>;
    async fn repository(&self, owner: &str, repo: &str) -> Result<RepoInfo, GitHubError>;
    async fn repositories(&self) -> Result<Vec<RepoInfo>, GitHubError>;
    async fn write_accessible(&self, owner: &str, repo: &str) -> Result<bool, GitHubError>;
    async fn issues(
        &self,
        owner: &str,
        repo: &str,
        labels: Option<&[String]>,
        state: Option<&str>,
        page: u32,
    ) -> Result<Vec<IssueInfo>, GitHubError>;
    async fn pull_request(&self, owner: &str, repo: &str, number: i64) -> Result<PullRequestInfo, GitHubError>;
    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<PullRequestInfo, GitHubError>;
    async fn labels(&self, owner: &str, repo: &str) -> Result<Vec<String>, GitHubError>;
    async fn create_label(&self, owner: &str, repo: &str, name: &str, color: &str) -> Result<(), GitHubError>;
    async fn add_labels_to_issue(&self, owner: &str, repo: &str, number: i64, labels: &[String]) -> Result<(), GitHubError>;
    async fn remove_label_from_issue(&self, owner: &str, repo: &str, number: i64, label: &str) -> Result<(), GitHubError>;
    async fn add_comment(&self, owner: &str, repo: &str, number: i64, body: &str) -> Result<(), GitHubError>;
    async fn check_runs_for_ref(&self, owner: &str, repo: &str, sha: &str) -> Result<Vec<CheckRunInfo>, GitHubError>;
    async fn issue_comments(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<CommentInfo>, GitHubError>;
    async fn review_threads(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<ReviewThread>, GitHubError>;
    async fn resolve_review_thread(&self, node_id: &str) -> Result<(), GitHubError>;
    async fn pull_request_reviews(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<ReviewInfo>, GitHubError>;
    async fn create_pull_request_comment_reply(
        &self,
        owner: &str,
        repo: &str,
        comment_id: i64,
        body: &str,
    ) -> Result<(), GitHubError>;
    async fn rate_limit_remaining(&self) -> Result<u32, GitHubError>;
    async fn rate_limit_low(&self, threshold: u32) -> Result<bool, GitHubError>;
}

pub struct GitHubClient {
    octocrab: Octocrab,
    graphql: GraphQlClient,
    write_accessible_cache: Mutex<HashMap<String, bool>>,
}

impl GitHubClient {
    pub fn new(token: String) -> Result<Self, GitHubError> {
        let octocrab = Octocrab::builder()
            .personal_token(token.clone())
            .build()
            .map_err(|e| GitHubError::Transport(e.to_string()))?;
        let http = reqwest::Client::builder()
            .user_agent("paid-orchestrator")
            .build()
            .map_err(|e| GitHubError::Transport(e.to_string()))?;
        Ok(Self {
            octocrab,
            graphql: GraphQlClient::new(http, token),
            write_accessible_cache: Mutex::new(HashMap::new()),
        })
    }

    fn classify_octocrab_error(err: &octocrab::Error) -> GitHubError {
        if let octocrab::Error::GitHub { source, .. } = err {
            let status = source.status_code.as_u16();
            return match status {
                401 => GitHubError::Authentication,
                404 => GitHubError::NotFound,
                403 | 429 => GitHubError::RateLimit(chrono::Utc::now() + chrono::Duration::minutes(1)),
                other => GitHubError::Api(other),
            };
        }
        GitHubError::Transport(err.to_string())
    }

    async fn with_retry<F, Fut, T>(op: F) -> Result<T, GitHubError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, GitHubError>>,
    {
        let mut attempt = 0;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < MAX_ATTEMPTS && Self::is_retryable(&err) => {
                    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.5);
                    let sleep_for = backoff.mul_f64(1.0 + jitter);
                    tokio::time::sleep(sleep_for).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_retryable(err: &GitHubError) -> bool {
        match err {
            GitHubError::Api(status) => RETRYABLE_STATUSES.contains(status),
            GitHubError::RateLimit(_) => true,
            GitHubError::Transport(_) => true,
            _ => false,
        }
    }
}

#[async_trait]
impl GithubOperations for GitHubClient {
    async fn validate_token(&self) -> Result<bool, GitHubError> {
        Self::with_retry(|| async {
            self.octocrab
                .current()
                .user()
                .await
                .map(|_| true)
                .map_err(|e| Self::classify_octocrab_error(&e))
        })
        .await
    }

    async fn repository(&self, owner: &str, repo: &str) -> Result<RepoInfo, GitHubError> {
        Self::with_retry(|| async {
            let r = self
                .octocrab
                .repos(owner, repo)
                .get()
                .await
                .map_err(|e| Self::classify_octocrab_error(&e))?;
            Ok(RepoInfo {
                owner: owner.to_string(),
                name: repo.to_string(),
                default_branch: r.default_branch.unwrap_or_else(|| "main".to_string()),
                can_push: r.permissions.map(|p| p.push).unwrap_or(false),
            })
        })
        .await
    }

    async fn repositories(&self) -> Result<Vec<RepoInfo>, GitHubError> {
        let page = Self::with_retry(|| async {
            self.octocrab
                .current()
                .list_repos_for_authenticated_user()
                .send()
                .await
                .map_err(|e| Self::classify_octocrab_error(&e))
        })
        .await?;

        Ok(page
            .items
            .into_iter()
            .filter_map(|r| {
                let can_push = r.permissions.as_ref().map(|p| p.push).unwrap_or(false);
                if !can_push {
                    return None;
                }
                Some(RepoInfo {
                    owner: r.owner.map(|o| o.login).unwrap_or_default(),
                    name: r.name,
                    default_branch: r.default_branch.unwrap_or_else(|| "main".to_string()),
                    can_push,
                })
            })
            .collect())
    }

    async fn write_accessible(&self, owner: &str, repo: &str) -> Result<bool, GitHubError> {
        let key = format!("{owner}/{repo}");
        if let Some(cached) = self.write_accessible_cache.lock().unwrap().get(&key) {
            return Ok(*cached);
        }

        let result = Self::with_retry(|| async {
            self.octocrab
                .repos(owner, repo)
                .create_blob("probe")
                .await
                .map(|_| true)
                .map_err(|e| Self::classify_octocrab_error(&e))
        })
        .await;

        let accessible = match result {
            Ok(v) => v,
            Err(GitHubError::NotFound) | Err(GitHubError::Authentication) => false,
            Err(other) => return Err(other),
        };

        self.write_accessible_cache.lock().unwrap().insert(key, accessible);
        Ok(accessible)
    }

    async fn issues(
        &self,
        owner: &str,
        repo: &str,
        labels: Option<&[String]>,
        state: Option<&str>,
        page: u32,
    ) -> Result<Vec<IssueInfo>, GitHubError> {
        let labels = labels.map(|l| l.to_vec());
        let state = state.map(|s| s.to_string());
        Self::with_retry(|| async {
            let mut builder = self.octocrab.issues(owner, repo).list().page(page as u8);
            if let Some(labels) = &labels {
                builder = builder.labels(labels);
            }
            builder = match state.as_deref() {
                Some("closed") => builder.state(octocrab::params::State::Closed),
                Some("all") => builder.state(octocrab::params::State::All),
                _ => builder.state(octocrab::params::State::Open),
            };
            let page_result = builder.send().await.map_err(|e| Self::classify_octocrab_error(&e))?;
            Ok(page_result
                .items
                .into_iter()
                .map(|i| IssueInfo {
                    number: i.number as i64,
                    title: i.title,
                    body: i.body,
                    creator_login: i.user.login,
                    labels: i.labels.into_iter().map(|l| l.name).collect(),
                    state: format!("{:?}", i.state).to_lowercase(),
                    is_pull_request: i.pull_request.is_some(),
                })
                .collect())
        })
        .await
    }

    async fn pull_request(&self, owner: &str, repo: &str, number: i64) -> Result<PullRequestInfo, GitHubError> {
        Self::with_retry(|| async {
            let pr = self
                .octocrab
                .pulls(owner, repo)
                .get(number as u64)
                .await
                .map_err(|e| Self::classify_octocrab_error(&e))?;
            Ok(PullRequestInfo {
                number,
                title: pr.title.unwrap_or_default(),
                head_ref: pr.head.ref_field,
                base_ref: pr.base.ref_field,
                head_sha: pr.head.sha,
                merge_conflict: pr.mergeable == Some(false),
                labels: pr
                    .labels
                    .unwrap_or_default()
                    .into_iter()
                    .map(|l| l.name)
                    .collect(),
            })
        })
        .await
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<PullRequestInfo, GitHubError> {
        Self::with_retry(|| async {
            let pr = self
                .octocrab
                .pulls(owner, repo)
                .create(title, head, base)
                .body(body)
                .send()
                .await
                .map_err(|e| Self::classify_octocrab_error(&e))?;
            Ok(PullRequestInfo {
                number: pr.number as i64,
                title: pr.title.unwrap_or_default(),
                head_ref: pr.head.ref_field,
                base_ref: pr.base.ref_field,
                head_sha: pr.head.sha,
                merge_conflict: pr.mergeable == Some(false),
                labels: pr
                    .labels
                    .unwrap_or_default()
                    .into_iter()
                    .map(|l| l.name)
                    .collect(),
            })
        })
        .await
    }

    async fn labels(&self, owner: &str, repo: &str) -> Result<Vec<String>, GitHubError> {
        Self::with_retry(|| async {
            let page = self
                .octocrab
                .issues(owner, repo)
                .list_labels_for_repo()
                .send()
                .await
                .map_err(|e| Self::classify_octocrab_error(&e))?;
            Ok(page.items.into_iter().map(|l| l.name).collect())
        })
        .await
    }

    async fn create_label(&self, owner: &str, repo: &str, name: &str, color: &str) -> Result<(), GitHubError> {
        Self::with_retry(|| async {
            self.octocrab
                .issues(owner, repo)
                .create_label(name, color, "")
                .await
                .map(|_| ())
                .map_err(|e| Self::classify_octocrab_error(&e))
        })
        .await
    }

    async fn add_labels_to_issue(&self, owner: &str, repo: &str, number: i64, labels: &[String]) -> Result<(), GitHubError> {
        Self::with_retry(|| async {
            self.octocrab
                .issues(owner, repo)
                .add_labels(number as u64, labels)
                .await
                .map(|_| ())
                .map_err(|e| Self::classify_octocrab_error(&e))
        })
        .await
    }

    async fn remove_label_from_issue(&self, owner: &str, repo: &str, number: i64, label: &str) -> Result<(), GitHubError> {
        Self::with_retry(|| async {
            self.octocrab
                .issues(owner, repo)
                .remove_label(number as u64, label)
                .await
                .map(|_| ())
                .map_err(|e| Self::classify_octocrab_error(&e))
        })
        .await
    }

    async fn add_comment(&self, owner: &str, repo: &str, number: i64, body: &str) -> Result<(), GitHubError> {
        Self::with_retry(|| async {
            self.octocrab
                .issues(owner, repo)
                .create_comment(number as u64, body)
                .await
                .map(|_| ())
                .map_err(|e| Self::classify_octocrab_error(&e))
        })
        .await
    }

    async fn check_runs_for_ref(&self, owner: &str, repo: &str, sha: &str) -> Result<Vec<CheckRunInfo>, GitHubError> {
        Self::with_retry(|| async {
            let route = format!("/repos/{owner}/{repo}/commits/{sha}/check-runs");
            let response: serde_json::Value = self
                .octocrab
                .get(route, None::<&()>)
                .await
                .map_err(|e| Self::classify_octocrab_error(&e))?;
            let runs = response["check_runs"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|r| CheckRunInfo {
                    name: r["name"].as_str().unwrap_or_default().to_string(),
                    status: r["status"].as_str().unwrap_or_default().to_string(),
                    conclusion: r["conclusion"].as_str().map(|s| s.to_string()),
                })
                .collect();
            Ok(runs)
        })
        .await
    }

    async fn issue_comments(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<CommentInfo>, GitHubError> {
        Self::with_retry(|| async {
            let page = self
                .octocrab
                .issues(owner, repo)
                .list_comments(number as u64)
                .send()
                .await
                .map_err(|e| Self::classify_octocrab_error(&e))?;
            Ok(page
                .items
                .into_iter()
                .map(|c| CommentInfo {
                    id: c.id.0 as i64,
                    author_login: c.user.login,
                    body: c.body.unwrap_or_default(),
                })
                .collect())
        })
        .await
    }

    async fn review_threads(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<ReviewThread>, GitHubError> {
        Self::with_retry(|| async { self.graphql.review_threads(owner, repo, number).await }).await
    }

    async fn resolve_review_thread(&self, node_id: &str) -> Result<(), GitHubError> {
        Self::with_retry(|| async { self.graphql.resolve_review_thread(node_id).await }).await
    }

    async fn pull_request_reviews(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<ReviewInfo>, GitHubError> {
        Self::with_retry(|| async {
            let reviews = self
                .octocrab
                .pulls(owner, repo)
                .list_reviews(number as u64)
                .send()
                .await
                .map_err(|e| Self::classify_octocrab_error(&e))?;
            Ok(reviews
                .items
                .into_iter()
                .map(|r| ReviewInfo {
                    author_login: r.user.map(|u| u.login).unwrap_or_default(),
                    state: r
                        .state
                        .map(|s| format!("{s:?}").to_lowercase())
                        .unwrap_or_default(),
                    body: r.body,
                    submitted_at: r.submitted_at,
                })
                .collect())
        })
        .await
    }

    async fn create_pull_request_comment_reply(
        &self,
        owner: &str,
        repo: &str,
        comment_id: i64,
        body: &str,
    ) -> Result<(), GitHubError> {
        Self::with_retry(|| async {
            let route = format!("/repos/{owner}/{repo}/pulls/comments/{comment_id}/replies");
            self.octocrab
                .post::<_, serde_json::Value>(route, Some(&serde_json::json!({ "body": body })))
                .await
                .map(|_| ())
                .map_err(|e| Self::classify_octocrab_error(&e))
        })
        .await
    }

    async fn rate_limit_remaining(&self) -> Result<u32, GitHubError> {
        Self::with_retry(|| async {
            let rl = self
                .octocrab
                .ratelimit()
                .get()
                .await
                .map_err(|e| Self::classify_octocrab_error(&e))?;
            Ok(rl.resources.core.remaining as u32)
        })
        .await
    }

    async fn rate_limit_low(&self, threshold: u32) -> Result<bool, GitHubError> {
        Ok(self.rate_limit_remaining().await? <= threshold)
    }
}
