//! GraphQL v4 calls octocrab has no typed surface for (spec §4.4): review threads.

use serde::{Deserialize, Serialize};

use crate::error::GitHubError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewThreadComment {
    pub body: String,
    pub path: Option<String>,
    pub line: Option<i32>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewThread {
    pub id: String,
    pub is_resolved: bool,
    pub comments: Vec<ReviewThreadComment>,
}

const REVIEW_THREADS_QUERY: &str = r#"
query($owner: String!, $repo: String!, $number: Int!, $cursor: String) {
  repository(owner: $owner, name: $repo) {
    pullRequest(number: $number) {
      reviewThreads(first: 50, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id
          isResolved
          comments(first: 20) {
            nodes { body path line author { login } }
          }
        }
      }
    }
  }
}
"#;

const RESOLVE_THREAD_MUTATION: &str = r#"
mutation($threadId: ID!) {
  resolveReviewThread(input: { threadId: $threadId }) {
    thread { id isResolved }
  }
}
"#;

pub struct GraphQlClient {
    http: reqwest::Client,
    token: String,
}

impl GraphQlClient {
    pub fn new(http: reqwest::Client, token: String) -> Self {
        Self { http, token }
    }

    async fn post(&self, query: &str, variables: serde_json::Value) -> Result<serde_json::Value, GitHubError> {
        let response = self
            .http
            .post("https://api.github.com/graphql")
            .bearer_auth(&self.token)
            .header("User-Agent", "paid-orchestrator")
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| GitHubError::Transport(e.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GitHubError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(GitHubError::Api(status.as_u16()));
        }
        if let Some(errors) = body.get("errors") {
            return Err(GitHubError::GraphQl(errors.to_string()));
        }
        Ok(body)
    }

    pub async fn review_threads(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<ReviewThread>, GitHubError> {
        let mut threads = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let body = self
                .post(
                    REVIEW_THREADS_QUERY,
                    serde_json::json!({
                        "owner": owner,
                        "repo": repo,
                        "number": number,
                        "cursor": cursor,
                    }),
                )
                .await?;

            let review_threads = &body["data"]["repository"]["pullRequest"]["reviewThreads"];
            let nodes = review_threads["nodes"].as_array().cloned().unwrap_or_default();
            for node in nodes {
                let comments = node["comments"]["nodes"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|c| ReviewThreadComment {
                        body: c["body"].as_str().unwrap_or_default().to_string(),
                        path: c["path"].as_str().map(|s| s.to_string()),
                        line: c["line"].as_i64().map(|v| v as i32),
                        author: c["author"]["login"].as_str().map(|s| s.to_string()),
                    })
                    .collect();
                threads.push(ReviewThread {
                    id: node["id"].as_str().unwrap_or_default().to_string(),
                    is_resolved: node["isResolved"].as_bool().unwrap_or(false),
                    comments,
                });
            }

            let page_info = &review_threads["pageInfo"];
            if page_info["hasNextPage"].as_bool().unwrap_or(false) {
                cursor = page_info["endCursor"].as_str().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(threads)
    }

    pub async fn resolve_review_thread(&self, node_id: &str) -> Result<(), GitHubError> {
        self.post(
            RESOLVE_THREAD_MUTATION,
            serde_json::json!({ "threadId": node_id }),
        )
        .await?;
        Ok(())
    }
}
