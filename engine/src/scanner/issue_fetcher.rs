//! FetchIssues (C6, spec §4.6).

use std::collections::HashSet;

use crate::error::GitHubError;
use crate::github::client::{GithubOperations, IssueInfo};
use crate::models::issue::{GithubState, Issue};
use crate::models::project::Project;

const MAX_PAGES: u32 = 10;
const PER_PAGE_LABELS_STATE: &str = "open";

#[derive(Debug, Clone)]
pub struct FetchedIssueSummary {
    pub github_number: i64,
    pub is_pull_request: bool,
    pub trusted: bool,
}

/// Sync every open issue/PR for `project` into the local `Issue` table.
///
/// Untrusted creators still get an Issue row (title/labels/metadata preserved for
/// scanning and auditing) but the body is dropped before it is ever persisted, so it
/// can never reach a prompt (spec invariant 2).
pub async fn fetch_issues(
    pool: &sqlx::PgPool,
    github: &dyn GithubOperations,
    project: &Project,
) -> Result<Vec<FetchedIssueSummary>, GitHubError> {
    let labels: Vec<String> = project
        .label_mappings
        .values()
        .cloned()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let mut summaries = Vec::new();
    let mut seen_github_issue_ids = Vec::new();
    let mut page = 1u32;

    loop {
        if page > MAX_PAGES {
            tracing::warn!(owner = %project.owner, repo = %project.repo, "hit MAX_PAGES while fetching issues");
            break;
        }

        let items: Vec<IssueInfo> = match github
            .issues(
                &project.owner,
                &project.repo,
                Some(&labels),
                Some(PER_PAGE_LABELS_STATE),
                page,
            )
            .await
        {
            Ok(items) => items,
            Err(GitHubError::RateLimit(reset_at)) => {
                return Err(GitHubError::RateLimit(reset_at));
            }
            Err(other) => return Err(other),
        };

        if items.is_empty() {
            break;
        }

        for item in &items {
            seen_github_issue_ids.push(item.number);
            let trusted = project.is_trusted(&item.creator_login);
            let body = if trusted {
                item.body.as_deref()
            } else {
                tracing::warn!(
                    login = %item.creator_login,
                    number = item.number,
                    "dropping body for untrusted issue creator"
                );
                None
            };

            let labels_set: HashSet<String> = item.labels.iter().cloned().collect();
            Issue::upsert(
                pool,
                project.id,
                item.number,
                item.number,
                &item.title,
                body,
                &labels_set,
                if item.state == "closed" {
                    GithubState::Closed
                } else {
                    GithubState::Open
                },
                item.is_pull_request,
                &item.creator_login,
            )
            .await
            .map_err(|e| GitHubError::Transport(e.to_string()))?;

            summaries.push(FetchedIssueSummary {
                github_number: item.number,
                is_pull_request: item.is_pull_request,
                trusted,
            });
        }

        page += 1;
    }

    Issue::mark_closed_if_missing(pool, project.id, &seen_github_issue_ids)
        .await
        .map_err(|e| GitHubError::Transport(e.to_string()))?;

    Ok(summaries)
}
