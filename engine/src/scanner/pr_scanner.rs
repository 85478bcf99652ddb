//! ScanPaidPrs (C6, spec §4.6): detects PAID-generated PRs that need a follow-up run.

use chrono::{DateTime, Utc};

use crate::github::client::{GithubOperations, PullRequestInfo};
use crate::models::project::Project;

const MIN_COMMENT_LEN: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Triggers {
    pub ci_failure: bool,
    pub review_threads: bool,
    pub conversation_comments: bool,
    pub changes_requested: bool,
    pub actionable_labels: bool,
    pub merge_conflicts: bool,
}

impl Triggers {
    pub fn any(&self) -> bool {
        self.ci_failure
            || self.review_threads
            || self.conversation_comments
            || self.changes_requested
            || self.merge_conflicts
            || self.actionable_labels
    }
}

#[derive(Debug, Clone)]
pub struct PrFollowUpCandidate {
    pub issue_id: uuid::Uuid,
    pub pr_number: i64,
    pub triggers: Triggers,
}

/// Candidate input bundle for one PR, already fetched from GitHub by the caller so
/// this function stays pure and trivially testable.
pub struct PrScanInput<'a> {
    pub issue_id: uuid::Uuid,
    pub pr: &'a PullRequestInfo,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub pr_followup_count: i32,
    pub has_active_run: bool,
}

fn ci_failure(check_runs: &[crate::github::client::CheckRunInfo]) -> bool {
    if check_runs.is_empty() {
        return false;
    }
    if check_runs.iter().any(|r| r.conclusion.is_none()) {
        return false;
    }
    check_runs
        .iter()
        .any(|r| matches!(r.conclusion.as_deref(), Some("failure") | Some("cancelled") | Some("timed_out")))
}

fn review_threads_trigger(
    threads: &[crate::github::graphql::ReviewThread],
    project: &Project,
) -> bool {
    threads.iter().any(|t| {
        !t.is_resolved
            && t.comments.iter().any(|c| {
                c.author
                    .as_deref()
                    .map(|login| {
                        project.is_trusted(login) && !crate::models::issue::Issue::is_bot_login(login)
                    })
                    .unwrap_or(false)
            })
    })
}

fn conversation_comments_trigger(
    comments: &[crate::github::client::CommentInfo],
    project: &Project,
    last_completed_at: Option<DateTime<Utc>>,
    comment_created_at: impl Fn(&crate::github::client::CommentInfo) -> DateTime<Utc>,
) -> bool {
    comments.iter().any(|c| {
        project.is_trusted(&c.author_login)
            && !crate::models::issue::Issue::is_bot_login(&c.author_login)
            && c.body.trim().len() >= MIN_COMMENT_LEN
            && last_completed_at.map(|t| comment_created_at(c) > t).unwrap_or(true)
    })
}

/// Only the latest review per trusted, non-bot author counts, and only if it was
/// submitted after the last completed run: an old `CHANGES_REQUESTED` review that was
/// since superseded (by the same or a different review) must not re-trigger follow-up
/// runs forever.
fn changes_requested_trigger(
    reviews: &[crate::github::client::ReviewInfo],
    project: &Project,
    last_completed_at: Option<DateTime<Utc>>,
) -> bool {
    use std::collections::HashMap;

    let mut latest_by_author: HashMap<&str, &crate::github::client::ReviewInfo> = HashMap::new();
    for review in reviews {
        if !project.is_trusted(&review.author_login) || crate::models::issue::Issue::is_bot_login(&review.author_login) {
            continue;
        }
        latest_by_author
            .entry(review.author_login.as_str())
            .and_modify(|latest| {
                if review.submitted_at > latest.submitted_at {
                    *latest = review;
                }
            })
            .or_insert(review);
    }

    latest_by_author.values().any(|r| {
        r.state.eq_ignore_ascii_case("changes_requested")
            && last_completed_at
                .map(|completed| r.submitted_at.map(|s| s > completed).unwrap_or(true))
                .unwrap_or(true)
    })
}

fn actionable_labels_trigger(pr_labels: &[String], project: &Project) -> bool {
    pr_labels.iter().any(|l| project.pr_action_labels.contains(l))
}

/// Evaluate all six triggers for one PR. Callers should have already filtered out PRs
/// with an active run or `pr_followup_count >= max_pr_followup_runs` (spec §4.6).
#[allow(clippy::too_many_arguments)]
pub fn evaluate_triggers(
    project: &Project,
    pr: &PullRequestInfo,
    check_runs: &[crate::github::client::CheckRunInfo],
    review_threads: &[crate::github::graphql::ReviewThread],
    conversation_comments: &[crate::github::client::CommentInfo],
    comment_created_at: impl Fn(&crate::github::client::CommentInfo) -> DateTime<Utc>,
    reviews: &[crate::github::client::ReviewInfo],
    last_completed_at: Option<DateTime<Utc>>,
) -> Triggers {
    Triggers {
        ci_failure: ci_failure(check_runs),
        review_threads: review_threads_trigger(review_threads, project),
        conversation_comments: conversation_comments_trigger(
            conversation_comments,
            project,
            last_completed_at,
            comment_created_at,
        ),
        changes_requested: changes_requested_trigger(reviews, project, last_completed_at),
        actionable_labels: actionable_labels_trigger(&pr.labels, project),
        merge_conflicts: project.auto_fix_merge_conflicts && pr.merge_conflict,
    }
}

/// Whether this PR is eligible to even be scanned (spec §4.6: skip active runs and
/// runs already at the follow-up cap).
pub fn is_eligible(input: &PrScanInput<'_>, project: &Project) -> bool {
    !input.has_active_run && input.pr_followup_count < project.max_pr_followup_runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::client::CheckRunInfo;
    use std::collections::{HashMap, HashSet};

    fn project() -> Project {
        Project {
            id: uuid::Uuid::new_v4(),
            account_id: uuid::Uuid::new_v4(),
            github_token_id: uuid::Uuid::new_v4(),
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            github_id: 1,
            default_branch: "main".to_string(),
            active: true,
            poll_interval_seconds: 60,
            label_mappings: HashMap::new(),
            pr_action_labels: HashSet::from(["needs-agent".to_string()]),
            allowed_github_usernames: HashSet::from(["alice".to_string()]),
            auto_scan_prs: true,
            auto_fix_merge_conflicts: true,
            max_pr_followup_runs: 3,
            total_cost_cents: 0,
            total_tokens_used: 0,
            detected_language: "ruby".to_string(),
        }
    }

    #[test]
    fn ci_failure_requires_all_conclusions_present() {
        let pending = vec![CheckRunInfo {
            name: "build".to_string(),
            status: "in_progress".to_string(),
            conclusion: None,
        }];
        assert!(!ci_failure(&pending));

        let failed = vec![CheckRunInfo {
            name: "build".to_string(),
            status: "completed".to_string(),
            conclusion: Some("failure".to_string()),
        }];
        assert!(ci_failure(&failed));

        let all_passed = vec![CheckRunInfo {
            name: "build".to_string(),
            status: "completed".to_string(),
            conclusion: Some("success".to_string()),
        }];
        assert!(!ci_failure(&all_passed));
    }

    #[test]
    fn actionable_labels_trigger_matches_project_config() {
        let project = project();
        assert!(actionable_labels_trigger(&["needs-agent".to_string()], &project));
        assert!(!actionable_labels_trigger(&["unrelated".to_string()], &project));
    }

    #[test]
    fn merge_conflicts_trigger_requires_auto_fix_enabled() {
        let mut project = project();
        let pr = PullRequestInfo {
            number: 1,
            title: "t".to_string(),
            head_ref: "h".to_string(),
            base_ref: "main".to_string(),
            head_sha: "sha".to_string(),
            merge_conflict: true,
            labels: vec![],
        };
        let triggers = evaluate_triggers(&project, &pr, &[], &[], &[], |_| Utc::now(), &[], None);
        assert!(triggers.merge_conflicts);

        project.auto_fix_merge_conflicts = false;
        let triggers = evaluate_triggers(&project, &pr, &[], &[], &[], |_| Utc::now(), &[], None);
        assert!(!triggers.merge_conflicts);
    }
}
