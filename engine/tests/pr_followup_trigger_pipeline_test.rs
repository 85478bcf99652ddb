//! Cross-module integration test: the full follow-up trigger pipeline a real PR scan
//! tick exercises (Project trust rules -> pr_scanner -> prompt builder), none of which
//! needs a database connection.

use paid_orchestrator::github::client::{CheckRunInfo, CommentInfo, PullRequestInfo, ReviewInfo};
use paid_orchestrator::github::graphql::{ReviewThread, ReviewThreadComment};
use paid_orchestrator::models::project::{Project, Stage};
use paid_orchestrator::prompt::{build_pr_follow_up_prompt, PrFollowUpInput};
use paid_orchestrator::scanner::{evaluate_triggers, is_eligible, PrScanInput};
use std::collections::{HashMap, HashSet};

fn project() -> Project {
    Project {
        id: uuid::Uuid::new_v4(),
        account_id: uuid::Uuid::new_v4(),
        github_token_id: uuid::Uuid::new_v4(),
        owner: "acme".to_string(),
        repo: "widgets".to_string(),
        github_id: 42,
        default_branch: "main".to_string(),
        active: true,
        poll_interval_seconds: 120,
        label_mappings: HashMap::from([(Stage::Build, "paid-build".to_string())]),
        pr_action_labels: HashSet::from(["needs-agent".to_string()]),
        allowed_github_usernames: HashSet::from(["alice".to_string()]),
        auto_scan_prs: true,
        auto_fix_merge_conflicts: false,
        max_pr_followup_runs: 3,
        total_cost_cents: 0,
        total_tokens_used: 0,
        detected_language: "rust".to_string(),
    }
}

fn pr() -> PullRequestInfo {
    PullRequestInfo {
        number: 17,
        title: "Fix widget overflow".to_string(),
        head_ref: "paid/issue-9".to_string(),
        base_ref: "main".to_string(),
        head_sha: "abc123".to_string(),
        merge_conflict: false,
        labels: vec![],
    }
}

/// A PR with a failed check run and an unresolved review thread from a trusted,
/// non-bot reviewer should trigger a follow-up run, and the resulting prompt should
/// name both signals so the agent knows what to address.
#[test]
fn ci_failure_and_unresolved_thread_together_schedule_a_followup_with_both_signals() {
    let project = project();
    let scan_input = PrScanInput {
        issue_id: uuid::Uuid::new_v4(),
        pr: &pr(),
        last_completed_at: None,
        pr_followup_count: 1,
        has_active_run: false,
    };
    assert!(is_eligible(&scan_input, &project));

    let check_runs = vec![CheckRunInfo {
        name: "ci".to_string(),
        status: "completed".to_string(),
        conclusion: Some("failure".to_string()),
    }];
    let review_threads = vec![ReviewThread {
        id: "RT_1".to_string(),
        is_resolved: false,
        comments: vec![ReviewThreadComment {
            body: "This branch doesn't handle negative widths.".to_string(),
            path: Some("src/widget.rs".to_string()),
            line: Some(12),
            author: Some("alice".to_string()),
        }],
    }];

    let triggers = evaluate_triggers(
        &project,
        &pr(),
        &check_runs,
        &review_threads,
        &[],
        |_| chrono::Utc::now(),
        &[],
        None,
    );

    assert!(triggers.any());
    assert!(triggers.ci_failure);
    assert!(triggers.review_threads);
    assert!(!triggers.actionable_labels);

    let pr = pr();
    let prompt_input = PrFollowUpInput {
        pr_number: pr.number,
        pr_title: &pr.title,
        base_branch: &pr.base_ref,
        pr_body: "",
        linked_issue: None,
        rebase_failed: false,
        check_runs: &check_runs,
        review_threads: &review_threads,
        conversation_comments: &[],
        detected_language: Some(project.detected_language.as_str()),
    };
    let prompt = build_pr_follow_up_prompt(&prompt_input);
    assert!(prompt.contains("CI Failures"));
    assert!(prompt.contains("negative widths"));
}

/// A review thread from an untrusted (non-allow-listed) author must never contribute
/// to scheduling a follow-up, even though the thread itself is unresolved.
#[test]
fn untrusted_reviewer_cannot_trigger_a_followup() {
    let project = project();
    let review_threads = vec![ReviewThread {
        id: "RT_2".to_string(),
        is_resolved: false,
        comments: vec![ReviewThreadComment {
            body: "looks sketchy to me".to_string(),
            path: None,
            line: None,
            author: Some("random-passerby".to_string()),
        }],
    }];

    let triggers = evaluate_triggers(&project, &pr(), &[], &review_threads, &[], |_| chrono::Utc::now(), &[], None);
    assert!(!triggers.any());
}

/// A bot comment (even from a trusted-looking login ending in `[bot]`) never triggers
/// a conversation-comment follow-up.
#[test]
fn bot_comments_never_trigger_followup() {
    let mut project = project();
    project.allowed_github_usernames.insert("alice-ci[bot]".to_string());

    let comments = vec![CommentInfo {
        id: 1,
        author_login: "alice-ci[bot]".to_string(),
        body: "All checks look fine from my side, nothing further needed here.".to_string(),
    }];
    let triggers = evaluate_triggers(&project, &pr(), &[], &[], &comments, |_| chrono::Utc::now(), &[], None);
    assert!(!triggers.conversation_comments);
}

/// `changes_requested` reviews only count when authored by a trusted, non-bot login.
#[test]
fn changes_requested_only_counts_from_trusted_human_reviewer() {
    let project = project();
    let reviews = vec![
        ReviewInfo {
            author_login: "random-passerby".to_string(),
            state: "CHANGES_REQUESTED".to_string(),
            body: None,
            submitted_at: Some(chrono::Utc::now()),
        },
        ReviewInfo {
            author_login: "alice".to_string(),
            state: "changes_requested".to_string(),
            body: Some("please rename this".to_string()),
            submitted_at: Some(chrono::Utc::now()),
        },
    ];
    let triggers = evaluate_triggers(&project, &pr(), &[], &[], &[], |_| chrono::Utc::now(), &reviews, None);
    assert!(triggers.changes_requested);
}

/// A trusted reviewer's old `CHANGES_REQUESTED` review, since superseded by their own
/// later approval, must not keep re-triggering follow-up runs after it was already
/// addressed by a completed run.
#[test]
fn stale_changes_requested_review_does_not_retrigger_after_completion() {
    let project = project();
    let last_completed_at = chrono::Utc::now();
    let reviews = vec![
        ReviewInfo {
            author_login: "alice".to_string(),
            state: "changes_requested".to_string(),
            body: Some("please rename this".to_string()),
            submitted_at: Some(last_completed_at - chrono::Duration::hours(1)),
        },
        ReviewInfo {
            author_login: "alice".to_string(),
            state: "approved".to_string(),
            body: None,
            submitted_at: Some(last_completed_at - chrono::Duration::minutes(30)),
        },
    ];
    let triggers = evaluate_triggers(
        &project,
        &pr(),
        &[],
        &[],
        &[],
        |_| chrono::Utc::now(),
        &reviews,
        Some(last_completed_at),
    );
    assert!(!triggers.changes_requested);
}

/// A fresh `CHANGES_REQUESTED` review submitted after the last completed run does
/// re-trigger a follow-up, even though an older review from the same author exists.
#[test]
fn changes_requested_after_last_completion_retriggers() {
    let project = project();
    let last_completed_at = chrono::Utc::now();
    let reviews = vec![
        ReviewInfo {
            author_login: "alice".to_string(),
            state: "approved".to_string(),
            body: None,
            submitted_at: Some(last_completed_at - chrono::Duration::hours(1)),
        },
        ReviewInfo {
            author_login: "alice".to_string(),
            state: "changes_requested".to_string(),
            body: Some("actually, one more thing".to_string()),
            submitted_at: Some(last_completed_at + chrono::Duration::minutes(5)),
        },
    ];
    let triggers = evaluate_triggers(
        &project,
        &pr(),
        &[],
        &[],
        &[],
        |_| chrono::Utc::now(),
        &reviews,
        Some(last_completed_at),
    );
    assert!(triggers.changes_requested);
}

/// A PR that already has an active run, or is past the follow-up cap, is never
/// eligible regardless of how many triggers would otherwise fire.
#[test]
fn ineligible_prs_are_filtered_before_trigger_evaluation() {
    let project = project();
    let active_run = PrScanInput {
        issue_id: uuid::Uuid::new_v4(),
        pr: &pr(),
        last_completed_at: None,
        pr_followup_count: 0,
        has_active_run: true,
    };
    assert!(!is_eligible(&active_run, &project));

    let over_cap = PrScanInput {
        issue_id: uuid::Uuid::new_v4(),
        pr: &pr(),
        last_completed_at: None,
        pr_followup_count: project.max_pr_followup_runs,
        has_active_run: false,
    };
    assert!(!is_eligible(&over_cap, &project));
}
