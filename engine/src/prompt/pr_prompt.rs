//! PR follow-up prompt construction (spec §4.5).

use crate::github::client::{CheckRunInfo, CommentInfo};
use crate::github::graphql::ReviewThread;
use crate::models::issue::Issue;
use crate::prompt::languages::{commands_for, DEFAULT_LANGUAGE};

const MIN_COMMENT_LEN: usize = 20;

pub struct PrFollowUpInput<'a> {
    pub pr_number: i64,
    pub pr_title: &'a str,
    pub base_branch: &'a str,
    pub pr_body: &'a str,
    pub linked_issue: Option<&'a Issue>,
    pub rebase_failed: bool,
    pub check_runs: &'a [CheckRunInfo],
    pub review_threads: &'a [ReviewThread],
    pub conversation_comments: &'a [CommentInfo],
    pub detected_language: Option<&'a str>,
}

fn is_bot_login(login: &str) -> bool {
    Issue::is_bot_login(login)
}

fn failing_check_runs(runs: &[CheckRunInfo]) -> Vec<&CheckRunInfo> {
    runs.iter()
        .filter(|r| matches!(r.conclusion.as_deref(), Some("failure") | Some("timed_out") | Some("cancelled")))
        .collect()
}

fn unresolved_threads(threads: &[ReviewThread]) -> Vec<&ReviewThread> {
    threads.iter().filter(|t| !t.is_resolved).collect()
}

/// Build the PR follow-up prompt. Only non-empty sections are included, and the
/// Instructions section is assembled last so its numbering reflects which sections
/// actually fired (spec §4.5).
pub fn build_pr_follow_up_prompt(input: &PrFollowUpInput<'_>) -> String {
    let mut sections = Vec::new();
    let mut instruction_lines = Vec::new();

    sections.push(format!(
        "## Task\n\n{} (#{}) targeting `{}`\n\n{}",
        input.pr_title, input.pr_number, input.base_branch, input.pr_body
    ));

    if let Some(issue) = input.linked_issue {
        sections.push(format!(
            "## Issue Requirements\n\n{} (#{})\n\n{}",
            issue.title,
            issue.github_number,
            issue.body.as_deref().unwrap_or_default()
        ));
    }

    if input.rebase_failed {
        sections.push(format!(
            "## Merge Conflicts\n\nRebase failed. Run `git merge origin/{}` and resolve the conflicts manually.",
            input.base_branch
        ));
        instruction_lines.push("Resolve the merge conflicts described above.".to_string());
    }

    let failing = failing_check_runs(input.check_runs);
    if !failing.is_empty() {
        let mut body = String::from("## CI Failures\n\n");
        for run in &failing {
            body.push_str(&format!(
                "- `{}`: {}\n",
                run.name,
                run.conclusion.as_deref().unwrap_or("failed")
            ));
        }
        sections.push(body.trim_end().to_string());
        instruction_lines.push("Fix the failing CI checks listed above.".to_string());
    }

    let unresolved = unresolved_threads(input.review_threads);
    if !unresolved.is_empty() {
        let mut body = String::from("## Code Review Comments\n\n");
        for thread in &unresolved {
            for comment in &thread.comments {
                if comment
                    .author
                    .as_deref()
                    .map(is_bot_login)
                    .unwrap_or(false)
                {
                    continue;
                }
                let location = match (&comment.path, comment.line) {
                    (Some(path), Some(line)) => format!("{path}:{line}"),
                    (Some(path), None) => path.clone(),
                    _ => "general".to_string(),
                };
                body.push_str(&format!("- [{location}] {}\n", comment.body));
            }
        }
        if body.trim_end() != "## Code Review Comments" {
            sections.push(body.trim_end().to_string());
            instruction_lines.push("Address the unresolved review comments above.".to_string());
        }
    }

    let relevant_comments: Vec<&CommentInfo> = input
        .conversation_comments
        .iter()
        .filter(|c| !is_bot_login(&c.author_login) && c.body.trim().len() >= MIN_COMMENT_LEN)
        .collect();
    if !relevant_comments.is_empty() {
        let mut body = String::from("## Conversation Comments\n\n");
        for comment in &relevant_comments {
            body.push_str(&format!("- {}: {}\n", comment.author_login, comment.body));
        }
        sections.push(body.trim_end().to_string());
        instruction_lines.push("Take the conversation feedback above into account.".to_string());
    }

    let language = input.detected_language.unwrap_or(DEFAULT_LANGUAGE);
    let commands = commands_for(language);
    instruction_lines.push(format!("Run `{}`.", commands.test_cmd));
    instruction_lines.push(format!("Run `{}`.", commands.lint_cmd));
    instruction_lines.push("Commit your changes.".to_string());

    let numbered_instructions: String = instruction_lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}. {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n");
    sections.push(format!("## Instructions\n\n{numbered_instructions}"));

    sections.push(
        "## Rules\n\n\
         - Lint and tests MUST pass before every commit.\n\
         - Never use `--no-verify`.\n\
         - Never disable linters.\n\
         - Fix issues forward; do not revert unrelated work.\n\
         - Match the existing code style.\n\
         - Do not push; the orchestrator pushes on your behalf."
            .to_string(),
    );

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> PrFollowUpInput<'static> {
        PrFollowUpInput {
            pr_number: 7,
            pr_title: "Fix the bug",
            base_branch: "main",
            pr_body: "Closes #3",
            linked_issue: None,
            rebase_failed: false,
            check_runs: &[],
            review_threads: &[],
            conversation_comments: &[],
            detected_language: Some("rust"),
        }
    }

    #[test]
    fn omits_optional_sections_when_empty() {
        let prompt = build_pr_follow_up_prompt(&base_input());
        assert!(!prompt.contains("Merge Conflicts"));
        assert!(!prompt.contains("CI Failures"));
        assert!(!prompt.contains("Code Review Comments"));
        assert!(!prompt.contains("Conversation Comments"));
    }

    #[test]
    fn includes_merge_conflicts_section_when_rebase_failed() {
        let mut input = base_input();
        input.rebase_failed = true;
        let prompt = build_pr_follow_up_prompt(&input);
        assert!(prompt.contains("Merge Conflicts"));
        assert!(prompt.contains("git merge origin/main"));
    }

    #[test]
    fn excludes_bot_comments_from_conversation_section() {
        let mut input = base_input();
        let comments = vec![
            CommentInfo {
                id: 1,
                author_login: "dependabot[bot]".to_string(),
                body: "This is a long enough comment from a bot".to_string(),
            },
            CommentInfo {
                id: 2,
                author_login: "alice".to_string(),
                body: "This is a long enough comment from a human".to_string(),
            },
        ];
        input.conversation_comments = &comments;
        let prompt = build_pr_follow_up_prompt(&input);
        assert!(prompt.contains("alice"));
        assert!(!prompt.contains("dependabot"));
    }

    #[test]
    fn excludes_short_conversation_comments() {
        let mut input = base_input();
        let comments = vec![CommentInfo {
            id: 1,
            author_login: "alice".to_string(),
            body: "short".to_string(),
        }];
        input.conversation_comments = &comments;
        let prompt = build_pr_follow_up_prompt(&input);
        assert!(!prompt.contains("Conversation Comments"));
    }
}
