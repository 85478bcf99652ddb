//! Issue-mode prompt construction (spec §4.5).

use crate::error::PromptError;
use crate::prompt::languages::{commands_for, DEFAULT_LANGUAGE};

const MAX_CHUNKS: usize = 10;
const MAX_CHUNK_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct CodebaseChunk {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub chunk_type: String,
    pub identifier: String,
    pub content: String,
    pub language: String,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn render_context_section(chunks: &[CodebaseChunk]) -> Option<String> {
    if chunks.is_empty() {
        return None;
    }

    let mut section = String::from("## Relevant Codebase Context\n\n");
    for chunk in chunks.iter().take(MAX_CHUNKS) {
        section.push_str(&format!(
            "## {}:{}-{} ({}: {})\n```{}\n{}\n```\n\n",
            chunk.file,
            chunk.start_line,
            chunk.end_line,
            chunk.chunk_type,
            chunk.identifier,
            chunk.language,
            truncate_chars(&chunk.content, MAX_CHUNK_CHARS),
        ));
    }
    Some(section.trim_end().to_string())
}

/// Build the issue-implementation prompt. `codebase_chunks` is the caller's best-effort
/// result from the external search component; an empty slice silently yields no context
/// section, matching the "silent failures fall back to no context" rule.
pub fn build_issue_prompt(
    trusted: bool,
    issue_number: i64,
    issue_title: &str,
    issue_body: &str,
    detected_language: Option<&str>,
    codebase_chunks: &[CodebaseChunk],
) -> Result<String, PromptError> {
    if !trusted {
        return Err(PromptError::UntrustedIssue);
    }

    let language = detected_language.unwrap_or(DEFAULT_LANGUAGE);
    let commands = commands_for(language);

    let mut sections = Vec::new();

    sections.push(format!("## Task\n\n{issue_title} (#{issue_number})\n\n{issue_body}"));

    if let Some(context) = render_context_section(codebase_chunks) {
        sections.push(context);
    }

    sections.push(format!(
        "## Instructions\n\n1. Analyze the issue and the relevant code.\n2. Implement a fix.\n3. Run `{}`.\n4. Run `{}`.\n5. Commit your changes.",
        commands.test_cmd, commands.lint_cmd
    ));

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

    Ok(sections.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_untrusted_issue() {
        let err = build_issue_prompt(false, 1, "t", "b", None, &[]).unwrap_err();
        assert!(matches!(err, PromptError::UntrustedIssue));
    }

    #[test]
    fn defaults_to_ruby_commands_when_language_unset() {
        let prompt = build_issue_prompt(true, 1, "Title", "Body", None, &[]).unwrap();
        assert!(prompt.contains("bundle exec rspec"));
        assert!(prompt.contains("bundle exec rubocop"));
    }

    #[test]
    fn includes_at_most_ten_chunks() {
        let chunks: Vec<CodebaseChunk> = (0..15)
            .map(|i| CodebaseChunk {
                file: format!("file{i}.rs"),
                start_line: 1,
                end_line: 2,
                chunk_type: "function".to_string(),
                identifier: format!("f{i}"),
                content: "fn f() {}".to_string(),
                language: "rust".to_string(),
            })
            .collect();
        let prompt = build_issue_prompt(true, 1, "Title", "Body", Some("rust"), &chunks).unwrap();
        assert_eq!(prompt.matches("## file").count(), MAX_CHUNKS);
    }

    #[test]
    fn omits_context_section_when_no_chunks() {
        let prompt = build_issue_prompt(true, 1, "Title", "Body", Some("rust"), &[]).unwrap();
        assert!(!prompt.contains("Relevant Codebase Context"));
    }
}
