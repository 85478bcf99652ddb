//! In-Container Git (C3, spec §4.3): every git operation the workflow needs, run via
//! C1's `Execute` so credentials never touch the host.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::container::{AgentSandbox, ExecOutcome, SandboxHandle};
use crate::error::GitError;

const CLONE_TIMEOUT: Duration = Duration::from_secs(120);
const PUSH_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_SLUG_LEN: usize = 50;
const MAX_BRANCH_SLUG_LEN: usize = 55;

/// Lowercase, keep `[a-z0-9 -]`, collapse whitespace/hyphen runs, trim trailing hyphen,
/// truncate to `max_len` (spec §4.3).
pub fn slugify(input: &str, max_len: usize) -> String {
    let lowered = input.to_lowercase();
    let filtered: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == ' ' || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(filtered.len());
    let mut last_was_sep = false;
    for c in filtered.chars() {
        if c == ' ' || c == '-' {
            if !last_was_sep {
                collapsed.push('-');
                last_was_sep = true;
            }
        } else {
            collapsed.push(c);
            last_was_sep = false;
        }
    }

    let trimmed = collapsed.trim_matches('-');
    let truncated: String = trimmed.chars().take(max_len).collect();
    truncated.trim_end_matches('-').to_string()
}

fn random_hex6() -> String {
    let bytes: [u8; 3] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Derive the `paid/<slug>-<6-hex>` branch name for a fresh run (spec §4.3).
pub fn new_branch_name(issue_number: Option<i64>, issue_title: Option<&str>, custom_prompt: Option<&str>, run_id: &str) -> String {
    let slug = match (issue_number, issue_title) {
        (Some(number), Some(title)) => {
            format!("{number}-{}", slugify(title, MAX_SLUG_LEN))
        }
        _ => match custom_prompt {
            Some(prompt) => slugify(prompt, MAX_SLUG_LEN),
            None => format!("agent-{run_id}"),
        },
    };
    let slug: String = slug.chars().take(MAX_BRANCH_SLUG_LEN).collect();
    format!("paid/{}-{}", slug.trim_end_matches('-'), random_hex6())
}

/// Thin wrapper driving git commands inside a provisioned sandbox.
pub struct InContainerGit {
    sandbox: Arc<dyn AgentSandbox>,
}

impl InContainerGit {
    pub fn new(sandbox: Arc<dyn AgentSandbox>) -> Self {
        Self { sandbox }
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        args: &[&str],
        timeout: Duration,
    ) -> Result<ExecOutcome, GitError> {
        let command: Vec<String> = std::iter::once("git".to_string())
            .chain(args.iter().map(|a| a.to_string()))
            .collect();
        self.sandbox
            .execute(handle, &command, Some(timeout))
            .await
            .map_err(|e| GitError::Command(e.to_string()))
    }

    async fn is_git_worktree(&self, handle: &SandboxHandle) -> Result<bool, GitError> {
        let outcome = self
            .run(handle, &["rev-parse", "--is-inside-work-tree"], Duration::from_secs(5))
            .await?;
        Ok(outcome.succeeded() && outcome.stdout.trim() == "true")
    }

    async fn clone_if_needed(&self, handle: &SandboxHandle, owner: &str, repo: &str) -> Result<(), GitError> {
        if self.is_git_worktree(handle).await? {
            return Ok(());
        }
        let url = format!("https://github.com/{owner}/{repo}.git");
        let outcome = self.run(handle, &["clone", &url, "."], CLONE_TIMEOUT).await?;
        if !outcome.succeeded() {
            return Err(GitError::Clone(outcome.stderr));
        }
        Ok(())
    }

    async fn head_sha(&self, handle: &SandboxHandle) -> Result<String, GitError> {
        let outcome = self.run(handle, &["rev-parse", "HEAD"], Duration::from_secs(10)).await?;
        if !outcome.succeeded() {
            return Err(GitError::Command(outcome.stderr));
        }
        Ok(outcome.stdout.trim().to_string())
    }

    /// `CloneAndSetupBranch` (spec §4.3): idempotent clone, then a fresh branch.
    pub async fn clone_and_setup_branch(
        &self,
        handle: &SandboxHandle,
        owner: &str,
        repo: &str,
        issue_number: Option<i64>,
        issue_title: Option<&str>,
        custom_prompt: Option<&str>,
        run_id: &str,
    ) -> Result<(String, String), GitError> {
        self.clone_if_needed(handle, owner, repo).await?;
        let branch = new_branch_name(issue_number, issue_title, custom_prompt, run_id);
        let outcome = self.run(handle, &["checkout", "-b", &branch], Duration::from_secs(30)).await?;
        if !outcome.succeeded() {
            return Err(GitError::Command(outcome.stderr));
        }
        let base_commit_sha = self.head_sha(handle).await?;
        Ok((branch, base_commit_sha))
    }

    /// `CloneAndCheckoutBranch` (spec §4.3).
    pub async fn clone_and_checkout_branch(
        &self,
        handle: &SandboxHandle,
        owner: &str,
        repo: &str,
        branch: &str,
        default_branch: &str,
    ) -> Result<String, GitError> {
        self.clone_if_needed(handle, owner, repo).await?;
        let outcome = self.run(handle, &["checkout", branch], Duration::from_secs(30)).await?;
        if !outcome.succeeded() {
            return Err(GitError::Command(outcome.stderr));
        }

        let merge_base = self
            .run(handle, &["merge-base", default_branch, "HEAD"], Duration::from_secs(15))
            .await?;
        if merge_base.succeeded() {
            Ok(merge_base.stdout.trim().to_string())
        } else {
            self.head_sha(handle).await
        }
    }

    /// `PushBranch` (spec §4.3). Rejects blank branch names before touching the sandbox.
    pub async fn push_branch(
        &self,
        handle: &SandboxHandle,
        branch_name: &str,
        targets_existing_pr: bool,
    ) -> Result<String, GitError> {
        if branch_name.trim().is_empty() {
            return Err(GitError::BlankBranch);
        }

        let mut args = vec!["push", "--no-verify"];
        if targets_existing_pr {
            args.push("--force-with-lease");
        }
        args.push("origin");
        args.push(branch_name);

        let outcome = self.run(handle, &args, PUSH_TIMEOUT).await?;
        if !outcome.succeeded() {
            return Err(GitError::Push(outcome.stderr));
        }
        self.head_sha(handle).await
    }

    /// `CommitUncommittedChanges` (spec §4.3). Returns whether a commit was made.
    pub async fn commit_uncommitted_changes(&self, handle: &SandboxHandle) -> Result<bool, GitError> {
        let status = self
            .run(handle, &["status", "--porcelain"], Duration::from_secs(15))
            .await?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }

        let add = self.run(handle, &["add", "-A"], Duration::from_secs(30)).await?;
        if !add.succeeded() {
            return Err(GitError::Command(add.stderr));
        }

        let commit = self
            .run(
                handle,
                &["commit", "--no-verify", "-m", "Apply agent changes"],
                Duration::from_secs(30),
            )
            .await?;
        if !commit.succeeded() {
            return Err(GitError::Command(commit.stderr));
        }
        Ok(true)
    }

    /// `HasChangesSince` (spec §4.3). Never propagates exec errors: on failure, the
    /// caller treats an unknowable state as "no changes" so a flaky exec doesn't
    /// spuriously fail the whole run.
    pub async fn has_changes_since(&self, handle: &SandboxHandle, base: &str) -> bool {
        let log = self
            .run(handle, &["log", "--oneline", &format!("{base}..HEAD")], Duration::from_secs(15))
            .await;
        if let Ok(out) = &log {
            if out.succeeded() && !out.stdout.trim().is_empty() {
                return true;
            }
        }
        let status = self.run(handle, &["status", "--porcelain"], Duration::from_secs(15)).await;
        matches!(status, Ok(out) if out.succeeded() && !out.stdout.trim().is_empty())
    }

    /// `HasChanges` (spec §4.3).
    pub async fn has_changes(&self, handle: &SandboxHandle, base_commit_sha: Option<&str>) -> Result<bool, GitError> {
        let target = base_commit_sha.unwrap_or("HEAD");
        let outcome = self
            .run(handle, &["diff", "--stat", target, "HEAD"], Duration::from_secs(15))
            .await?;
        Ok(!outcome.stdout.trim().is_empty())
    }

    /// `RebaseOnto` (spec §4.3). Aborts best-effort on conflict and reports `false`;
    /// any other failure propagates.
    pub async fn rebase_onto(&self, handle: &SandboxHandle, base: &str) -> Result<bool, GitError> {
        let fetch = self.run(handle, &["fetch", "origin", base], Duration::from_secs(60)).await?;
        if !fetch.succeeded() {
            return Err(GitError::Rebase(fetch.stderr));
        }

        let rebase = self
            .run(handle, &["rebase", &format!("origin/{base}")], Duration::from_secs(120))
            .await?;
        if rebase.succeeded() {
            return Ok(true);
        }
        if rebase.stderr.contains("CONFLICT") {
            let _ = self.run(handle, &["rebase", "--abort"], Duration::from_secs(30)).await;
            return Ok(false);
        }
        Err(GitError::Rebase(rebase.stderr))
    }

    /// Each hook command is validated word-by-word; anything containing shell
    /// metacharacters is skipped rather than interpolated (spec §4.3).
    fn is_safe_hook_command(command: &str) -> bool {
        command
            .split_whitespace()
            .all(|word| word.chars().all(|c| {
                c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/' | '.')
            }))
    }

    /// `InstallGitHooks` (spec §4.3). Never overwrites an existing hook.
    pub async fn install_git_hooks(
        &self,
        handle: &SandboxHandle,
        lint_cmd: Option<&str>,
        test_cmd: Option<&str>,
    ) -> Result<bool, GitError> {
        let existing = self
            .run(handle, &["rev-parse", "--git-path", "hooks/pre-commit"], Duration::from_secs(5))
            .await?;
        let hook_path = if existing.succeeded() {
            existing.stdout.trim().to_string()
        } else {
            ".git/hooks/pre-commit".to_string()
        };

        let exists = self
            .sandbox
            .execute(
                handle,
                &["test".to_string(), "-e".to_string(), hook_path.clone()],
                Some(Duration::from_secs(5)),
            )
            .await
            .map_err(|e| GitError::Command(e.to_string()))?;
        if exists.succeeded() {
            return Ok(false);
        }

        let mut body = String::from("#!/bin/sh\n");
        for (label, cmd) in [("lint", lint_cmd), ("test", test_cmd)] {
            if let Some(cmd) = cmd {
                if !Self::is_safe_hook_command(cmd) {
                    tracing::warn!(command = %cmd, %label, "skipping unsafe git hook command");
                    continue;
                }
                let bin = cmd.split_whitespace().next().unwrap_or_default();
                body.push_str(&format!(
                    "if command -v {bin} >/dev/null 2>&1; then {cmd} || exit 1; fi\n"
                ));
            }
        }

        let write = self
            .sandbox
            .execute(
                handle,
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "cat <<'PAID_HOOK_EOF' > {hook_path} && chmod +x {hook_path}\n{body}\nPAID_HOOK_EOF"
                    ),
                ],
                Some(Duration::from_secs(10)),
            )
            .await
            .map_err(|e| GitError::Command(e.to_string()))?;

        if !write.succeeded() {
            return Err(GitError::Command(write.stderr));
        }
        Ok(true)
    }
}
