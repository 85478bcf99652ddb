//! Shared error types for the orchestration engine.
//!
//! Every module-boundary function returns one of these typed errors so callers can
//! match on kind rather than on message text (spec §7/§9: "exceptions for control
//! flow... every error boundary is a tagged error kind").

use thiserror::Error;

/// Errors raised by the container sandbox (C1).
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to provision container: {0}")]
    Provision(String),

    #[error("command timed out after {0}s")]
    Timeout(u64),

    #[error("container execution failed: {0}")]
    Execution(String),
}

/// Errors raised while applying network/firewall policy (C2).
#[derive(Debug, Error)]
pub enum NetworkPolicyError {
    #[error("invalid CIDR: \"{0}\"")]
    InvalidCidr(String),

    #[error("invalid proxy host: \"{0}\"")]
    InvalidHost(String),

    #[error("firewall apply failed: {0}")]
    ApplyFailed(String),
}

/// Errors raised by in-container git operations (C3).
#[derive(Debug, Error)]
pub enum GitError {
    #[error("clone failed: {0}")]
    Clone(String),

    #[error("push rejected: {0}")]
    Push(String),

    #[error("branch name is blank")]
    BlankBranch,

    #[error("rebase failed: {0}")]
    Rebase(String),

    #[error("git command failed: {0}")]
    Command(String),
}

/// Errors raised by the GitHub client (C4).
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("authentication failed")]
    Authentication,

    #[error("not found")]
    NotFound,

    #[error("rate limited, resets at {0}")]
    RateLimit(chrono::DateTime<chrono::Utc>),

    #[error("GitHub API error (status {0})")]
    Api(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("graphql error: {0}")]
    GraphQl(String),
}

/// Errors raised by the prompt builder (C5).
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("issue is not trusted: creator not in allowed_github_usernames")]
    UntrustedIssue,

    #[error("template rendering failed: {0}")]
    Render(String),
}

/// Errors raised while running the agent-execution workflow (C7).
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unsupported agent type: {0}")]
    UnsupportedAgentType(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error("worktree conflict: branch {0} is owned by another active run")]
    WorktreeConflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("activity exhausted retries: {0}")]
    RetriesExhausted(String),
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
