//! Prompt Builder (C5, spec §4.5): issue-mode and PR-follow-up-mode prompt construction.

pub mod issue_prompt;
pub mod languages;
pub mod pr_prompt;

pub use issue_prompt::{build_issue_prompt, CodebaseChunk};
pub use pr_prompt::{build_pr_follow_up_prompt, PrFollowUpInput};
