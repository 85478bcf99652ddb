//! Issue Fetcher + PR Scanner (C6, spec §4.6).

pub mod issue_fetcher;
pub mod pr_scanner;

pub use issue_fetcher::{fetch_issues, FetchedIssueSummary};
pub use pr_scanner::{evaluate_triggers, is_eligible, PrFollowUpCandidate, PrScanInput, Triggers};
