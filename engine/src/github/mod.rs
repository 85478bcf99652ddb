//! GitHub Client (C4, spec §4.4): a thin, rate-limit-aware wrapper over REST v3 and a
//! handful of GraphQL v4 calls octocrab doesn't cover.

pub mod client;
pub mod graphql;

pub use client::{GitHubClient, GithubOperations};
pub use graphql::ReviewThread;
