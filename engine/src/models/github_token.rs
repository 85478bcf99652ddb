//! GithubToken (spec §3): opaque token stored encrypted at rest, validated against the
//! recognized GitHub token prefix formats.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Recognized GitHub token prefixes (classic PAT, fine-grained PAT, OAuth,
/// user-to-server, server-to-server, refresh).
const RECOGNIZED_PREFIXES: &[&str] =
    &["ghp_", "github_pat_", "gho_", "ghu_", "ghs_", "ghr_"];

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GithubToken {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub encrypted_token: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub revoked_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl GithubToken {
    /// `true` iff the token text matches one of the recognized formats.
    pub fn has_recognized_format(token: &str) -> bool {
        RECOGNIZED_PREFIXES.iter().any(|p| token.starts_with(p))
    }

    /// Active iff not revoked and (no expiry OR expiry in the future).
    pub fn is_active(&self) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(exp) => exp > chrono::Utc::now(),
            None => true,
        }
    }

    pub async fn touch_last_used(&self, pool: &sqlx::PgPool) -> sqlx::Result<()> {
        sqlx::query("UPDATE github_tokens SET last_used_at = now() WHERE id = $1")
            .bind(self.id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
