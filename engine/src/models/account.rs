//! Account (spec §3): owns Projects, GithubTokens, Users.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Account {
    /// Generate a unique-looking slug from a display name: lowercase letters, digits,
    /// hyphens only.
    pub fn slugify(name: &str) -> String {
        let mut slug = String::with_capacity(name.len());
        let mut last_was_hyphen = false;
        for ch in name.to_lowercase().chars() {
            if ch.is_ascii_alphanumeric() {
                slug.push(ch);
                last_was_hyphen = false;
            } else if !last_was_hyphen && !slug.is_empty() {
                slug.push('-');
                last_was_hyphen = true;
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        slug
    }

    pub async fn create(pool: &sqlx::PgPool, name: &str) -> sqlx::Result<Self> {
        let slug = Self::slugify(name);
        sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (id, slug, name, created_at)
            VALUES ($1, $2, $3, now())
            RETURNING id, slug, name, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&slug)
        .bind(name)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &sqlx::PgPool, id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Account>("SELECT id, slug, name, created_at FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
