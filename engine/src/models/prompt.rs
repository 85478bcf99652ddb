//! Prompt / PromptVersion (spec §3): immutable templates, used only by the prompt
//! builder (C5) to resolve the `coding.issue_implementation` template by slug with
//! project > account > global inheritance.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Prompt {
    pub id: Uuid,
    pub slug: String,
    pub account_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
}

/// Immutable after creation on every field here (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromptVersion {
    pub id: Uuid,
    pub prompt_id: Uuid,
    pub template: String,
    pub version: i32,
    #[sqlx(json)]
    pub variables: Vec<String>,
    pub system_prompt: Option<String>,
    pub created_by: String,
    pub change_notes: Option<String>,
    pub parent_version_id: Option<Uuid>,
}

impl PromptVersion {
    /// Render `{{key}}` placeholders with string values using Handlebars, the same
    /// templating engine the teacher uses for its container/agent templates.
    pub fn render(&self, values: &HashMap<String, String>) -> Result<String, crate::error::PromptError> {
        let hb = handlebars::Handlebars::new();
        hb.render_template(&self.template, values)
            .map_err(|e| crate::error::PromptError::Render(e.to_string()))
    }

    /// Resolve the most specific `PromptVersion` for `slug` honoring
    /// project > account > global inheritance (spec §4.7 step 1).
    pub async fn resolve(
        pool: &sqlx::PgPool,
        slug: &str,
        account_id: Uuid,
        project_id: Uuid,
    ) -> sqlx::Result<Option<Self>> {
        let row = sqlx::query_as::<_, PromptVersion>(
            r#"
            SELECT pv.id, pv.prompt_id, pv.template, pv.version, pv.variables,
                   pv.system_prompt, pv.created_by, pv.change_notes, pv.parent_version_id
            FROM prompt_versions pv
            JOIN prompts p ON p.id = pv.prompt_id
            WHERE p.slug = $1
              AND (p.project_id = $2 OR p.account_id = $3 OR (p.project_id IS NULL AND p.account_id IS NULL))
            ORDER BY
              (p.project_id = $2) DESC,
              (p.account_id = $3) DESC,
              pv.version DESC
            LIMIT 1
            "#,
        )
        .bind(slug)
        .bind(project_id)
        .bind(account_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_placeholders() {
        let pv = PromptVersion {
            id: Uuid::new_v4(),
            prompt_id: Uuid::new_v4(),
            template: "Hello {{name}}, issue #{{number}}".to_string(),
            version: 1,
            variables: vec!["name".to_string(), "number".to_string()],
            system_prompt: None,
            created_by: "system".to_string(),
            change_notes: None,
            parent_version_id: None,
        };
        let mut values = HashMap::new();
        values.insert("name".to_string(), "alice".to_string());
        values.insert("number".to_string(), "42".to_string());
        assert_eq!(pv.render(&values).unwrap(), "Hello alice, issue #42");
    }
}
