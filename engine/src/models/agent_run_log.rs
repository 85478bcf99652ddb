//! AgentRunLog (spec §3): append-only log lines owned by an AgentRun.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Stdout,
    Stderr,
    System,
    Metric,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRunLog {
    pub id: Uuid,
    pub agent_run_id: Uuid,
    pub log_type: LogType,
    pub content: String,
    #[sqlx(json)]
    pub metadata: Option<serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl AgentRunLog {
    pub async fn append(
        pool: &sqlx::PgPool,
        agent_run_id: Uuid,
        log_type: LogType,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> sqlx::Result<Self> {
        sqlx::query_as::<_, AgentRunLog>(
            r#"
            INSERT INTO agent_run_logs (id, agent_run_id, log_type, content, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            RETURNING id, agent_run_id, log_type, content, metadata, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(agent_run_id)
        .bind(log_type)
        .bind(content)
        .bind(metadata.map(sqlx::types::Json))
        .fetch_one(pool)
        .await
    }

    /// Convenience for the dotted-key `system` log lines spec §6 specifies
    /// (`container.provision.start`, `github_sync.untrusted_issue_skipped`, …).
    pub async fn system_event(
        pool: &sqlx::PgPool,
        agent_run_id: Uuid,
        key: &str,
        message: &str,
    ) -> sqlx::Result<Self> {
        Self::append(
            pool,
            agent_run_id,
            LogType::System,
            message,
            Some(serde_json::json!({ "key": key })),
        )
        .await
    }

    /// A `metric` log carrying token-usage data, per spec §4.9 step 3.
    pub async fn token_usage(
        pool: &sqlx::PgPool,
        agent_run_id: Uuid,
        tokens_input: i64,
        tokens_output: i64,
        cost_cents: i64,
    ) -> sqlx::Result<Self> {
        Self::append(
            pool,
            agent_run_id,
            LogType::Metric,
            &format!(
                "tokens_input={tokens_input} tokens_output={tokens_output} cost_cents={cost_cents}"
            ),
            Some(serde_json::json!({
                "type": "token_usage",
                "tokens_input": tokens_input,
                "tokens_output": tokens_output,
                "cost_cents": cost_cents,
            })),
        )
        .await
    }
}
