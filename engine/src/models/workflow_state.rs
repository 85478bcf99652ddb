//! WorkflowState (spec §3): opaque mirror of the workflow engine's run records, written
//! by activities.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowState {
    pub id: Uuid,
    pub temporal_workflow_id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error_message: Option<String>,
    #[sqlx(json)]
    pub input_data: serde_json::Value,
}

impl WorkflowState {
    pub async fn start(
        pool: &sqlx::PgPool,
        temporal_workflow_id: &str,
        workflow_type: &str,
        input_data: serde_json::Value,
    ) -> sqlx::Result<Self> {
        sqlx::query_as::<_, WorkflowState>(
            r#"
            INSERT INTO workflow_states (id, temporal_workflow_id, workflow_type, status,
                                          started_at, completed_at, error_message, input_data)
            VALUES ($1, $2, $3, 'running', now(), NULL, NULL, $4)
            ON CONFLICT (temporal_workflow_id) DO UPDATE SET workflow_type = EXCLUDED.workflow_type
            RETURNING id, temporal_workflow_id, workflow_type, status, started_at,
                      completed_at, error_message, input_data
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(temporal_workflow_id)
        .bind(workflow_type)
        .bind(sqlx::types::Json(input_data))
        .fetch_one(pool)
        .await
    }

    pub async fn finish(
        pool: &sqlx::PgPool,
        temporal_workflow_id: &str,
        status: WorkflowStatus,
        error_message: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE workflow_states SET status = $2, completed_at = now(), error_message = $3 \
             WHERE temporal_workflow_id = $1",
        )
        .bind(temporal_workflow_id)
        .bind(status)
        .bind(error_message)
        .execute(pool)
        .await?;
        Ok(())
    }
}
