//! Token Usage Tracker (C9, spec §4.9): row-locked counter updates plus cost
//! calculation for the Claude 3.5 Sonnet default pricing.

use uuid::Uuid;

use crate::error::WorkflowError;
use crate::models::agent_run_log::AgentRunLog;

/// USD per million input/output tokens (Claude 3.5 Sonnet defaults, spec §4.9).
const PRICE_INPUT_PER_MILLION: f64 = 3.00;
const PRICE_OUTPUT_PER_MILLION: f64 = 15.00;

/// `CalculateCost` (spec §4.9): `round(((input/1e6)*P_in + (output/1e6)*P_out)*100)`.
pub fn calculate_cost_cents(tokens_input: i64, tokens_output: i64) -> i64 {
    let input_cost = (tokens_input as f64 / 1_000_000.0) * PRICE_INPUT_PER_MILLION;
    let output_cost = (tokens_output as f64 / 1_000_000.0) * PRICE_OUTPUT_PER_MILLION;
    ((input_cost + output_cost) * 100.0).round() as i64
}

/// `Track` (spec §4.9): increments both the AgentRun's and the Project's counters
/// under row-level locks, then appends a `metric` log.
pub async fn track(
    pool: &sqlx::PgPool,
    agent_run_id: Uuid,
    project_id: Uuid,
    tokens_input: i64,
    tokens_output: i64,
) -> Result<(), WorkflowError> {
    let cost_cents = calculate_cost_cents(tokens_input, tokens_output);

    let mut tx = pool.begin().await.map_err(WorkflowError::Database)?;

    sqlx::query(
        r#"UPDATE agent_runs SET
              tokens_input = tokens_input + $2,
              tokens_output = tokens_output + $3,
              cost_cents = cost_cents + $4
           WHERE id = $1"#,
    )
    .bind(agent_run_id)
    .bind(tokens_input)
    .bind(tokens_output)
    .bind(cost_cents)
    .execute(&mut *tx)
    .await
    .map_err(WorkflowError::Database)?;

    sqlx::query(
        r#"UPDATE projects SET
              total_tokens_used = total_tokens_used + $2,
              total_cost_cents = total_cost_cents + $3
           WHERE id = $1"#,
    )
    .bind(project_id)
    .bind(tokens_input + tokens_output)
    .bind(cost_cents)
    .execute(&mut *tx)
    .await
    .map_err(WorkflowError::Database)?;

    tx.commit().await.map_err(WorkflowError::Database)?;

    AgentRunLog::token_usage(pool, agent_run_id, tokens_input, tokens_output, cost_cents)
        .await
        .map_err(WorkflowError::Database)?;

    Ok(())
}
