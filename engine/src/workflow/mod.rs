//! Agent Execution Workflow (C7) and the Workflow Engine Adapter (C10).

pub mod agent_execution;
pub mod engine;

pub use agent_execution::{AgentExecutionWorkflow, ContainerAuthContext, RunOutcome};
pub use engine::{ActivityRetry, LocalEngine, RetryPolicy, TokioActivityRetry, WorkflowEngine};
