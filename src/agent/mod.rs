//! Agent invocation orchestration.

pub mod orchestrator;

pub use orchestrator::{
    AgentInvocation, ExecutionRequest, InvocationOutcome, LocalExecutor, Orchestrator,
};
