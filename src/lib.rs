//! payflow - workflow orchestration core for payroll batch files

pub mod agent;
pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use agent::{LocalTransport, SimulatedAgent, StepHandler, StepOutcome};
pub use core::{
    BatchState, BatchStatus, OrchestratorError, PipelineDefinition, PipelineStep, Settings,
    StepState, StepStatus,
};
pub use execution::{DispatchGateway, ExecutionEvent, PipelineExecutor, WorkflowStateManager};
pub use persistence::{InMemoryCache, InMemoryStateStore, RulesCatalog};
