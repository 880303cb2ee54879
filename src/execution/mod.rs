//! Batch execution: loading, state, dispatch, escalation and the executor loop

pub mod dispatch;
pub mod escalation;
pub mod executor;
pub mod loader;
pub mod scheduler;
pub mod workflow;

pub use dispatch::{
    CompletionRouter, DispatchGateway, StepCompletion, StepMetrics, StepRequest, StepTransport,
};
pub use escalation::{
    EscalationContext, EscalationPayload, EscalationRouter, EscalationTrigger, FailedStep,
};
pub use executor::{EventHandler, ExecutionEvent, PipelineExecutor};
pub use loader::PipelineLoader;
pub use scheduler::{ExecutionScheduler, ScheduledStep, SkipReason, StepDecision};
pub use workflow::{BatchUpdate, StepUpdate, WorkflowStateManager};
