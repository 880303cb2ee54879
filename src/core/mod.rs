//! Core domain models
//!
//! Pipeline definitions, the batch/step state machine, rule records, settings and the
//! error taxonomy shared by every other module.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod rules;
pub mod settings;
pub mod state;
pub mod step;

pub use config::{PipelineConfig, StopIssuePolicy};
pub use error::{DispatchError, OrchestratorError, StoreError};
pub use pipeline::*;
pub use settings::{EscalationSettings, Settings};
pub use state::*;
pub use step::*;
