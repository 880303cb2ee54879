//! Simulated agent for rehearsal runs and tests

use crate::agent::{StepHandler, StepOutcome};
use crate::execution::{StepMetrics, StepRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Agent that completes every step unless told otherwise
///
/// Failures are keyed by subroutine name and decided from the request's attempt number,
/// so the agent itself holds no mutable state.
#[derive(Debug, Clone)]
pub struct SimulatedAgent {
    record_count: u64,
    /// Subroutine name -> number of leading attempts that fail (`u32::MAX` = always)
    failures: HashMap<String, u32>,
    metrics: HashMap<String, StepMetrics>,
    delay: Option<Duration>,
}

impl Default for SimulatedAgent {
    fn default() -> Self {
        Self {
            record_count: 100,
            failures: HashMap::new(),
            metrics: HashMap::new(),
            delay: None,
        }
    }
}

impl SimulatedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt of `subroutine_name` fails
    pub fn failing(self, subroutine_name: &str) -> Self {
        self.failing_times(subroutine_name, u32::MAX)
    }

    /// The first `times` attempts of `subroutine_name` fail
    pub fn failing_times(mut self, subroutine_name: &str, times: u32) -> Self {
        self.failures.insert(subroutine_name.to_string(), times);
        self
    }

    /// Report `metrics` when `subroutine_name` completes
    pub fn with_metrics(mut self, subroutine_name: &str, metrics: StepMetrics) -> Self {
        self.metrics.insert(subroutine_name.to_string(), metrics);
        self
    }

    pub fn with_record_count(mut self, record_count: u64) -> Self {
        self.record_count = record_count;
        self
    }

    /// Add artificial delay to simulate a slow agent
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl StepHandler for SimulatedAgent {
    async fn handle(&self, request: &StepRequest) -> StepOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing_attempts = self
            .failures
            .get(&request.subroutine_name)
            .copied()
            .unwrap_or(0);
        if request.attempt <= failing_attempts {
            return StepOutcome::failed(format!(
                "simulated failure of {} on attempt {}",
                request.subroutine_name, request.attempt
            ));
        }

        let outcome = StepOutcome::completed(self.record_count);
        match self.metrics.get(&request.subroutine_name) {
            Some(metrics) => outcome.with_metrics(metrics.clone()),
            None => outcome,
        }
    }
}
