//! Workflow state manager
//!
//! The only component allowed to mutate batch and step state. Every mutation is a
//! conditional write against the durable store; the cache is read-through and is
//! invalidated, never updated, after a committed write.

use crate::core::{
    error::{OrchestratorError, Result, StoreError},
    BatchState, BatchStatus, PipelineStep, Settings, StepState, StepStatus,
};
use crate::persistence::{
    ItemWrite, Precondition, StateCache, StateStore, StoreKey, StoredItem, WriteOutcome,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fields a step transition may record alongside the new status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepUpdate {
    pub record_count: Option<u64>,
    pub error_count: Option<u64>,
    pub warning_count: Option<u64>,
    /// Only kept on FAILED
    pub error_details: Option<String>,
}

impl StepUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(mut self, records: u64, errors: u64, warnings: u64) -> Self {
        self.record_count = Some(records);
        self.error_count = Some(errors);
        self.warning_count = Some(warnings);
        self
    }

    pub fn error(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }
}

/// Fields a batch transition may record alongside the new status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchUpdate {
    pub record_count: Option<u64>,
    /// Required for ESCALATED, ignored otherwise
    pub escalation_reason: Option<String>,
}

impl BatchUpdate {
    pub fn escalated(reason: impl Into<String>) -> Self {
        Self {
            record_count: None,
            escalation_reason: Some(reason.into()),
        }
    }

    pub fn records(mut self, record_count: u64) -> Self {
        self.record_count = Some(record_count);
        self
    }
}

pub struct WorkflowStateManager {
    store: Arc<dyn StateStore>,
    cache: Arc<dyn StateCache>,
    settings: Arc<Settings>,
}

impl WorkflowStateManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<dyn StateCache>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    fn cache_key(batch_id: &str) -> String {
        format!("session:{}:state", batch_id)
    }

    fn decode<T: DeserializeOwned>(item: &StoredItem) -> Result<T> {
        serde_json::from_value(item.body.clone()).map_err(|e| {
            StoreError::Corrupt {
                key: format!("{}/{}", item.pk, item.sk),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn conflict(key: &StoreKey, expected: &str, outcome: WriteOutcome) -> OrchestratorError {
        let actual = match outcome {
            WriteOutcome::Conflict {
                current_status: Some(status),
                ..
            } => status,
            WriteOutcome::Conflict { .. } => "<absent>".to_string(),
            WriteOutcome::Committed { .. } => expected.to_string(),
        };
        OrchestratorError::ConcurrentStateConflict {
            key: key.to_string(),
            expected: expected.to_string(),
            actual,
        }
    }

    async fn invalidate(&self, batch_id: &str) {
        if let Err(e) = self.cache.invalidate(&Self::cache_key(batch_id)).await {
            warn!("Failed to invalidate state cache for batch {}: {}", batch_id, e);
        }
    }

    /// A lost conditional write means our view of the batch is old; drop the cached copy
    async fn lost_race(&self, batch_id: &str, err: OrchestratorError) -> OrchestratorError {
        self.invalidate(batch_id).await;
        err
    }

    /// Read the materialized batch state, cache first
    pub async fn get_batch_state(&self, batch_id: &str) -> Result<BatchState> {
        self.find_batch_state(batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::BatchNotFound(batch_id.to_string()))
    }

    /// Like [`get_batch_state`](Self::get_batch_state), but `None` for an unknown batch
    pub async fn find_batch_state(&self, batch_id: &str) -> Result<Option<BatchState>> {
        let cache_key = Self::cache_key(batch_id);
        match self.cache.get(&cache_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<BatchState>(&raw) {
                Ok(state) => {
                    debug!("State cache hit: {}", cache_key);
                    return Ok(Some(state));
                }
                Err(e) => warn!("Ignoring undecodable state cache entry {}: {}", cache_key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("State cache read failed for {}: {}", cache_key, e),
        }

        self.load_batch_state(batch_id).await
    }

    /// Drop the cached copy and read the batch straight from the store
    pub async fn refresh_batch_state(&self, batch_id: &str) -> Result<BatchState> {
        self.invalidate(batch_id).await;
        self.load_batch_state(batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::BatchNotFound(batch_id.to_string()))
    }

    async fn load_batch_state(&self, batch_id: &str) -> Result<Option<BatchState>> {
        let cache_key = Self::cache_key(batch_id);
        let items = self
            .store
            .query_by_partition(&StoreKey::partition(batch_id))
            .await?;

        let state_sk = StoreKey::batch(batch_id).sk();
        let Some(record) = items.iter().find(|item| item.sk == state_sk) else {
            return Ok(None);
        };

        let mut state: BatchState = Self::decode(record)?;
        state.steps = items
            .iter()
            .filter(|item| item.sk != state_sk)
            .map(Self::decode::<StepState>)
            .collect::<Result<Vec<_>>>()?;
        state.steps.sort_by_key(|s| s.step_order);

        let ttl = Duration::from_secs(self.settings.state_cache_ttl_secs);
        let encoded = serde_json::to_string(&state)?;
        if let Err(e) = self.cache.set_with_ttl(&cache_key, ttl, encoded).await {
            warn!("Failed to cache state for batch {}: {}", batch_id, e);
        }

        Ok(Some(state))
    }

    /// Create a RECEIVED batch record without steps, as ingestion does
    pub async fn register_batch(
        &self,
        batch_id: &str,
        plan_id: &str,
        pay_freq: &str,
        source_path: &str,
    ) -> Result<BatchState> {
        let state = BatchState::new(batch_id, plan_id, pay_freq, source_path);
        let key = StoreKey::batch(batch_id);
        let write = ItemWrite {
            status: state.status.to_string(),
            body: serde_json::to_value(&state)?,
        };

        match self
            .store
            .put_item_conditional(&key, Precondition::Absent, write)
            .await?
        {
            WriteOutcome::Committed { .. } => {
                info!("Registered batch {} for {} ({})", batch_id, plan_id, pay_freq);
                self.invalidate(batch_id).await;
                Ok(state)
            }
            WriteOutcome::Conflict { .. } => {
                Err(OrchestratorError::BatchAlreadyExists(batch_id.to_string()))
            }
        }
    }

    /// Create a batch record and one PENDING record per step
    pub async fn initialize_batch(
        &self,
        batch_id: &str,
        plan_id: &str,
        pay_freq: &str,
        source_path: &str,
        steps: &[PipelineStep],
    ) -> Result<BatchState> {
        let mut state = self
            .register_batch(batch_id, plan_id, pay_freq, source_path)
            .await?;
        self.ensure_step_states(batch_id, steps).await?;

        state.steps = steps.iter().map(StepState::pending).collect();
        state.steps.sort_by_key(|s| s.step_order);
        Ok(state)
    }

    /// Create PENDING records for steps that have none; returns how many were created
    pub async fn ensure_step_states(&self, batch_id: &str, steps: &[PipelineStep]) -> Result<usize> {
        let mut created = 0;
        for step in steps {
            let pending = StepState::pending(step);
            let write = ItemWrite {
                status: pending.status.to_string(),
                body: serde_json::to_value(&pending)?,
            };
            let key = StoreKey::step(batch_id, step.step_order);
            match self
                .store
                .put_item_conditional(&key, Precondition::Absent, write)
                .await?
            {
                WriteOutcome::Committed { .. } => created += 1,
                WriteOutcome::Conflict { .. } => {
                    debug!("Step record {} already exists", key);
                }
            }
        }

        if created > 0 {
            debug!("Created {} step records for batch {}", created, batch_id);
            self.invalidate(batch_id).await;
        }
        Ok(created)
    }

    /// Conditionally move one step from `expected` to `new`
    ///
    /// Fails with `ConcurrentStateConflict` when the durable status is not `expected`, or
    /// when the record changed between the read and the write.
    pub async fn update_step_state(
        &self,
        batch_id: &str,
        step_order: u32,
        expected: StepStatus,
        new: StepStatus,
        update: StepUpdate,
    ) -> Result<StepState> {
        if !expected.can_transition_to(new) {
            return Err(OrchestratorError::step_transition(
                batch_id, step_order, expected, new,
            ));
        }

        let key = StoreKey::step(batch_id, step_order);
        let item = self
            .store
            .get_item(&key)
            .await?
            .ok_or_else(|| OrchestratorError::StepNotFound {
                batch_id: batch_id.to_string(),
                step_order,
            })?;

        if item.status != expected.as_str() {
            let err = OrchestratorError::ConcurrentStateConflict {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: item.status,
            };
            return Err(self.lost_race(batch_id, err).await);
        }

        let mut step: StepState = Self::decode(&item)?;
        let now = Utc::now();

        if new == StepStatus::Dispatched {
            if expected != StepStatus::Pending {
                if step.retry_count + 1 >= self.settings.max_step_attempts {
                    warn!(
                        "Step {} of batch {} has used all {} attempts",
                        step_order, batch_id, self.settings.max_step_attempts
                    );
                    return Err(OrchestratorError::step_transition(
                        batch_id, step_order, expected, new,
                    ));
                }
                step.retry_count += 1;
            }
            step.start_time.get_or_insert(now);
            step.last_dispatch_time = Some(now);
            step.end_time = None;
        }

        step.status = new;
        if let Some(records) = update.record_count {
            step.record_count = records;
        }
        if let Some(errors) = update.error_count {
            step.error_count = errors;
        }
        if let Some(warnings) = update.warning_count {
            step.warning_count = warnings;
        }

        match new {
            StepStatus::Failed => {
                step.error_details = update.error_details.unwrap_or_default();
            }
            _ => step.error_details.clear(),
        }

        if new.is_terminal() {
            step.end_time = Some(now);
            step.duration_ms = step
                .start_time
                .map(|start| (now - start).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
        }

        let write = ItemWrite {
            status: new.to_string(),
            body: serde_json::to_value(&step)?,
        };
        match self
            .store
            .put_item_conditional(&key, Precondition::Version(item.version), write)
            .await?
        {
            WriteOutcome::Committed { .. } => {}
            outcome => {
                let err = Self::conflict(&key, expected.as_str(), outcome);
                return Err(self.lost_race(batch_id, err).await);
            }
        }

        debug!(
            "Batch {} step {} ({}): {} -> {}",
            batch_id, step_order, step.subroutine_name, expected, new
        );
        self.invalidate(batch_id).await;
        Ok(step)
    }

    /// Put a DISPATCHED step back to PENDING when its request never reached the transport
    ///
    /// Only the dispatch of `attempt` is undone: the retry counter is left alone, so the
    /// next dispatch sends the same attempt number instead of charging a new one.
    pub async fn release_dispatch(&self, batch_id: &str, step_order: u32, attempt: u32) -> Result<StepState> {
        let key = StoreKey::step(batch_id, step_order);
        let item = self
            .store
            .get_item(&key)
            .await?
            .ok_or_else(|| OrchestratorError::StepNotFound {
                batch_id: batch_id.to_string(),
                step_order,
            })?;

        let expected = StepStatus::Dispatched;
        let mut step: StepState = Self::decode(&item)?;
        if item.status != expected.as_str() || step.attempts() != attempt {
            let err = OrchestratorError::ConcurrentStateConflict {
                key: key.to_string(),
                expected: format!("{} (attempt {})", expected, attempt),
                actual: format!("{} (attempt {})", item.status, step.attempts()),
            };
            return Err(self.lost_race(batch_id, err).await);
        }

        step.status = StepStatus::Pending;
        step.last_dispatch_time = None;
        if step.retry_count == 0 {
            step.start_time = None;
        }

        let write = ItemWrite {
            status: step.status.to_string(),
            body: serde_json::to_value(&step)?,
        };
        match self
            .store
            .put_item_conditional(&key, Precondition::Version(item.version), write)
            .await?
        {
            WriteOutcome::Committed { .. } => {}
            outcome => {
                let err = Self::conflict(&key, expected.as_str(), outcome);
                return Err(self.lost_race(batch_id, err).await);
            }
        }

        info!(
            "Batch {} step {} ({}): released attempt {} back to {}",
            batch_id, step_order, step.subroutine_name, attempt, step.status
        );
        self.invalidate(batch_id).await;
        Ok(step)
    }

    /// Conditionally move a batch from `expected` to `new`
    pub async fn update_batch_state(
        &self,
        batch_id: &str,
        expected: BatchStatus,
        new: BatchStatus,
        update: BatchUpdate,
    ) -> Result<()> {
        if !expected.can_transition_to(new) {
            return Err(OrchestratorError::batch_transition(batch_id, expected, new));
        }

        let reason = update.escalation_reason.unwrap_or_default();
        if new == BatchStatus::Escalated && reason.trim().is_empty() {
            return Err(OrchestratorError::MissingEscalationReason(batch_id.to_string()));
        }

        let key = StoreKey::batch(batch_id);
        let item = self
            .store
            .get_item(&key)
            .await?
            .ok_or_else(|| OrchestratorError::BatchNotFound(batch_id.to_string()))?;

        if item.status != expected.as_str() {
            let err = OrchestratorError::ConcurrentStateConflict {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: item.status,
            };
            return Err(self.lost_race(batch_id, err).await);
        }

        let mut state: BatchState = Self::decode(&item)?;
        let now = Utc::now();
        state.status = new;
        state.steps.clear();

        if new == BatchStatus::Processing {
            state.start_time.get_or_insert(now);
        }
        if new.is_terminal() {
            state.end_time = Some(now);
        }
        if let Some(records) = update.record_count {
            state.record_count = records;
        }
        if new == BatchStatus::Escalated {
            state.escalation_reason = reason;
        }

        let write = ItemWrite {
            status: new.to_string(),
            body: serde_json::to_value(&state)?,
        };
        match self
            .store
            .put_item_conditional(&key, Precondition::Version(item.version), write)
            .await?
        {
            WriteOutcome::Committed { .. } => {}
            outcome => {
                let err = Self::conflict(&key, expected.as_str(), outcome);
                return Err(self.lost_race(batch_id, err).await);
            }
        }

        info!("Batch {}: {} -> {}", batch_id, expected, new);
        self.invalidate(batch_id).await;
        Ok(())
    }
}
