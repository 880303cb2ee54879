//! Pipeline executor - drives one batch through its pipeline

use crate::{
    core::{
        error::{DispatchError, OrchestratorError, Result},
        BatchState, BatchStatus, PipelineDefinition, PipelineStep, Settings, StepStatus,
    },
    execution::{
        dispatch::{DispatchGateway, StepCompletion, StepRequest},
        escalation::{custodian_deadline, EscalationContext, EscalationPayload, EscalationRouter, FailedStep},
        loader::PipelineLoader,
        scheduler::{ExecutionScheduler, SkipReason, StepDecision},
        workflow::{BatchUpdate, StepUpdate, WorkflowStateManager},
    },
    persistence::{RuleService, RulesStore, StateCache, StateStore},
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Events that can occur while a batch runs
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    BatchStarted {
        batch_id: String,
        pipeline: String,
        resumed: bool,
    },
    StepDispatched {
        step_order: u32,
        subroutine_name: String,
        agent: String,
        attempt: u32,
    },
    StepAcknowledged {
        step_order: u32,
        subroutine_name: String,
    },
    StepCompleted {
        step_order: u32,
        subroutine_name: String,
        record_count: u64,
    },
    StepFailed {
        step_order: u32,
        subroutine_name: String,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    StepSkipped {
        step_order: u32,
        subroutine_name: String,
        reason: SkipReason,
    },
    StepRecovered {
        step_order: u32,
        subroutine_name: String,
    },
    CompletionDiscarded {
        step_order: u32,
        reason: String,
    },
    BatchEscalated {
        batch_id: String,
        payload: EscalationPayload,
    },
    BatchFinished {
        batch_id: String,
        status: BatchStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Batch-level inputs to escalation that don't change during a run
struct BatchContext {
    held_client_ids: Vec<String>,
    deadline_hour_utc: Option<u32>,
    contribution_baseline: Option<f64>,
}

/// Step writes made by one readiness pass
#[derive(Debug, Default)]
struct ReadyPass {
    committed: usize,
    conflicted: usize,
}

/// Drives batches through their pipelines
pub struct PipelineExecutor {
    loader: PipelineLoader,
    state: Arc<WorkflowStateManager>,
    gateway: Arc<DispatchGateway>,
    escalation: EscalationRouter,
    rules: RuleService,
    settings: Arc<Settings>,
    event_handlers: Mutex<Vec<EventHandler>>,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<dyn StateCache>,
        rules: Arc<dyn RulesStore>,
        gateway: Arc<DispatchGateway>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            loader: PipelineLoader::new(rules.clone(), cache.clone(), &settings),
            state: Arc::new(WorkflowStateManager::new(store, cache.clone(), settings.clone())),
            escalation: EscalationRouter::new(settings.escalation.clone(), gateway.clone()),
            rules: RuleService::new(rules, cache, &settings),
            gateway,
            settings,
            event_handlers: Mutex::new(Vec::new()),
        }
    }

    /// State manager shared with callers that only read or register batches
    pub fn state_manager(&self) -> Arc<WorkflowStateManager> {
        self.state.clone()
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await.clone();
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Run (or resume) a batch until it reaches a terminal status
    ///
    /// Step failures and escalations end up in the returned state; only definition and
    /// infrastructure errors are returned as `Err`.
    pub async fn run(
        &self,
        batch_id: &str,
        plan_id: &str,
        pay_freq: &str,
        source_path: &str,
    ) -> Result<BatchState> {
        let definition = self.loader.load(plan_id, pay_freq).await?;

        let (batch, resumed) = match self.state.find_batch_state(batch_id).await? {
            Some(existing) => {
                if existing.plan_id != plan_id || existing.pay_freq != pay_freq {
                    warn!(
                        "Batch {} was registered for {} ({}), running it as {} ({})",
                        batch_id, existing.plan_id, existing.pay_freq, plan_id, pay_freq
                    );
                }
                self.state
                    .ensure_step_states(batch_id, definition.steps())
                    .await?;
                (existing, true)
            }
            None => {
                match self
                    .state
                    .initialize_batch(batch_id, plan_id, pay_freq, source_path, definition.steps())
                    .await
                {
                    Ok(state) => (state, false),
                    Err(OrchestratorError::BatchAlreadyExists(_)) => {
                        (self.state.get_batch_state(batch_id).await?, true)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        if batch.status.is_terminal() {
            info!("Batch {} is already {}", batch_id, batch.status);
            return Ok(batch);
        }

        info!(
            "Starting batch {} on pipeline {}{}",
            batch_id,
            definition.key(),
            if resumed { " (resumed)" } else { "" }
        );
        self.emit_event(ExecutionEvent::BatchStarted {
            batch_id: batch_id.to_string(),
            pipeline: definition.key(),
            resumed,
        })
        .await;

        if batch.status == BatchStatus::Received {
            match self
                .state
                .update_batch_state(
                    batch_id,
                    BatchStatus::Received,
                    BatchStatus::Processing,
                    BatchUpdate::default(),
                )
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_conflict() => debug!("Batch {} already picked up: {}", batch_id, e),
                Err(e) => return Err(e),
            }
        }

        // Subscribe before the first dispatch so no completion is missed
        let mut completions = self.gateway.subscribe(batch_id).await;
        let result = self.drive(&definition, batch_id, &mut completions).await;
        self.gateway.unsubscribe(batch_id).await;

        let final_state = match result {
            Ok(state) => state,
            Err(e) => {
                error!("Batch {} stopped: {}", batch_id, e);
                return Err(e);
            }
        };

        info!("Batch {} finished: {}", batch_id, final_state.status);
        self.emit_event(ExecutionEvent::BatchFinished {
            batch_id: batch_id.to_string(),
            status: final_state.status,
        })
        .await;

        Ok(final_state)
    }

    /// Main execution loop
    async fn drive(
        &self,
        definition: &PipelineDefinition,
        batch_id: &str,
        completions: &mut mpsc::UnboundedReceiver<StepCompletion>,
    ) -> Result<BatchState> {
        let scheduler = ExecutionScheduler::new(definition);
        let batch = self.state.get_batch_state(batch_id).await?;
        if batch.status.is_terminal() {
            return Ok(batch);
        }

        let context = self.batch_context(&batch).await?;

        // Pre-flight: holds and deadline can stop a batch before anything runs
        let ctx = self.escalation_context(definition, &batch, &context);
        if let Some(payload) = self.escalation.route(&ctx).await? {
            return self.escalate(batch_id, payload).await;
        }

        if let Some(payload) = self.recover_stale(definition, &batch).await? {
            return self.escalate(batch_id, payload).await;
        }

        let mut refresh = false;
        loop {
            let batch = if refresh {
                self.state.refresh_batch_state(batch_id).await?
            } else {
                self.state.get_batch_state(batch_id).await?
            };
            refresh = false;
            if batch.status.is_terminal() {
                return Ok(batch);
            }

            let pass = self.dispatch_ready(definition, &batch).await?;
            if pass.committed > 0 {
                continue;
            }
            if pass.conflicted > 0 {
                // Our snapshot lost to another writer; decide again from the store
                debug!(
                    "Batch {}: {} step writes lost a race, re-reading state",
                    batch_id, pass.conflicted
                );
                refresh = true;
                continue;
            }

            if scheduler.is_finished(&batch) {
                return self.finish(&scheduler, batch).await;
            }

            if batch.in_flight().next().is_none() {
                error!(
                    "Batch {} has no runnable or in-flight steps but is not finished",
                    batch_id
                );
                return self.finish(&scheduler, batch).await;
            }

            let wait = tokio::time::timeout(self.settings.staleness_threshold(), completions.recv());
            match wait.await {
                Ok(Some(completion)) => {
                    if let Some(payload) = self
                        .handle_completion(definition, &batch, &context, completion)
                        .await?
                    {
                        return self.escalate(batch_id, payload).await;
                    }
                }
                Ok(None) => {
                    return Err(DispatchError::Unavailable(format!(
                        "completion channel for batch {} closed",
                        batch_id
                    ))
                    .into());
                }
                Err(_) => {
                    warn!(
                        "No completion for batch {} within {:?}",
                        batch_id,
                        self.settings.staleness_threshold()
                    );
                    let batch = self.state.get_batch_state(batch_id).await?;
                    if let Some(payload) = self.recover_stale(definition, &batch).await? {
                        return self.escalate(batch_id, payload).await;
                    }
                }
            }
        }
    }

    /// One readiness pass over a state snapshot
    async fn dispatch_ready(&self, definition: &PipelineDefinition, batch: &BatchState) -> Result<ReadyPass> {
        let scheduler = ExecutionScheduler::new(definition);
        let mut pass = ReadyPass::default();

        for scheduled in scheduler.next_steps(batch) {
            let Some(step) = definition.step(scheduled.step_order) else {
                continue;
            };

            match scheduled.decision {
                StepDecision::Skip(reason) => {
                    match self
                        .state
                        .update_step_state(
                            &batch.batch_id,
                            step.step_order,
                            StepStatus::Pending,
                            StepStatus::Skipped,
                            StepUpdate::new(),
                        )
                        .await
                    {
                        Ok(_) => {
                            pass.committed += 1;
                            info!("Skipping {} ({})", step.subroutine_name, reason);
                            self.emit_event(ExecutionEvent::StepSkipped {
                                step_order: step.step_order,
                                subroutine_name: step.subroutine_name.clone(),
                                reason,
                            })
                            .await;
                        }
                        Err(e) if e.is_conflict() => {
                            pass.conflicted += 1;
                            debug!("Skip of {} lost a race: {}", step.subroutine_name, e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                StepDecision::Dispatch => {
                    if self
                        .dispatch_step(&batch.batch_id, step, StepStatus::Pending)
                        .await?
                    {
                        pass.committed += 1;
                    } else {
                        pass.conflicted += 1;
                    }
                }
            }
        }

        Ok(pass)
    }

    /// Move a step to DISPATCHED from `from` and send it; false if another writer won
    async fn dispatch_step(&self, batch_id: &str, step: &PipelineStep, from: StepStatus) -> Result<bool> {
        let state = match self
            .state
            .update_step_state(batch_id, step.step_order, from, StepStatus::Dispatched, StepUpdate::new())
            .await
        {
            Ok(state) => state,
            Err(e) if e.is_conflict() => {
                debug!("Dispatch of {} lost a race: {}", step.subroutine_name, e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let request = StepRequest {
            batch_id: batch_id.to_string(),
            step_order: step.step_order,
            agent: step.agent,
            subroutine_name: step.subroutine_name.clone(),
            parameters: step.parameters.clone(),
            attempt: state.attempts(),
        };
        if let Err(e) = self.send_with_backoff(request).await {
            // Nothing left the process, so the attempt must not count
            if let Err(release) = self
                .state
                .release_dispatch(batch_id, step.step_order, state.attempts())
                .await
            {
                error!(
                    "Could not release unsent dispatch of {}: {}",
                    step.subroutine_name, release
                );
            }
            return Err(e);
        }

        self.emit_event(ExecutionEvent::StepDispatched {
            step_order: step.step_order,
            subroutine_name: step.subroutine_name.clone(),
            agent: step.agent.to_string(),
            attempt: state.attempts(),
        })
        .await;
        Ok(true)
    }

    async fn send_with_backoff(&self, request: StepRequest) -> Result<()> {
        let max_attempts = self.settings.transient_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.gateway.send_step_request(request.clone()).await {
                Ok(()) => return Ok(()),
                Err(DispatchError::Unavailable(reason)) if attempt < max_attempts => {
                    let delay = self.settings.transient_backoff(attempt);
                    warn!(
                        "Transport unavailable sending {} ({}), retrying in {:?}",
                        request.subroutine_name, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply one completion callback; returns a payload if the batch must escalate
    async fn handle_completion(
        &self,
        definition: &PipelineDefinition,
        batch: &BatchState,
        context: &BatchContext,
        completion: StepCompletion,
    ) -> Result<Option<EscalationPayload>> {
        let order = completion.step_order;
        let Some(step) = definition.step(order) else {
            warn!("Completion for unknown step {} of batch {}", order, batch.batch_id);
            return Ok(None);
        };
        let Some(current) = batch.step(order) else {
            return Err(OrchestratorError::StepNotFound {
                batch_id: batch.batch_id.clone(),
                step_order: order,
            });
        };

        if current.status != completion.expected_status {
            self.discard(order, format!(
                "expected {}, store has {}",
                completion.expected_status, current.status
            ))
            .await;
            return Ok(None);
        }
        if let Some(attempt) = completion.attempt {
            if attempt != current.attempts() {
                self.discard(order, format!(
                    "answers attempt {}, step is on attempt {}",
                    attempt,
                    current.attempts()
                ))
                .await;
                return Ok(None);
            }
        }

        let expected = completion.expected_status;
        match completion.status {
            StepStatus::Processing => {
                let update = self
                    .state
                    .update_step_state(&batch.batch_id, order, expected, StepStatus::Processing, StepUpdate::new())
                    .await;
                if self.absorb_conflict(order, update).await?.is_some() {
                    self.emit_event(ExecutionEvent::StepAcknowledged {
                        step_order: order,
                        subroutine_name: step.subroutine_name.clone(),
                    })
                    .await;
                }
                Ok(None)
            }
            StepStatus::Completed => {
                let update = StepUpdate::new().counts(
                    completion.record_count,
                    completion.error_count,
                    completion.warning_count,
                );
                let result = self
                    .state
                    .update_step_state(&batch.batch_id, order, expected, StepStatus::Completed, update)
                    .await;
                if self.absorb_conflict(order, result).await?.is_none() {
                    return Ok(None);
                }

                info!(
                    "{} completed ({} records, {} errors, {} warnings)",
                    step.subroutine_name,
                    completion.record_count,
                    completion.error_count,
                    completion.warning_count
                );
                self.emit_event(ExecutionEvent::StepCompleted {
                    step_order: order,
                    subroutine_name: step.subroutine_name.clone(),
                    record_count: completion.record_count,
                })
                .await;

                let mut ctx = self.escalation_context(definition, batch, context);
                ctx.schema_confidence = completion.metrics.schema_confidence;
                ctx.stop_issue_records = completion.metrics.stop_issue_records.unwrap_or(0);
                ctx.record_count = completion.record_count.max(ctx.record_count);
                ctx.contribution_total = completion.metrics.contribution_total;
                self.escalation.route(&ctx).await
            }
            StepStatus::Failed => {
                self.handle_failure(definition, batch, context, step, current.retry_count, completion)
                    .await
            }
            other => {
                self.discard(order, format!("{} is not a completion status", other))
                    .await;
                Ok(None)
            }
        }
    }

    async fn handle_failure(
        &self,
        definition: &PipelineDefinition,
        batch: &BatchState,
        context: &BatchContext,
        step: &PipelineStep,
        retry_count: u32,
        completion: StepCompletion,
    ) -> Result<Option<EscalationPayload>> {
        let attempt = retry_count + 1;
        let will_retry = attempt < self.settings.max_step_attempts;
        warn!(
            "{} failed on attempt {}/{}: {}",
            step.subroutine_name, attempt, self.settings.max_step_attempts, completion.error_details
        );

        if will_retry {
            if self
                .dispatch_step(&batch.batch_id, step, completion.expected_status)
                .await?
            {
                self.emit_event(ExecutionEvent::StepFailed {
                    step_order: step.step_order,
                    subroutine_name: step.subroutine_name.clone(),
                    error: completion.error_details,
                    attempt,
                    will_retry,
                })
                .await;
            }
            return Ok(None);
        }

        let update = StepUpdate::new()
            .counts(completion.record_count, completion.error_count, completion.warning_count)
            .error(completion.error_details.clone());
        let result = self
            .state
            .update_step_state(&batch.batch_id, step.step_order, completion.expected_status, StepStatus::Failed, update)
            .await;
        if self.absorb_conflict(step.step_order, result).await?.is_none() {
            return Ok(None);
        }

        self.emit_event(ExecutionEvent::StepFailed {
            step_order: step.step_order,
            subroutine_name: step.subroutine_name.clone(),
            error: completion.error_details.clone(),
            attempt,
            will_retry,
        })
        .await;

        if !step.required {
            info!("{} is optional, continuing", step.subroutine_name);
            return Ok(None);
        }

        let mut ctx = self.escalation_context(definition, batch, context);
        ctx.failed_step = Some(FailedStep {
            subroutine_name: step.subroutine_name.clone(),
            attempts: attempt,
            error_details: completion.error_details,
        });
        self.escalation.route(&ctx).await
    }

    /// Re-dispatch lost in-flight steps, or fail them once out of attempts
    async fn recover_stale(
        &self,
        definition: &PipelineDefinition,
        batch: &BatchState,
    ) -> Result<Option<EscalationPayload>> {
        let scheduler = ExecutionScheduler::new(definition);
        let stale = scheduler.stale_steps(batch, self.settings.staleness_threshold(), Utc::now());

        for order in stale {
            let (Some(step), Some(current)) = (definition.step(order), batch.step(order)) else {
                continue;
            };
            let attempt = current.attempts();
            warn!(
                "{} of batch {} looks lost in flight (attempt {})",
                step.subroutine_name, batch.batch_id, attempt
            );

            if attempt < self.settings.max_step_attempts {
                if self.dispatch_step(&batch.batch_id, step, current.status).await? {
                    self.emit_event(ExecutionEvent::StepRecovered {
                        step_order: order,
                        subroutine_name: step.subroutine_name.clone(),
                    })
                    .await;
                }
                continue;
            }

            let error = format!("no completion after {} attempts", attempt);
            let result = self
                .state
                .update_step_state(
                    &batch.batch_id,
                    order,
                    current.status,
                    StepStatus::Failed,
                    StepUpdate::new().error(error.clone()),
                )
                .await;
            if self.absorb_conflict(order, result).await?.is_none() {
                continue;
            }
            self.emit_event(ExecutionEvent::StepFailed {
                step_order: order,
                subroutine_name: step.subroutine_name.clone(),
                error: error.clone(),
                attempt,
                will_retry: false,
            })
            .await;

            if step.required {
                let context = self.batch_context(batch).await?;
                let mut ctx = self.escalation_context(definition, batch, &context);
                ctx.failed_step = Some(FailedStep {
                    subroutine_name: step.subroutine_name.clone(),
                    attempts: attempt,
                    error_details: error,
                });
                return self.escalation.route(&ctx).await;
            }
        }

        Ok(None)
    }

    async fn batch_context(&self, batch: &BatchState) -> Result<BatchContext> {
        let holds = self.rules.plan_holds(&batch.plan_id).await?;
        let config = self.rules.client_config(&batch.plan_id, &batch.pay_freq).await?;

        Ok(BatchContext {
            held_client_ids: holds
                .into_iter()
                .map(|h| h.client_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            deadline_hour_utc: config.deadline_hour_utc,
            contribution_baseline: config.contribution_baseline,
        })
    }

    fn escalation_context(
        &self,
        definition: &PipelineDefinition,
        batch: &BatchState,
        context: &BatchContext,
    ) -> EscalationContext {
        let mut ctx = EscalationContext::new(&batch.batch_id, &batch.plan_id);
        ctx.record_count = batch.steps.iter().map(|s| s.record_count).max().unwrap_or(0);
        ctx.stop_issue_policy = definition.stop_issue_policy;
        ctx.held_client_ids = context.held_client_ids.clone();
        ctx.custodian_deadline = context
            .deadline_hour_utc
            .and_then(|hour| custodian_deadline(ctx.now, hour));
        ctx.contribution_baseline = context.contribution_baseline;
        ctx
    }

    /// Turn a conflict into `None`, logging it as a stale or duplicate delivery
    async fn absorb_conflict<T>(&self, step_order: u32, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_conflict() => {
                self.discard(step_order, e.to_string()).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn discard(&self, step_order: u32, reason: String) {
        debug!("Discarding completion for step {}: {}", step_order, reason);
        self.emit_event(ExecutionEvent::CompletionDiscarded { step_order, reason })
            .await;
    }

    async fn escalate(&self, batch_id: &str, payload: EscalationPayload) -> Result<BatchState> {
        let batch = self.state.get_batch_state(batch_id).await?;
        if batch.status.is_terminal() {
            return Ok(batch);
        }

        match self
            .state
            .update_batch_state(
                batch_id,
                batch.status,
                BatchStatus::Escalated,
                BatchUpdate::escalated(payload.reason.clone()),
            )
            .await
        {
            Ok(()) => {
                self.emit_event(ExecutionEvent::BatchEscalated {
                    batch_id: batch_id.to_string(),
                    payload,
                })
                .await;
            }
            Err(e) if e.is_conflict() => debug!("Escalation of batch {} lost a race: {}", batch_id, e),
            Err(e) => return Err(e),
        }

        self.state.get_batch_state(batch_id).await
    }

    async fn finish(&self, scheduler: &ExecutionScheduler<'_>, batch: BatchState) -> Result<BatchState> {
        let status = scheduler.outcome(&batch);
        let records = batch.steps.iter().map(|s| s.record_count).max().unwrap_or(0);

        match self
            .state
            .update_batch_state(
                &batch.batch_id,
                batch.status,
                status,
                BatchUpdate::default().records(records),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => debug!("Finalizing batch {} lost a race: {}", batch.batch_id, e),
            Err(e) => return Err(e),
        }

        self.state.get_batch_state(&batch.batch_id).await
    }
}
