#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::clock::{Clock, SystemClock};
use super::events::{EventSink, OperationEvent};
use super::pipeline::{Pipeline, Stage};
use super::queue::{ExecuteFuture, Executor};
use super::step::StepLogger;
use crate::error::{Result, StepError, StorageError};
use crate::storage::OperationStorage;
use crate::types::{Operation, OperationId, OperationState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_STEP_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Maximum lifetime of an operation, measured from `created_at`.
    pub operation_timeout: Duration,
    /// Delay before re-entering a step that reported a transient error.
    pub step_retry_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            step_retry_interval: DEFAULT_STEP_RETRY_INTERVAL,
        }
    }
}

/// Result of one dispatch of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The operation is terminal, either now or already on load.
    Finished(OperationState),
    /// Re-dispatch after the delay.
    RetryAfter(Duration),
    /// A concurrent writer advanced the record; this dispatch stopped without writing.
    Abandoned,
}

enum StepVerdict {
    Continue,
    Retry(Duration),
    Fail(String),
}

/// Drives one operation through a fixed stage pipeline.
pub struct StagedManager {
    storage: Arc<dyn OperationStorage>,
    pipeline: Arc<Pipeline>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
}

impl StagedManager {
    #[must_use]
    pub fn new(
        storage: Arc<dyn OperationStorage>,
        pipeline: Arc<Pipeline>,
        events: Arc<dyn EventSink>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            storage,
            pipeline,
            events,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    #[must_use]
    pub const fn config(&self) -> ManagerConfig {
        self.config
    }

    /// Advances the operation as far as it can go in one dispatch.
    ///
    /// Stages already recorded as finished are skipped. Every step outcome
    /// and every stage completion is persisted before the next step runs.
    ///
    /// # Errors
    /// Returns storage errors other than version conflicts, which end the
    /// dispatch as [`DispatchOutcome::Abandoned`].
    pub async fn execute(&self, operation_id: &OperationId) -> Result<DispatchOutcome> {
        let mut operation = self.storage.get_by_id(operation_id).await?;

        if operation.is_finished() {
            debug!(
                "Operation {} is already {}, nothing to dispatch",
                operation.id, operation.state
            );
            return Ok(DispatchOutcome::Finished(operation.state));
        }
        if let Err(error) = self.pipeline.check_finished(&operation.finished_stages) {
            return self.fail(operation, error.to_string()).await;
        }
        if self.is_expired(&operation) {
            let reason = self.expiry_reason();
            return self.fail(operation, reason).await;
        }

        if operation.state == OperationState::Pending {
            operation.state = OperationState::InProgress;
            let Some(stored) = self.persist(&operation).await? else {
                return Ok(DispatchOutcome::Abandoned);
            };
            info!("Operation {} ({}) started", stored.id, stored.operation_type);
            operation = stored;
        }

        for stage in self.pipeline.stages() {
            if operation.finished_stages.contains(stage.name()) {
                continue;
            }
            match self.run_stage(stage, operation).await? {
                Ok(advanced) => operation = advanced,
                Err(outcome) => return Ok(outcome),
            }
        }

        operation.state = OperationState::Succeeded;
        let Some(stored) = self.persist(&operation).await? else {
            return Ok(DispatchOutcome::Abandoned);
        };
        info!("Operation {} succeeded", stored.id);
        self.events
            .publish(OperationEvent::OperationSucceeded { operation: stored });
        Ok(DispatchOutcome::Finished(OperationState::Succeeded))
    }

    /// Runs the applicable steps of one stage and records the stage as finished.
    ///
    /// The inner `Err` carries the outcome when the dispatch has to stop inside the stage.
    async fn run_stage(
        &self,
        stage: &Stage,
        mut operation: Operation,
    ) -> Result<std::result::Result<Operation, DispatchOutcome>> {
        for entry in stage.steps() {
            if !entry.applies_to(&operation) {
                debug!(
                    "Operation {} skips step {} of stage {}",
                    operation.id,
                    entry.name(),
                    stage.name()
                );
                continue;
            }

            let log = StepLogger::new(operation.id.clone(), stage.name(), entry.name());
            let outcome = entry.step().run(operation.clone(), &log).await;
            let mut next = absorb_step_changes(&operation, outcome.operation);
            let verdict = self.judge(&next, outcome.error.as_ref(), outcome.retry_after);

            match verdict {
                StepVerdict::Fail(reason) => {
                    let Some(stored) = self.persist_failure(next, &reason).await? else {
                        return Ok(Err(DispatchOutcome::Abandoned));
                    };
                    self.publish_step(
                        &stored,
                        stage,
                        entry.name(),
                        outcome.retry_after,
                        outcome.error.as_ref(),
                    );
                    return Ok(Err(self.announce_failure(stored, reason)));
                }
                StepVerdict::Retry(delay) => {
                    next.state = OperationState::Retrying;
                    let Some(stored) = self.persist(&next).await? else {
                        return Ok(Err(DispatchOutcome::Abandoned));
                    };
                    log.info(&format!("retrying in {delay:?}"));
                    self.publish_step(
                        &stored,
                        stage,
                        entry.name(),
                        delay,
                        outcome.error.as_ref(),
                    );
                    return Ok(Err(DispatchOutcome::RetryAfter(delay)));
                }
                StepVerdict::Continue => {
                    next.state = OperationState::InProgress;
                    let Some(stored) = self.persist(&next).await? else {
                        return Ok(Err(DispatchOutcome::Abandoned));
                    };
                    self.publish_step(&stored, stage, entry.name(), Duration::ZERO, None);
                    operation = stored;
                }
            }
        }

        operation.finished_stages.mark(stage.name());
        let Some(stored) = self.persist(&operation).await? else {
            return Ok(Err(DispatchOutcome::Abandoned));
        };
        info!("Operation {} finished stage {}", stored.id, stage.name());
        Ok(Ok(stored))
    }

    fn judge(
        &self,
        operation: &Operation,
        error: Option<&StepError>,
        retry_after: Duration,
    ) -> StepVerdict {
        match error {
            Some(StepError::Terminal(reason)) => StepVerdict::Fail(reason.clone()),
            _ if self.is_expired(operation) => StepVerdict::Fail(self.expiry_reason()),
            Some(StepError::Transient(_)) => StepVerdict::Retry(self.config.step_retry_interval),
            None if !retry_after.is_zero() => StepVerdict::Retry(retry_after),
            None => StepVerdict::Continue,
        }
    }

    fn is_expired(&self, operation: &Operation) -> bool {
        operation.is_expired(self.config.operation_timeout, self.clock.now())
    }

    fn expiry_reason(&self) -> String {
        format!(
            "operation exceeded its timeout of {:?}",
            self.config.operation_timeout
        )
    }

    async fn fail(&self, operation: Operation, reason: String) -> Result<DispatchOutcome> {
        let Some(stored) = self.persist_failure(operation, &reason).await? else {
            return Ok(DispatchOutcome::Abandoned);
        };
        Ok(self.announce_failure(stored, reason))
    }

    async fn persist_failure(
        &self,
        mut operation: Operation,
        reason: &str,
    ) -> Result<Option<Operation>> {
        operation.state = OperationState::Failed;
        reason.clone_into(&mut operation.description);
        self.persist(&operation).await
    }

    fn announce_failure(&self, stored: Operation, reason: String) -> DispatchOutcome {
        error!("Operation {} failed: {}", stored.id, reason);
        self.events.publish(OperationEvent::OperationFailed {
            operation: stored,
            reason,
        });
        DispatchOutcome::Finished(OperationState::Failed)
    }

    /// `None` when another writer got there first.
    async fn persist(&self, operation: &Operation) -> Result<Option<Operation>> {
        match self.storage.update(operation).await {
            Ok(stored) => Ok(Some(stored)),
            Err(StorageError::Conflict(detail)) => {
                warn!(
                    "Operation {} was modified concurrently, abandoning dispatch: {}",
                    operation.id, detail
                );
                Ok(None)
            }
            Err(other) => Err(other.into()),
        }
    }

    fn publish_step(
        &self,
        operation: &Operation,
        stage: &Stage,
        step: &str,
        retry_after: Duration,
        error: Option<&StepError>,
    ) {
        self.events.publish(OperationEvent::StepProcessed {
            operation: operation.clone(),
            stage: stage.name().to_string(),
            step: step.to_string(),
            retry_after,
            error: error.map(ToString::to_string),
        });
    }
}

/// Steps own the payload and description; everything else belongs to the engine.
fn absorb_step_changes(current: &Operation, returned: Operation) -> Operation {
    Operation {
        payload: returned.payload,
        description: returned.description,
        ..current.clone()
    }
}

impl Executor for StagedManager {
    fn execute<'a>(&'a self, operation_id: &'a OperationId) -> ExecuteFuture<'a> {
        Box::pin(Self::execute(self, operation_id))
    }
}
