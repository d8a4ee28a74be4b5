use crate::error::StepError;
use crate::types::{Operation, OperationId};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub type StepFuture<'a> = Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>>;

/// What a step reports after one invocation.
///
/// * `error: Some(Terminal)` fails the operation.
/// * `error: Some(Transient)` retries the step after the engine's retry interval.
/// * `retry_after > 0` re-enters the step after that delay.
/// * otherwise the step is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub operation: Operation,
    pub retry_after: Duration,
    pub error: Option<StepError>,
}

impl StepOutcome {
    #[must_use]
    pub const fn completed(operation: Operation) -> Self {
        Self {
            operation,
            retry_after: Duration::ZERO,
            error: None,
        }
    }

    #[must_use]
    pub const fn retry_after(operation: Operation, delay: Duration) -> Self {
        Self {
            operation,
            retry_after: delay,
            error: None,
        }
    }

    #[must_use]
    pub const fn failed(operation: Operation, error: StepError) -> Self {
        Self {
            operation,
            retry_after: Duration::ZERO,
            error: Some(error),
        }
    }
}

/// One unit of business work.
///
/// Steps must be idempotent: after a crash or a lost version race the same
/// step may run again against the same operation.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn run<'a>(&'a self, operation: Operation, log: &'a StepLogger) -> StepFuture<'a>;
}

/// Adapts a synchronous closure into a [`Step`].
pub struct FnStep<F> {
    name: String,
    run: F,
}

impl<F> FnStep<F>
where
    F: Fn(Operation, &StepLogger) -> StepOutcome + Send + Sync,
{
    #[must_use]
    pub fn new(name: impl Into<String>, run: F) -> Self {
        Self {
            name: name.into(),
            run,
        }
    }
}

impl<F> Step for FnStep<F>
where
    F: Fn(Operation, &StepLogger) -> StepOutcome + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, operation: Operation, log: &'a StepLogger) -> StepFuture<'a> {
        let outcome = (self.run)(operation, log);
        Box::pin(std::future::ready(outcome))
    }
}

/// Log sink handed to a step, scoped to one operation, stage and step.
#[derive(Debug, Clone)]
pub struct StepLogger {
    operation_id: OperationId,
    stage: String,
    step: String,
}

impl StepLogger {
    #[must_use]
    pub fn new(operation_id: OperationId, stage: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            operation_id,
            stage: stage.into(),
            step: step.into(),
        }
    }

    #[must_use]
    pub const fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn debug(&self, message: &str) {
        debug!(operation = %self.operation_id, stage = %self.stage, step = %self.step, "{message}");
    }

    pub fn info(&self, message: &str) {
        info!(operation = %self.operation_id, stage = %self.stage, step = %self.step, "{message}");
    }

    pub fn warn(&self, message: &str) {
        warn!(operation = %self.operation_id, stage = %self.stage, step = %self.step, "{message}");
    }

    pub fn error(&self, message: &str) {
        error!(operation = %self.operation_id, stage = %self.stage, step = %self.step, "{message}");
    }
}
