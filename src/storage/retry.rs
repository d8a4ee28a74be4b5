#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::{OperationStorage, StorageFuture};
use crate::error::StorageError;
use crate::types::{
    CampaignId, InstanceId, Operation, OperationFilter, OperationId, OperationType, Page,
    DEFAULT_PAGE_SIZE,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed-interval polling budget for transient storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_TIMEOUT)
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether another attempt still fits in the budget after `elapsed`.
    #[must_use]
    pub fn allows_attempt_after(&self, elapsed: Duration) -> bool {
        elapsed.saturating_add(self.interval) <= self.timeout
    }
}

/// Runs `attempt` immediately and then once per interval while it keeps
/// failing with a transient error and the timeout is not exhausted.
///
/// Any non-transient error, `Conflict` included, is returned on first sight.
///
/// # Errors
/// Returns the last error produced by `attempt`.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    action: &str,
    mut attempt: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 1;
    loop {
        match attempt().await {
            Err(error) if error.is_retryable() && policy.allows_attempt_after(started.elapsed()) => {
                warn!(
                    "Transient storage failure while {} (attempt {}): {}; retrying in {:?}",
                    action, attempts, error, policy.interval
                );
                tokio::time::sleep(policy.interval).await;
                attempts = attempts.saturating_add(1);
            }
            outcome => return outcome,
        }
    }
}

/// Storage facade used by the engine: a driver plus transient retry.
pub struct OperationRepository<S> {
    driver: S,
    policy: RetryPolicy,
    max_page_size: u32,
}

impl<S> OperationRepository<S> {
    #[must_use]
    pub const fn new(driver: S, policy: RetryPolicy) -> Self {
        Self {
            driver,
            policy,
            max_page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Upper bound applied to every `list` page; a zero page size falls back to it.
    #[must_use]
    pub const fn with_max_page_size(mut self, max_page_size: u32) -> Self {
        self.max_page_size = max_page_size;
        self
    }

    #[must_use]
    pub const fn max_page_size(&self) -> u32 {
        self.max_page_size
    }

    #[must_use]
    pub const fn driver(&self) -> &S {
        &self.driver
    }

    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

impl<S: OperationStorage> OperationStorage for OperationRepository<S> {
    fn insert<'a>(&'a self, operation: &'a Operation) -> StorageFuture<'a, ()> {
        Box::pin(retry_transient(self.policy, "inserting operation", move || {
            self.driver.insert(operation)
        }))
    }

    fn update<'a>(&'a self, operation: &'a Operation) -> StorageFuture<'a, Operation> {
        Box::pin(retry_transient(self.policy, "updating operation", move || {
            self.driver.update(operation)
        }))
    }

    fn get_by_id<'a>(&'a self, id: &'a OperationId) -> StorageFuture<'a, Operation> {
        Box::pin(retry_transient(self.policy, "reading operation", move || {
            self.driver.get_by_id(id)
        }))
    }

    fn get_by_instance_id<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Operation> {
        Box::pin(retry_transient(
            self.policy,
            "reading instance operation",
            move || self.driver.get_by_instance_id(instance_id),
        ))
    }

    fn get_last_operation<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Operation> {
        Box::pin(retry_transient(
            self.policy,
            "reading last operation",
            move || self.driver.get_last_operation(instance_id),
        ))
    }

    fn list_by_instance_id<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Vec<Operation>> {
        Box::pin(retry_transient(
            self.policy,
            "listing instance operations",
            move || self.driver.list_by_instance_id(instance_id),
        ))
    }

    fn get_not_finished_by_type(
        &self,
        operation_type: OperationType,
    ) -> StorageFuture<'_, Vec<Operation>> {
        Box::pin(retry_transient(
            self.policy,
            "listing unfinished operations",
            move || self.driver.get_not_finished_by_type(operation_type),
        ))
    }

    fn get_for_ids<'a>(&'a self, ids: &'a [OperationId]) -> StorageFuture<'a, Vec<Operation>> {
        Box::pin(retry_transient(
            self.policy,
            "reading operations by id",
            move || self.driver.get_for_ids(ids),
        ))
    }

    fn list_in_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Operation>> {
        Box::pin(retry_transient(
            self.policy,
            "listing operations in time range",
            move || self.driver.list_in_time_range(from, to),
        ))
    }

    fn list<'a>(&'a self, filter: &'a OperationFilter) -> StorageFuture<'a, Page<Operation>> {
        let filter = filter.clone().normalized(self.max_page_size);
        Box::pin(async move {
            retry_transient(self.policy, "listing operations", || self.driver.list(&filter)).await
        })
    }

    fn list_by_campaign<'a>(
        &'a self,
        campaign_id: &'a CampaignId,
    ) -> StorageFuture<'a, Vec<Operation>> {
        Box::pin(retry_transient(
            self.policy,
            "listing campaign operations",
            move || self.driver.list_by_campaign(campaign_id),
        ))
    }
}
