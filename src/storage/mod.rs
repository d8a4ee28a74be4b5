//! Operation persistence.
//!
//! Drivers implement [`OperationStorage`] with single-attempt semantics and
//! optimistic concurrency on `version`. [`OperationRepository`] wraps any
//! driver with the bounded transient-failure retry used by the engine.

pub mod mappers;
pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::MemoryOperationStorage;
pub use postgres::PgOperationStorage;
pub use retry::{OperationRepository, RetryPolicy};

use crate::error::StorageError;
use crate::types::{
    CampaignId, InstanceId, Operation, OperationFilter, OperationId, OperationType, Page,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

pub type StorageFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, StorageError>> + Send + 'a>>;

pub trait OperationStorage: Send + Sync {
    /// Persists a new record. Fails with `AlreadyExists` on a duplicate id.
    fn insert<'a>(&'a self, operation: &'a Operation) -> StorageFuture<'a, ()>;

    /// Compare-and-swap on `operation.version`.
    ///
    /// Returns the stored record with `version + 1` and a refreshed
    /// `updated_at`. A stale version yields `Conflict`, a missing record
    /// yields `NotFound`.
    fn update<'a>(&'a self, operation: &'a Operation) -> StorageFuture<'a, Operation>;

    fn get_by_id<'a>(&'a self, id: &'a OperationId) -> StorageFuture<'a, Operation>;

    /// Most recently created operation of the instance.
    fn get_by_instance_id<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Operation>;

    /// Most recently created operation of the instance that has left `Pending`.
    fn get_last_operation<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Operation>;

    /// All operations of the instance, oldest first.
    fn list_by_instance_id<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Vec<Operation>>;

    /// Non-terminal operations of one type, oldest first.
    fn get_not_finished_by_type(
        &self,
        operation_type: OperationType,
    ) -> StorageFuture<'_, Vec<Operation>>;

    fn get_for_ids<'a>(&'a self, ids: &'a [OperationId]) -> StorageFuture<'a, Vec<Operation>>;

    /// Operations created within `[from, to]`, oldest first.
    fn list_in_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Operation>>;

    fn list<'a>(&'a self, filter: &'a OperationFilter) -> StorageFuture<'a, Page<Operation>>;

    /// Every operation carrying the campaign id, oldest first.
    fn list_by_campaign<'a>(
        &'a self,
        campaign_id: &'a CampaignId,
    ) -> StorageFuture<'a, Vec<Operation>>;
}
