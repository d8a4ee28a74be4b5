use super::{OperationStorage, StorageFuture};
use crate::error::StorageError;
use crate::types::{
    CampaignId, InstanceId, Operation, OperationFilter, OperationId, OperationState,
    OperationType, Page,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct MemoryState {
    operations: HashMap<OperationId, Operation>,
    injected_failures: VecDeque<StorageError>,
}

/// Process-local driver with the same concurrency contract as Postgres.
///
/// Clones share the same backing map.
#[derive(Clone, Default)]
pub struct MemoryOperationStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryOperationStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues errors returned, one per call, before any further call is served.
    pub fn inject_failures(&self, failures: impl IntoIterator<Item = StorageError>) {
        self.lock().injected_failures.extend(failures);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn serve<T>(
        &self,
        handler: impl FnOnce(&mut MemoryState) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut state = self.lock();
        match state.injected_failures.pop_front() {
            Some(failure) => Err(failure),
            None => handler(&mut state),
        }
    }

    fn select(
        &self,
        predicate: impl Fn(&Operation) -> bool,
    ) -> Result<Vec<Operation>, StorageError> {
        self.serve(|state| Ok(oldest_first(state.operations.values().filter(|&op| predicate(op)))))
    }
}

fn oldest_first<'a>(operations: impl Iterator<Item = &'a Operation>) -> Vec<Operation> {
    let mut selected: Vec<Operation> = operations.cloned().collect();
    selected.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    selected
}

fn not_found(what: &str, key: impl std::fmt::Display) -> StorageError {
    StorageError::NotFound(format!("{what} {key}"))
}

impl OperationStorage for MemoryOperationStorage {
    fn insert<'a>(&'a self, operation: &'a Operation) -> StorageFuture<'a, ()> {
        let result = self.serve(|state| {
            if state.operations.contains_key(&operation.id) {
                return Err(StorageError::AlreadyExists(format!(
                    "operation {}",
                    operation.id
                )));
            }
            state
                .operations
                .insert(operation.id.clone(), operation.clone());
            Ok(())
        });
        Box::pin(std::future::ready(result))
    }

    fn update<'a>(&'a self, operation: &'a Operation) -> StorageFuture<'a, Operation> {
        let result = self.serve(|state| {
            let stored = state
                .operations
                .get_mut(&operation.id)
                .ok_or_else(|| not_found("operation", &operation.id))?;
            if stored.version != operation.version {
                return Err(StorageError::Conflict(format!(
                    "operation {} is at version {}, update was based on {}",
                    operation.id, stored.version, operation.version
                )));
            }
            let mut next = operation.clone();
            next.version = operation.version.saturating_add(1);
            next.updated_at = Utc::now();
            stored.clone_from(&next);
            Ok(next)
        });
        Box::pin(std::future::ready(result))
    }

    fn get_by_id<'a>(&'a self, id: &'a OperationId) -> StorageFuture<'a, Operation> {
        let result = self.serve(|state| {
            state
                .operations
                .get(id)
                .cloned()
                .ok_or_else(|| not_found("operation", id))
        });
        Box::pin(std::future::ready(result))
    }

    fn get_by_instance_id<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Operation> {
        let result = self
            .select(|op| &op.instance_id == instance_id)
            .and_then(|ops| {
                ops.into_iter()
                    .last()
                    .ok_or_else(|| not_found("operation for instance", instance_id))
            });
        Box::pin(std::future::ready(result))
    }

    fn get_last_operation<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Operation> {
        let result = self
            .select(|op| &op.instance_id == instance_id && op.state != OperationState::Pending)
            .and_then(|ops| {
                ops.into_iter()
                    .last()
                    .ok_or_else(|| not_found("last operation for instance", instance_id))
            });
        Box::pin(std::future::ready(result))
    }

    fn list_by_instance_id<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Vec<Operation>> {
        let result = self.select(|op| &op.instance_id == instance_id);
        Box::pin(std::future::ready(result))
    }

    fn get_not_finished_by_type(
        &self,
        operation_type: OperationType,
    ) -> StorageFuture<'_, Vec<Operation>> {
        let result =
            self.select(|op| op.operation_type == operation_type && !op.state.is_terminal());
        Box::pin(std::future::ready(result))
    }

    fn get_for_ids<'a>(&'a self, ids: &'a [OperationId]) -> StorageFuture<'a, Vec<Operation>> {
        let result = self.select(|op| ids.contains(&op.id));
        Box::pin(std::future::ready(result))
    }

    fn list_in_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Operation>> {
        let result = self.select(|op| op.created_at >= from && op.created_at <= to);
        Box::pin(std::future::ready(result))
    }

    fn list<'a>(&'a self, filter: &'a OperationFilter) -> StorageFuture<'a, Page<Operation>> {
        let result = self
            .select(|op| filter.matches(op))
            .map(|ops| filter.paginate(ops));
        Box::pin(std::future::ready(result))
    }

    fn list_by_campaign<'a>(
        &'a self,
        campaign_id: &'a CampaignId,
    ) -> StorageFuture<'a, Vec<Operation>> {
        let result = self.select(|op| op.campaign_id.as_ref() == Some(campaign_id));
        Box::pin(std::future::ready(result))
    }
}

#[cfg(test)]
mod bdd_tests {
    #![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

    use super::MemoryOperationStorage;
    use crate::error::StorageError;
    use crate::storage::OperationStorage;
    use crate::types::{
        CampaignId, InstanceId, Operation, OperationFilter, OperationId, OperationState,
        OperationType,
    };
    use chrono::{Duration, TimeZone, Utc};

    fn given_operation_at(id: &str, instance: &str, minute: u32) -> Operation {
        Operation::new(
            OperationId::new(id),
            OperationType::UpgradeKyma,
            InstanceId::new(instance),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
        )
    }

    async fn given_storage_with(operations: &[Operation]) -> MemoryOperationStorage {
        let storage = MemoryOperationStorage::new();
        for op in operations {
            storage.insert(op).await.unwrap();
        }
        storage
    }

    #[tokio::test]
    async fn when_inserting_duplicate_id_then_already_exists_is_reported() {
        let op = given_operation_at("op-1", "inst-1", 0);
        let storage = given_storage_with(&[op.clone()]).await;

        let duplicate = storage.insert(&op).await;

        assert!(matches!(duplicate, Err(StorageError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn when_update_matches_version_then_version_increments() {
        let op = given_operation_at("op-1", "inst-1", 0);
        let storage = given_storage_with(&[op.clone()]).await;

        let updated = storage.update(&op).await.unwrap();
        let reread = storage.get_by_id(&op.id).await.unwrap();

        assert_eq!(updated.version, 1);
        assert_eq!(reread, updated);
        assert!(updated.updated_at >= op.updated_at);
    }

    #[tokio::test]
    async fn when_two_writers_share_a_version_then_exactly_one_wins() {
        let op = given_operation_at("op-1", "inst-1", 0);
        let storage = given_storage_with(&[op.clone()]).await;
        let mut first = op.clone();
        first.description = "first".to_string();
        let mut second = op;
        second.description = "second".to_string();

        let first_result = storage.update(&first).await;
        let second_result = storage.update(&second).await;

        assert!(first_result.is_ok());
        assert!(matches!(second_result, Err(StorageError::Conflict(_))));
        let stored = storage.get_by_id(&first.id).await.unwrap();
        assert_eq!(stored.description, "first");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn when_updating_missing_record_then_not_found_is_reported() {
        let storage = MemoryOperationStorage::new();

        let result = storage.update(&given_operation_at("ghost", "inst", 0)).await;

        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn when_reading_by_instance_then_latest_and_last_started_are_distinguished() {
        let mut started = given_operation_at("op-1", "inst-1", 0);
        started.state = OperationState::Succeeded;
        let pending = given_operation_at("op-2", "inst-1", 5);
        let storage = given_storage_with(&[started, pending]).await;
        let instance = InstanceId::new("inst-1");

        let latest = storage.get_by_instance_id(&instance).await.unwrap();
        let last = storage.get_last_operation(&instance).await.unwrap();
        let history = storage.list_by_instance_id(&instance).await.unwrap();

        assert_eq!(latest.id.value(), "op-2");
        assert_eq!(last.id.value(), "op-1");
        assert_eq!(
            history.iter().map(|op| op.id.value()).collect::<Vec<_>>(),
            vec!["op-1", "op-2"]
        );
    }

    #[tokio::test]
    async fn when_listing_unfinished_by_type_then_terminal_records_are_excluded() {
        let mut done = given_operation_at("op-1", "inst-1", 0);
        done.state = OperationState::Failed;
        let mut retrying = given_operation_at("op-2", "inst-2", 1);
        retrying.state = OperationState::Retrying;
        let other_type = Operation::new(
            OperationId::new("op-3"),
            OperationType::Provision,
            InstanceId::new("inst-3"),
            Utc::now(),
        );
        let storage = given_storage_with(&[done, retrying, other_type]).await;

        let unfinished = storage
            .get_not_finished_by_type(OperationType::UpgradeKyma)
            .await
            .unwrap();

        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id.value(), "op-2");
    }

    #[tokio::test]
    async fn when_listing_with_filter_then_page_and_total_are_reported() {
        let campaign = CampaignId::new("camp-1");
        let ops: Vec<Operation> = (0..5)
            .map(|i| {
                given_operation_at(&format!("op-{i}"), &format!("inst-{i}"), i)
                    .with_campaign(campaign.clone())
            })
            .collect();
        let storage = given_storage_with(&ops).await;
        let filter = OperationFilter::default()
            .with_campaign(campaign.clone())
            .with_page(2, 2);

        let page = storage.list(&filter).await.unwrap();

        assert_eq!(page.count, 2);
        assert_eq!(page.total_count, 5);
        assert_eq!(page.data[0].id.value(), "op-2");
        assert_eq!(storage.list_by_campaign(&campaign).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn when_listing_time_range_then_bounds_are_inclusive() {
        let ops = [
            given_operation_at("op-0", "inst", 0),
            given_operation_at("op-1", "inst", 10),
            given_operation_at("op-2", "inst", 20),
        ];
        let storage = given_storage_with(&ops).await;
        let from = ops[0].created_at + Duration::minutes(10);

        let in_range = storage
            .list_in_time_range(from, from + Duration::minutes(10))
            .await
            .unwrap();
        let by_ids = storage
            .get_for_ids(&[OperationId::new("op-0"), OperationId::new("missing")])
            .await
            .unwrap();

        assert_eq!(in_range.len(), 2);
        assert_eq!(by_ids.len(), 1);
    }
}
