#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::manager::DispatchOutcome;
use crate::error::{BrokerError, Result, StorageError};
use crate::storage::OperationStorage;
use crate::types::{OperationId, OperationType};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type ExecuteFuture<'a> = Pin<Box<dyn Future<Output = Result<DispatchOutcome>> + Send + 'a>>;

pub const DEFAULT_STORAGE_REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Processes one operation per call. Implemented by the staged manager.
pub trait Executor: Send + Sync {
    fn execute<'a>(&'a self, operation_id: &'a OperationId) -> ExecuteFuture<'a>;
}

#[derive(Default)]
struct PendingState {
    queue: VecDeque<OperationId>,
    /// Ids waiting for a worker, including ones re-added while processing.
    dirty: HashSet<OperationId>,
    processing: HashSet<OperationId>,
    shutting_down: bool,
}

/// Deduplicating work set. An id is handed to at most one worker at a time.
#[derive(Default)]
struct WorkSet {
    state: Mutex<PendingState>,
    notify: Notify,
}

impl WorkSet {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, id: OperationId) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&id) {
            return;
        }
        state.dirty.insert(id.clone());
        if state.processing.contains(&id) {
            return;
        }
        state.queue.push_back(id);
        drop(state);
        self.notify.notify_one();
    }

    async fn next(&self) -> Option<OperationId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(id) = state.queue.pop_front() {
                    state.dirty.remove(&id);
                    state.processing.insert(id.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(id);
                }
            }
            notified.await;
        }
    }

    fn done(&self, id: &OperationId) {
        let mut state = self.lock();
        state.processing.remove(id);
        if state.dirty.contains(id) && !state.shutting_down {
            state.queue.push_back(id.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.lock().dirty.len()
    }
}

struct Shared {
    name: String,
    work: WorkSet,
    executor: Arc<dyn Executor>,
    speed_factor: AtomicU32,
    storage_requeue_delay: Duration,
}

impl Shared {
    fn compress(&self, delay: Duration) -> Duration {
        delay / self.speed_factor.load(Ordering::Relaxed).max(1)
    }
}

/// Worker pool feeding operation ids to an [`Executor`].
pub struct Queue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Queue {
    #[must_use]
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self::with_storage_requeue_delay(name, executor, DEFAULT_STORAGE_REQUEUE_DELAY)
    }

    /// `storage_requeue_delay` applies when a dispatch ends on an exhausted
    /// transient storage failure.
    #[must_use]
    pub fn with_storage_requeue_delay(
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
        storage_requeue_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                work: WorkSet::default(),
                executor,
                speed_factor: AtomicU32::new(1),
                storage_requeue_delay,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Ids waiting for dispatch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.work.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Divides every delay the queue waits by `factor`.
    pub fn speed_up(&self, factor: u32) {
        self.shared
            .speed_factor
            .store(factor.max(1), Ordering::Relaxed);
    }

    pub fn add(&self, operation_id: OperationId) {
        self.shared.work.add(operation_id);
    }

    /// Adds the id once `delay` has elapsed without holding a worker.
    pub fn add_after(&self, operation_id: OperationId, delay: Duration) {
        schedule(&self.shared, operation_id, delay);
    }

    /// Starts `workers` worker tasks on the current tokio runtime.
    pub fn run(&self, workers: usize) {
        let count = workers.max(1);
        let mut handles = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in 0..count {
            handles.push(tokio::spawn(work(Arc::clone(&self.shared), worker)));
        }
        info!("Queue {} started {} workers", self.shared.name, count);
    }

    /// Stops handing out ids and waits for in-flight dispatches to return.
    pub async fn shutdown(&self) {
        self.shared.work.shut_down();
        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for joined in join_all(handles).await {
            if let Err(join_error) = joined {
                warn!(
                    "Queue {} worker ended abnormally: {}",
                    self.shared.name, join_error
                );
            }
        }
        info!("Queue {} stopped", self.shared.name);
    }

    /// Re-enqueues every non-terminal operation of `operation_type`.
    ///
    /// # Errors
    /// Returns the storage error when the unfinished operations cannot be listed.
    pub async fn recover(
        &self,
        storage: &dyn OperationStorage,
        operation_type: OperationType,
    ) -> Result<usize> {
        let unfinished = storage.get_not_finished_by_type(operation_type).await?;
        let count = unfinished.len();
        for operation in unfinished {
            self.add(operation.id);
        }
        info!(
            "Queue {} recovered {} unfinished {} operations",
            self.shared.name, count, operation_type
        );
        Ok(count)
    }
}

fn schedule(shared: &Arc<Shared>, operation_id: OperationId, delay: Duration) {
    let delay = shared.compress(delay);
    if delay.is_zero() {
        shared.work.add(operation_id);
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        shared.work.add(operation_id);
    });
}

async fn work(shared: Arc<Shared>, worker: usize) {
    debug!("Queue {} worker {} waiting for operations", shared.name, worker);
    while let Some(operation_id) = shared.work.next().await {
        let outcome = AssertUnwindSafe(shared.executor.execute(&operation_id))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(BrokerError::Internal(format!(
                    "dispatch panicked on worker {worker}"
                )))
            });
        shared.work.done(&operation_id);
        handle_outcome(&shared, operation_id, outcome);
    }
    debug!("Queue {} worker {} stopped", shared.name, worker);
}

fn handle_outcome(
    shared: &Arc<Shared>,
    operation_id: OperationId,
    outcome: Result<DispatchOutcome>,
) {
    match outcome {
        Ok(DispatchOutcome::RetryAfter(delay)) => {
            debug!(
                "Queue {} re-dispatches operation {} in {:?}",
                shared.name, operation_id, delay
            );
            schedule(shared, operation_id, delay);
        }
        Ok(DispatchOutcome::Finished(state)) => {
            debug!(
                "Queue {} done with operation {} ({})",
                shared.name, operation_id, state
            );
        }
        Ok(DispatchOutcome::Abandoned) => {
            debug!(
                "Queue {} dropped operation {} after a concurrent update",
                shared.name, operation_id
            );
        }
        Err(BrokerError::Storage(StorageError::Transient(detail))) => {
            warn!(
                "Queue {} requeues operation {} after storage failure: {}",
                shared.name, operation_id, detail
            );
            schedule(shared, operation_id, shared.storage_requeue_delay);
        }
        Err(error) => {
            error!(
                "Queue {} dropped operation {}: {}",
                shared.name, operation_id, error
            );
        }
    }
}

#[cfg(test)]
mod bdd_tests {
    #![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

    use super::{ExecuteFuture, Executor, Queue};
    use crate::error::{BrokerError, StorageError};
    use crate::process::manager::DispatchOutcome;
    use crate::storage::{MemoryOperationStorage, OperationStorage};
    use crate::types::{InstanceId, Operation, OperationId, OperationState, OperationType};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy)]
    enum Scripted {
        Outcome(DispatchOutcome),
        TransientStorage,
        Invalid,
        Panic,
    }

    #[derive(Clone, Default)]
    struct ScriptedExecutor {
        script: Arc<Mutex<HashMap<OperationId, VecDeque<Scripted>>>>,
        calls: Arc<Mutex<Vec<(OperationId, Instant)>>>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        work_time: Duration,
    }

    impl ScriptedExecutor {
        fn with_work_time(mut self, work_time: Duration) -> Self {
            self.work_time = work_time;
            self
        }

        async fn with_script(self, id: &str, steps: Vec<Scripted>) -> Self {
            self.script
                .lock()
                .await
                .insert(OperationId::new(id), steps.into());
            self
        }

        async fn calls_for(&self, id: &str) -> Vec<Instant> {
            self.calls
                .lock()
                .await
                .iter()
                .filter(|(call_id, _)| call_id.value() == id)
                .map(|(_, at)| *at)
                .collect()
        }

        async fn total_calls(&self) -> usize {
            self.calls.lock().await.len()
        }
    }

    impl Executor for ScriptedExecutor {
        fn execute<'a>(&'a self, operation_id: &'a OperationId) -> ExecuteFuture<'a> {
            Box::pin(async move {
                let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(now_active, Ordering::SeqCst);
                self.calls
                    .lock()
                    .await
                    .push((operation_id.clone(), Instant::now()));
                if !self.work_time.is_zero() {
                    tokio::time::sleep(self.work_time).await;
                }
                let next = self
                    .script
                    .lock()
                    .await
                    .get_mut(operation_id)
                    .and_then(VecDeque::pop_front);
                self.active.fetch_sub(1, Ordering::SeqCst);
                match next {
                    None => Ok(DispatchOutcome::Finished(OperationState::Succeeded)),
                    Some(Scripted::Outcome(outcome)) => Ok(outcome),
                    Some(Scripted::TransientStorage) => Err(BrokerError::Storage(
                        StorageError::Transient("connection reset".to_string()),
                    )),
                    Some(Scripted::Invalid) => Err(BrokerError::Storage(
                        StorageError::InvalidData("corrupt row".to_string()),
                    )),
                    Some(Scripted::Panic) => panic!("step blew up"),
                }
            })
        }
    }

    async fn wait_for_calls(executor: &ScriptedExecutor, expected: usize) {
        tokio::time::timeout(Duration::from_secs(3600), async {
            while executor.total_calls().await < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("executor was not called often enough");
    }

    #[tokio::test(start_paused = true)]
    async fn when_id_is_readded_while_processing_then_it_never_runs_twice_at_once() {
        let executor = ScriptedExecutor::default().with_work_time(Duration::from_millis(200));
        let queue = Queue::new("provisioning", Arc::new(executor.clone()));
        queue.run(4);

        queue.add(OperationId::new("op-1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.add(OperationId::new("op-1"));
        queue.add(OperationId::new("op-1"));
        wait_for_calls(&executor, 2).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(executor.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(executor.calls_for("op-1").await.len(), 2);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn when_dispatch_asks_for_delay_then_worker_is_free_until_delay_elapses() {
        let executor = ScriptedExecutor::default()
            .with_script(
                "op-slow",
                vec![Scripted::Outcome(DispatchOutcome::RetryAfter(
                    Duration::from_secs(5),
                ))],
            )
            .await;
        let queue = Queue::new("upgrade", Arc::new(executor.clone()));
        queue.run(1);

        queue.add(OperationId::new("op-slow"));
        wait_for_calls(&executor, 1).await;
        queue.add(OperationId::new("op-other"));
        wait_for_calls(&executor, 3).await;

        let slow = executor.calls_for("op-slow").await;
        let other = executor.calls_for("op-other").await;
        assert_eq!(slow.len(), 2);
        assert!(slow[1].duration_since(slow[0]) >= Duration::from_secs(5));
        assert!(other[0] < slow[1]);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn when_queue_is_sped_up_then_requested_delays_shrink() {
        let executor = ScriptedExecutor::default()
            .with_script(
                "op-1",
                vec![Scripted::Outcome(DispatchOutcome::RetryAfter(
                    Duration::from_secs(10),
                ))],
            )
            .await;
        let queue = Queue::new("update", Arc::new(executor.clone()));
        queue.speed_up(10);
        queue.run(1);

        queue.add(OperationId::new("op-1"));
        wait_for_calls(&executor, 2).await;

        let calls = executor.calls_for("op-1").await;
        let gap = calls[1].duration_since(calls[0]);
        assert!(gap >= Duration::from_secs(1));
        assert!(gap < Duration::from_secs(10));
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn when_storage_stays_unavailable_then_operation_is_requeued() {
        let executor = ScriptedExecutor::default()
            .with_script("op-1", vec![Scripted::TransientStorage])
            .await;
        let queue = Queue::new("deprovisioning", Arc::new(executor.clone()));
        queue.run(1);

        queue.add(OperationId::new("op-1"));
        wait_for_calls(&executor, 2).await;

        assert_eq!(executor.calls_for("op-1").await.len(), 2);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn when_dispatch_fails_permanently_then_operation_is_dropped() {
        let executor = ScriptedExecutor::default()
            .with_script("op-1", vec![Scripted::Invalid])
            .await;
        let queue = Queue::new("deprovisioning", Arc::new(executor.clone()));
        queue.run(1);

        queue.add(OperationId::new("op-1"));
        wait_for_calls(&executor, 1).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(executor.calls_for("op-1").await.len(), 1);
        assert!(queue.is_empty());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn when_recovering_then_only_unfinished_operations_of_the_type_are_queued() {
        let storage = MemoryOperationStorage::new();
        let mut done = Operation::new(
            OperationId::new("op-done"),
            OperationType::Provision,
            InstanceId::new("inst-1"),
            chrono::Utc::now(),
        );
        done.state = OperationState::Succeeded;
        let pending = Operation::new(
            OperationId::new("op-pending"),
            OperationType::Provision,
            InstanceId::new("inst-2"),
            chrono::Utc::now(),
        );
        let other_type = Operation::new(
            OperationId::new("op-update"),
            OperationType::Update,
            InstanceId::new("inst-3"),
            chrono::Utc::now(),
        );
        for op in [&done, &pending, &other_type] {
            storage.insert(op).await.unwrap();
        }
        let executor = ScriptedExecutor::default();
        let queue = Queue::new("provisioning", Arc::new(executor.clone()));

        let recovered = queue.recover(&storage, OperationType::Provision).await.unwrap();
        queue.run(2);
        wait_for_calls(&executor, 1).await;

        assert_eq!(recovered, 1);
        assert_eq!(executor.calls_for("op-pending").await.len(), 1);
        assert!(executor.calls_for("op-done").await.is_empty());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn when_queue_is_shut_down_then_new_ids_are_ignored() {
        let executor = ScriptedExecutor::default();
        let queue = Queue::new("provisioning", Arc::new(executor.clone()));
        queue.run(2);

        queue.shutdown().await;
        queue.add(OperationId::new("op-late"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(executor.total_calls().await, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn when_dispatch_panics_then_worker_survives_and_id_can_run_again() {
        let executor = ScriptedExecutor::default()
            .with_script("op-boom", vec![Scripted::Panic])
            .await;
        let queue = Queue::new("provisioning", Arc::new(executor.clone()));
        queue.run(1);

        queue.add(OperationId::new("op-boom"));
        wait_for_calls(&executor, 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add(OperationId::new("op-boom"));
        queue.add(OperationId::new("op-other"));
        wait_for_calls(&executor, 3).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(executor.calls_for("op-boom").await.len(), 2);
        assert_eq!(executor.calls_for("op-other").await.len(), 1);
        assert_eq!(queue.len(), 0);
        queue.shutdown().await;
    }
}
