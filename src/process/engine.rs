use super::clock::{Clock, SystemClock};
use super::events::EventSink;
use super::manager::{ManagerConfig, StagedManager};
use super::pipeline::Pipeline;
use super::queue::{Queue, DEFAULT_STORAGE_REQUEUE_DELAY};
use crate::config::QueueWorkers;
use crate::error::{BrokerError, Result};
use crate::storage::OperationStorage;
use crate::types::{Operation, OperationId, OperationType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Collects the per-type pipelines and shared collaborators of an [`Engine`].
pub struct EngineBuilder {
    storage: Arc<dyn OperationStorage>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    manager_config: ManagerConfig,
    storage_requeue_delay: Duration,
    pipelines: Vec<(OperationType, Pipeline)>,
}

impl EngineBuilder {
    #[must_use]
    pub fn manager_config(mut self, config: ManagerConfig) -> Self {
        self.manager_config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn storage_requeue_delay(mut self, delay: Duration) -> Self {
        self.storage_requeue_delay = delay;
        self
    }

    /// Registers the step catalog for one operation type.
    #[must_use]
    pub fn pipeline(mut self, operation_type: OperationType, pipeline: Pipeline) -> Self {
        self.pipelines.push((operation_type, pipeline));
        self
    }

    /// # Errors
    /// Returns `QueueError` when an operation type is registered twice.
    pub fn build(self) -> Result<Engine> {
        let mut queues = HashMap::new();
        for (operation_type, pipeline) in self.pipelines {
            if queues.contains_key(&operation_type) {
                return Err(BrokerError::QueueError(format!(
                    "pipeline for {operation_type} registered twice"
                )));
            }
            let manager = StagedManager::new(
                Arc::clone(&self.storage),
                Arc::new(pipeline),
                Arc::clone(&self.events),
                self.manager_config,
            )
            .with_clock(Arc::clone(&self.clock));
            let queue = Queue::with_storage_requeue_delay(
                operation_type.as_str(),
                Arc::new(manager),
                self.storage_requeue_delay,
            );
            queues.insert(operation_type, queue);
        }
        Ok(Engine {
            storage: self.storage,
            queues,
        })
    }
}

/// One queue and staged manager per registered operation type.
pub struct Engine {
    storage: Arc<dyn OperationStorage>,
    queues: HashMap<OperationType, Queue>,
}

impl Engine {
    #[must_use]
    pub fn builder(storage: Arc<dyn OperationStorage>, events: Arc<dyn EventSink>) -> EngineBuilder {
        EngineBuilder {
            storage,
            events,
            clock: Arc::new(SystemClock),
            manager_config: ManagerConfig::default(),
            storage_requeue_delay: DEFAULT_STORAGE_REQUEUE_DELAY,
            pipelines: Vec::new(),
        }
    }

    #[must_use]
    pub fn queue(&self, operation_type: OperationType) -> Option<&Queue> {
        self.queues.get(&operation_type)
    }

    fn require_queue(&self, operation_type: OperationType) -> Result<&Queue> {
        self.queue(operation_type).ok_or_else(|| {
            BrokerError::QueueError(format!("no pipeline registered for {operation_type}"))
        })
    }

    /// Starts every queue with its configured worker count.
    pub fn start(&self, workers: &QueueWorkers) {
        for (operation_type, queue) in &self.queues {
            queue.run(workers.for_type(*operation_type));
        }
    }

    /// Re-enqueues the unfinished operations of every registered type.
    ///
    /// # Errors
    /// Returns the first storage error hit while listing.
    pub async fn recover(&self) -> Result<usize> {
        let mut total = 0;
        for (operation_type, queue) in &self.queues {
            total += queue.recover(self.storage.as_ref(), *operation_type).await?;
        }
        info!("Recovered {} unfinished operations", total);
        Ok(total)
    }

    /// Persists a new operation and hands it to the queue of its type.
    ///
    /// # Errors
    /// Returns `QueueError` for unregistered types and storage errors from the insert.
    pub async fn submit(&self, operation: &Operation) -> Result<()> {
        let queue = self.require_queue(operation.operation_type)?;
        self.storage.insert(operation).await?;
        queue.add(operation.id.clone());
        Ok(())
    }

    /// # Errors
    /// Returns `QueueError` when no pipeline is registered for the type.
    pub fn enqueue(&self, operation_type: OperationType, operation_id: OperationId) -> Result<()> {
        self.require_queue(operation_type)?.add(operation_id);
        Ok(())
    }

    /// # Errors
    /// Returns `QueueError` when no pipeline is registered for the type.
    pub fn enqueue_after(
        &self,
        operation_type: OperationType,
        operation_id: OperationId,
        delay: Duration,
    ) -> Result<()> {
        self.require_queue(operation_type)?
            .add_after(operation_id, delay);
        Ok(())
    }

    pub fn speed_up(&self, factor: u32) {
        self.queues.values().for_each(|queue| queue.speed_up(factor));
    }

    pub async fn shutdown(&self) {
        for queue in self.queues.values() {
            queue.shutdown().await;
        }
    }
}
