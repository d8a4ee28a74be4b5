//! Control-plane engine for long-running cluster lifecycle operations.
//!
//! Operations are persisted with optimistic concurrency, driven through
//! staged step pipelines by per-type worker queues, and summarized per
//! upgrade campaign by the fleet reducer.

pub mod config;
pub mod error;
pub mod fleet;
pub mod process;
pub mod storage;
pub mod types;

pub use config::EngineConfig;
pub use error::{BrokerError, Result, StepError, StorageError};
pub use process::{DispatchOutcome, Engine, Pipeline, Queue, StagedManager};
pub use storage::{OperationRepository, OperationStorage};
pub use types::{Operation, OperationId, OperationState, OperationType};
