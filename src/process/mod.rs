//! Operation processing: steps, stage pipelines, the staged manager, the
//! worker queue that drives it and the per-type engine wiring.

pub mod clock;
pub mod engine;
pub mod events;
pub mod manager;
pub mod pipeline;
pub mod queue;
pub mod step;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineBuilder};
pub use events::{EventBroker, EventSink, NoopEventSink, OperationEvent};
pub use manager::{DispatchOutcome, ManagerConfig, StagedManager};
pub use pipeline::{Pipeline, PipelineBuilder, Stage};
pub use queue::{Executor, Queue};
pub use step::{FnStep, Step, StepFuture, StepLogger, StepOutcome};
