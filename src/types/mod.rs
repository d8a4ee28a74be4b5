pub mod filter;
pub mod identifiers;
pub mod operation;

pub use filter::{OperationFilter, Page, DEFAULT_PAGE_SIZE};
pub use identifiers::{CampaignId, InstanceId, OperationId};
pub use operation::{FinishedStages, Operation, OperationState, OperationType};
