pub mod backend;
pub mod bridge;
pub mod coordinator;
pub mod operation;
pub mod presenter;
pub mod progress;
pub mod remote;
pub mod streams;

pub use coordinator::{Coordinator, CoordinatorOptions, OperationError, SessionHandle};
pub use operation::{FlashRequest, OperationKind, OperationOutcome, ProgressEvent};
