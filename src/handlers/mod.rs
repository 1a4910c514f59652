//! Event handlers run by the msgflow binaries.
//!
//! - `processor`: idempotent `message.created` handler and its work seam
//! - `notifier`: `message.status.updated` consumer

pub mod notifier;
pub mod processor;

pub use notifier::{StatusNotifier, NOTIFIER_SERVICE_NAME};
pub use processor::{
    MessageProcessor, ProcessingError, ProcessingOutcome, SimulatedWork, UnitOfWork, WorkError,
    WorkStage, PROCESSOR_SERVICE_NAME,
};
