//! Job data model: operations, submissions, typed tasks and status views.

mod operation;
mod status;
mod submission;

pub use operation::{EngineFamily, Language, Operation};
pub use status::{
    derive_batch_state, BatchReceipt, BatchState, BatchStatus, ItemState, ItemStatus, JobItem,
};
pub use submission::{
    BatchSubmission, Instruct, JobSubmission, JobTask, SpeakerHints, ValidatedBatch, ValidatedJob,
    MAX_BATCH_ITEMS,
};
