//! Core of the sauti batch speech service.
//!
//! Submitted batches are validated into typed jobs, persisted in a SQLite
//! backed queue and drained by a single scheduler loop that groups work by
//! operation, keeps at most one exchangeable engine resident on the
//! accelerator and stores results in an expiring blob store.

pub mod blob_store;
pub mod config;
pub mod error;
pub mod job;
pub mod queue;
pub mod residency;
pub mod scheduler;
pub mod worker;

pub use blob_store::{BlobLocation, BlobStore, LoadedBlob};
pub use config::QueueConfig;
pub use error::{Error, Result};
pub use job::{
    BatchReceipt, BatchState, BatchStatus, BatchSubmission, EngineFamily, ItemState, ItemStatus,
    JobItem, JobSubmission, Language, Operation,
};
pub use queue::JobStore;
pub use residency::{ResidencyCoordinator, Unloadable};
pub use scheduler::{
    ComputeBackend, CycleOutcome, DispatchBatch, ResolvedAudio, SamplingParams, SchedulerLoop,
};
pub use worker::{spawn_housekeeping, BackgroundTask};
