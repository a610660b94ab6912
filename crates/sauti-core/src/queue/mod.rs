//! Durable job queue and batch state tracking on SQLite.
//!
//! The queue (`job_queue`) and the state records (`job_batches`, `job_items`)
//! share one database so that popping, deferring and finishing an item each
//! touch queue and state inside the same transaction.

mod durable;
mod store;
mod tracker;

pub use store::JobStore;
