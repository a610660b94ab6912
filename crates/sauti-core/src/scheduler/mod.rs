//! Single-consumer scheduler: pop, group by operation, defer, dispatch.

mod dispatch;
mod grouping;

pub use dispatch::{ComputeBackend, DispatchBatch, ResolvedAudio, SamplingParams};
pub use grouping::{partition_by_operation, select_group, OperationGroup};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::blob_store::BlobStore;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::job::{JobItem, Operation};
use crate::queue::JobStore;
use crate::residency::ResidencyCoordinator;
use crate::worker::{sleep_or_cancel, BackgroundTask};

/// What one scheduler cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The queue was empty.
    Idle,
    Dispatched {
        operation: Operation,
        /// Items handed to the compute backend.
        dispatched: usize,
        /// Items pushed back to the head of the queue.
        deferred: usize,
        completed: usize,
        /// Items failed before or during dispatch.
        failed: usize,
    },
}

#[derive(Debug, Clone)]
enum Outcome {
    Done { url: String },
    Failed { message: String },
}

#[derive(Debug, Clone)]
struct PendingOutcome {
    item_id: String,
    outcome: Outcome,
}

/// Writes the state store refused. Replayed before the next pop.
#[derive(Debug, Default)]
struct Backlog {
    outcomes: Vec<PendingOutcome>,
    requeue: Vec<JobItem>,
}

impl Backlog {
    fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.requeue.is_empty()
    }
}

#[derive(Debug, Default)]
struct GroupReport {
    dispatched: usize,
    completed: usize,
    failed: usize,
    /// Outcomes left in the backlog.
    unrecorded: usize,
}

pub struct SchedulerLoop {
    store: JobStore,
    blobs: Arc<BlobStore>,
    residency: Arc<ResidencyCoordinator>,
    backend: Arc<dyn ComputeBackend>,
    backlog: Mutex<Backlog>,
    max_batch_size: usize,
    poll_interval: Duration,
    error_backoff: Duration,
    result_url_prefix: String,
}

impl SchedulerLoop {
    pub fn new(
        store: JobStore,
        blobs: Arc<BlobStore>,
        residency: Arc<ResidencyCoordinator>,
        backend: Arc<dyn ComputeBackend>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            residency,
            backend,
            backlog: Mutex::new(Backlog::default()),
            max_batch_size: config.effective_batch_size(),
            poll_interval: config.poll_interval(),
            error_backoff: config.error_backoff(),
            result_url_prefix: config.result_url_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Run one pop/select/defer/dispatch cycle.
    ///
    /// Returns `Err` when the state store rejected a write. The rejected work is
    /// kept and replayed at the start of the next cycle, before anything new is
    /// popped.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        self.replay_backlog().await?;

        let items = self.store.pop_up_to(self.max_batch_size).await?;
        if items.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        let popped = items.clone();

        let mut groups = partition_by_operation(items);
        let active = self.residency.active_engine().await;
        let Some(selected) = select_group(&groups, active.as_deref()) else {
            return Ok(CycleOutcome::Idle);
        };
        let selected = groups.remove(selected);

        let deferred: Vec<JobItem> = groups.into_iter().flat_map(|group| group.items).collect();
        if !deferred.is_empty() {
            match self.store.push_front(&deferred).await {
                Ok(requeued) => debug!(
                    "Deferred {requeued} item(s) while dispatching {}",
                    selected.operation
                ),
                Err(err) => {
                    // Nothing is dispatched; the whole pop goes back in order.
                    error!(
                        "Failed to defer {} item(s); holding {} for requeue: {err}",
                        deferred.len(),
                        popped.len()
                    );
                    self.backlog.lock().await.requeue.extend(popped);
                    return Err(err);
                }
            }
        }

        let operation = selected.operation;
        let report = self.dispatch_group(selected).await;
        if report.unrecorded > 0 {
            return Err(Error::Storage(format!(
                "{} {operation} outcome(s) could not be recorded; retrying",
                report.unrecorded
            )));
        }
        Ok(CycleOutcome::Dispatched {
            operation,
            dispatched: report.dispatched,
            deferred: deferred.len(),
            completed: report.completed,
            failed: report.failed,
        })
    }

    async fn replay_backlog(&self) -> Result<()> {
        let mut backlog = self.backlog.lock().await;
        if backlog.is_empty() {
            return Ok(());
        }

        let outcomes = std::mem::take(&mut backlog.outcomes);
        for (index, pending) in outcomes.iter().enumerate() {
            if let Err(err) = self.write_outcome(pending).await {
                backlog.outcomes = outcomes[index..].to_vec();
                return Err(err);
            }
            info!("Recorded held outcome for item {}", pending.item_id);
        }

        if !backlog.requeue.is_empty() {
            let requeued = self.store.push_front(&backlog.requeue).await?;
            info!("Requeued {requeued} held item(s)");
            backlog.requeue.clear();
        }
        Ok(())
    }

    async fn dispatch_group(&self, group: OperationGroup) -> GroupReport {
        let operation = group.operation;
        let sampling = group
            .items
            .first()
            .map(|item| SamplingParams::with_temperature(item.temperature))
            .unwrap_or_default();

        let mut batch = DispatchBatch::new(operation, sampling);
        let mut members = Vec::with_capacity(group.items.len());
        let mut report = GroupReport::default();

        for item in group.items {
            let audio = match item.task.audio_handle() {
                None => None,
                Some(handle) => match self.blobs.load(handle).await {
                    Ok(Some(blob)) => Some(ResolvedAudio::from(blob)),
                    Ok(None) => {
                        let message = format!("Reference audio '{handle}' not found or expired");
                        self.fail_item(&item, message, &mut report).await;
                        continue;
                    }
                    Err(err) => {
                        let message = format!("Failed to read reference audio '{handle}': {err}");
                        self.fail_item(&item, message, &mut report).await;
                        continue;
                    }
                },
            };
            batch.push(&item, audio);
            members.push(item);
        }

        if members.is_empty() {
            return report;
        }

        report.dispatched = members.len();
        info!("Dispatching {} {operation} item(s)", report.dispatched);
        let outputs = match self.backend.run_batch(batch).await {
            Ok(outputs) => outputs,
            Err(err) => {
                let message = err.to_string();
                warn!("{operation} batch of {} failed: {message}", report.dispatched);
                for item in &members {
                    self.fail_item(item, message.clone(), &mut report).await;
                }
                return report;
            }
        };

        if outputs.len() != report.dispatched {
            warn!(
                "{operation} batch returned {} output(s) for {} item(s)",
                outputs.len(),
                report.dispatched
            );
        }

        let mut outputs = outputs.into_iter();
        for item in &members {
            let Some(bytes) = outputs.next() else {
                let message = "Inference returned no output for this item".to_string();
                self.fail_item(item, message, &mut report).await;
                continue;
            };
            match self.save_result(item, bytes).await {
                Ok(url) => {
                    if self.record(&item.item_id, Outcome::Done { url }).await {
                        report.completed += 1;
                    } else {
                        report.unrecorded += 1;
                    }
                }
                Err(err) => {
                    let message = format!("Failed to store result: {err}");
                    self.fail_item(item, message, &mut report).await;
                }
            }
        }

        report
    }

    /// Persist one output and return its download URL.
    async fn save_result(&self, item: &JobItem, bytes: Vec<u8>) -> Result<String> {
        let operation = item.operation();
        let hint = format!(
            "queue_{}_{}.{}",
            operation,
            item.item_id,
            operation.artifact_extension()
        );
        let blob_id = self.blobs.save(bytes, &hint).await?;
        Ok(format!("{}/{blob_id}", self.result_url_prefix))
    }

    async fn fail_item(&self, item: &JobItem, message: String, report: &mut GroupReport) {
        warn!("Item {} failed: {message}", item.item_id);
        if self.record(&item.item_id, Outcome::Failed { message }).await {
            report.failed += 1;
        } else {
            report.unrecorded += 1;
        }
    }

    /// Write an outcome, or park it in the backlog. Returns `false` when parked.
    async fn record(&self, item_id: &str, outcome: Outcome) -> bool {
        let pending = PendingOutcome {
            item_id: item_id.to_string(),
            outcome,
        };
        match self.write_outcome(&pending).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Could not record outcome for item {item_id}, will retry: {err}");
                self.backlog.lock().await.outcomes.push(pending);
                false
            }
        }
    }

    async fn write_outcome(&self, pending: &PendingOutcome) -> Result<()> {
        let item_id = pending.item_id.clone();
        let written = match &pending.outcome {
            Outcome::Done { url } => self.store.mark_done(item_id, url.clone()).await,
            Outcome::Failed { message } => self.store.mark_error(item_id, message.clone()).await,
        };
        match written {
            Ok(_) => Ok(()),
            // Already terminal or purged: there is nothing left to write.
            Err(err @ (Error::ItemAlreadyFinished { .. } | Error::ItemNotFound(_))) => {
                warn!("Dropping outcome for item {}: {err}", pending.item_id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Run cycles until `token` is cancelled.
    ///
    /// Cancellation is observed between cycles only; a dispatched group runs to
    /// completion unless the owning task is aborted, which also aborts the cycle.
    /// A failed or panicked cycle is logged and followed by the error backoff.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            "Scheduler loop started (max batch size {}, poll interval {}ms)",
            self.max_batch_size,
            self.poll_interval.as_millis()
        );

        while !token.is_cancelled() {
            let scheduler = self.clone();
            let cycle = AbortOnDropHandle::new(tokio::spawn(async move {
                scheduler.run_cycle().await
            }));
            let result = cycle
                .await
                .map_err(|err| Error::Worker(format!("Scheduler cycle task failed: {err}")))
                .and_then(|result| result);

            let pause = match result {
                Ok(CycleOutcome::Idle) => Some(self.poll_interval),
                Ok(CycleOutcome::Dispatched { .. }) => None,
                Err(err) => {
                    error!("Scheduler cycle failed: {err}");
                    Some(self.error_backoff)
                }
            };

            if let Some(pause) = pause {
                if !sleep_or_cancel(&token, pause).await {
                    break;
                }
            }
        }

        info!("Scheduler loop stopped");
    }

    pub fn spawn(self) -> BackgroundTask {
        let scheduler = Arc::new(self);
        BackgroundTask::spawn("scheduler", move |token| scheduler.run(token))
    }
}
