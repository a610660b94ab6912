//! Batch tracking: record creation, completion roll-up and status queries.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::store::{
    finish_item_tx, i64_to_u64, now_unix_millis_i64, open_connection, ItemOutcome, JobStore,
};
use crate::error::{Error, Result};
use crate::job::{BatchReceipt, BatchState, BatchStatus, ItemState, ItemStatus, ValidatedBatch};

impl JobStore {
    /// Create batch and item records and enqueue every item, in one transaction.
    pub async fn create_batch(&self, batch: ValidatedBatch) -> Result<BatchReceipt> {
        if batch.jobs.is_empty() {
            return Err(Error::InvalidInput(
                "Batch items list cannot be empty".to_string(),
            ));
        }

        self.run_blocking(move |db_path| {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_unix_millis_i64();
            let batch_id = format!("batch_{}", Uuid::new_v4().simple());
            let total = batch.jobs.len();

            tx.execute(
                r#"
                INSERT INTO job_batches
                    (batch_id, label, total, completed, failed, status, created_at)
                VALUES (?1, ?2, ?3, 0, 0, ?4, ?5)
                "#,
                params![
                    &batch_id,
                    batch.label,
                    total as i64,
                    BatchState::Queued.as_str(),
                    now
                ],
            )?;

            let mut item_ids = Vec::with_capacity(total);
            for (seq, job) in batch.jobs.into_iter().enumerate() {
                let item_id = format!("item_{}", Uuid::new_v4().simple());
                let payload = serde_json::to_string(&job.task)?;

                tx.execute(
                    r#"
                    INSERT INTO job_items (
                        item_id,
                        batch_id,
                        seq,
                        custom_id,
                        operation,
                        temperature,
                        payload,
                        status,
                        created_at,
                        updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                    "#,
                    params![
                        &item_id,
                        &batch_id,
                        seq as i64,
                        job.custom_id,
                        job.task.operation().as_str(),
                        f64::from(job.temperature),
                        payload,
                        ItemState::Queued.as_str(),
                        now
                    ],
                )?;
                tx.execute(
                    "INSERT INTO job_queue (item_id) VALUES (?1)",
                    params![&item_id],
                )?;
                item_ids.push(item_id);
            }

            tx.commit()?;
            info!("Accepted batch {batch_id} with {total} item(s)");

            Ok(BatchReceipt {
                batch_id,
                total_items: total,
                item_ids,
                status: BatchState::Queued,
            })
        })
        .await
    }

    /// Record a successful item and roll the result up into its batch.
    ///
    /// Fails with [`Error::ItemAlreadyFinished`] without touching any counter
    /// when the item has already reached a terminal state.
    pub async fn mark_done(&self, item_id: String, url: String) -> Result<Option<BatchState>> {
        self.run_blocking(move |db_path| {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let finalized = finish_item_tx(&tx, &item_id, ItemOutcome::Done { url: &url })?;
            tx.commit()?;
            Ok(finalized)
        })
        .await
    }

    /// Record a failed item and roll the failure up into its batch.
    pub async fn mark_error(
        &self,
        item_id: String,
        message: String,
    ) -> Result<Option<BatchState>> {
        self.run_blocking(move |db_path| {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let finalized = finish_item_tx(
                &tx,
                &item_id,
                ItemOutcome::Failed { message: &message },
            )?;
            tx.commit()?;
            Ok(finalized)
        })
        .await
    }

    /// Read a batch together with every item it owns.
    pub async fn get_status(&self, batch_id: String) -> Result<Option<BatchStatus>> {
        self.run_blocking(move |db_path| {
            let mut conn = open_connection(&db_path)?;
            // One read transaction gives a consistent snapshot of batch and items.
            let tx = conn.transaction()?;

            let batch = tx
                .query_row(
                    r#"
                    SELECT label, status, total, completed, failed
                    FROM job_batches
                    WHERE batch_id = ?1
                    "#,
                    params![&batch_id],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;

            let Some((label, status, total, completed, failed)) = batch else {
                return Ok(None);
            };

            let items = {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT item_id, custom_id, status, result_url, error
                    FROM job_items
                    WHERE batch_id = ?1
                    ORDER BY seq ASC
                    "#,
                )?;
                let rows = stmt.query_map(params![&batch_id], |row| {
                    let status: String = row.get(2)?;
                    Ok(ItemStatus {
                        item_id: row.get(0)?,
                        custom_id: row.get(1)?,
                        status: ItemState::parse(&status).unwrap_or(ItemState::Queued),
                        url: row.get(3)?,
                        error: row.get(4)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.commit()?;

            Ok(Some(BatchStatus {
                batch_id,
                label,
                status: BatchState::parse(&status).unwrap_or(BatchState::Queued),
                total: i64_to_u64(total),
                completed: i64_to_u64(completed),
                failed: i64_to_u64(failed),
                items,
            }))
        })
        .await
    }

    /// Delete finalized batches (and their items) older than `retention`.
    ///
    /// Batches that still have unfinished items are never removed.
    pub async fn purge_finished_batches(&self, retention: Duration) -> Result<usize> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let cutoff = now_unix_millis_i64() - retention.as_millis() as i64;
            let removed = conn.execute(
                "DELETE FROM job_batches WHERE finalized_at IS NOT NULL AND finalized_at < ?1",
                params![cutoff],
            )?;
            if removed > 0 {
                info!("Purged {removed} finalized batch record(s)");
            }
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BatchSubmission, JobItem, JobSubmission, Operation};
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;

    fn temp_store() -> (JobStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("sauti-queue-test-{}", Uuid::new_v4()));
        let store = JobStore::initialize(dir.join("queue.sqlite3")).unwrap();
        (store, dir)
    }

    fn batch_of(items: Vec<JobSubmission>) -> ValidatedBatch {
        BatchSubmission {
            items,
            label: Some("test".to_string()),
        }
        .validate()
        .unwrap()
    }

    fn design(text: &str) -> JobSubmission {
        JobSubmission::new(Operation::VoiceDesign, text)
    }

    fn ids(items: &[JobItem]) -> Vec<String> {
        items.iter().map(|item| item.item_id.clone()).collect()
    }

    #[tokio::test]
    async fn created_batch_is_immediately_visible() {
        let (store, dir) = temp_store();
        let receipt = store
            .create_batch(batch_of(vec![
                design("one").with_custom_id("a"),
                design("two"),
                design("three"),
            ]))
            .await
            .unwrap();

        assert_eq!(receipt.total_items, 3);
        assert_eq!(receipt.status, BatchState::Queued);

        let status = store
            .get_status(receipt.batch_id.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.status, BatchState::Queued);
        assert_eq!(status.label.as_deref(), Some("test"));
        assert_eq!(status.items.len(), 3);
        assert_eq!(status.items[0].custom_id.as_deref(), Some("a"));
        assert!(status.items.iter().all(|item| item.status == ItemState::Queued));
        assert_eq!(store.queue_len().await.unwrap(), 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn unknown_batch_reports_none() {
        let (store, dir) = temp_store();
        assert!(store
            .get_status("batch_missing".to_string())
            .await
            .unwrap()
            .is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn pop_is_fifo_and_marks_processing() {
        let (store, dir) = temp_store();
        let receipt = store
            .create_batch(batch_of(vec![design("a"), design("b"), design("c")]))
            .await
            .unwrap();

        let popped = store.pop_up_to(2).await.unwrap();
        assert_eq!(ids(&popped), receipt.item_ids[..2].to_vec());
        assert_eq!(popped[0].task.text(), "a");

        let status = store.get_status(receipt.batch_id).await.unwrap().unwrap();
        assert_eq!(status.status, BatchState::Processing);
        assert_eq!(status.items[0].status, ItemState::Processing);
        assert_eq!(status.items[2].status, ItemState::Queued);

        let rest = store.pop_up_to(8).await.unwrap();
        assert_eq!(ids(&rest), receipt.item_ids[2..].to_vec());
        assert!(store.pop_up_to(8).await.unwrap().is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn push_front_requeues_ahead_of_newer_work_in_order() {
        let (store, dir) = temp_store();
        let first = store
            .create_batch(batch_of(vec![design("a"), design("b"), design("c")]))
            .await
            .unwrap();
        let popped = store.pop_up_to(3).await.unwrap();
        let second = store
            .create_batch(batch_of(vec![design("d")]))
            .await
            .unwrap();

        let deferred = vec![popped[0].clone(), popped[2].clone()];
        assert_eq!(store.push_front(&deferred).await.unwrap(), 2);
        assert_eq!(
            store.item_state(first.item_ids[0].clone()).await.unwrap(),
            Some(ItemState::Queued)
        );

        let again = store.pop_up_to(8).await.unwrap();
        assert_eq!(
            ids(&again),
            vec![
                first.item_ids[0].clone(),
                first.item_ids[2].clone(),
                second.item_ids[0].clone()
            ]
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn repeated_deferral_loses_no_items() {
        let (store, dir) = temp_store();
        let receipt = store
            .create_batch(batch_of(vec![design("a"), design("b")]))
            .await
            .unwrap();

        for _ in 0..5 {
            let popped = store.pop_up_to(8).await.unwrap();
            assert_eq!(popped.len(), 2);
            store.push_front(&popped).await.unwrap();
        }

        assert_eq!(store.queue_len().await.unwrap(), 2);
        let popped = store.pop_up_to(8).await.unwrap();
        assert_eq!(ids(&popped), receipt.item_ids);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn marking_twice_does_not_double_count() {
        let (store, dir) = temp_store();
        let receipt = store
            .create_batch(batch_of(vec![design("a"), design("b")]))
            .await
            .unwrap();
        store.pop_up_to(2).await.unwrap();
        let first = receipt.item_ids[0].clone();

        store
            .mark_done(first.clone(), "/v1/files/x".to_string())
            .await
            .unwrap();
        let again = store.mark_done(first.clone(), "/v1/files/y".to_string()).await;
        assert!(matches!(again, Err(Error::ItemAlreadyFinished { .. })));
        let flipped = store.mark_error(first.clone(), "late".to_string()).await;
        assert!(matches!(flipped, Err(Error::ItemAlreadyFinished { .. })));

        let status = store
            .get_status(receipt.batch_id.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 0);
        assert_eq!(status.items[0].url.as_deref(), Some("/v1/files/x"));
        assert_eq!(status.status, BatchState::Processing);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn finalization_matches_counters() {
        let (store, dir) = temp_store();
        let receipt = store
            .create_batch(batch_of(vec![design("a"), design("b"), design("c")]))
            .await
            .unwrap();
        store.pop_up_to(3).await.unwrap();

        let ids = receipt.item_ids.clone();
        assert_eq!(
            store.mark_done(ids[0].clone(), "u0".into()).await.unwrap(),
            None
        );
        assert_eq!(
            store.mark_error(ids[1].clone(), "boom".into()).await.unwrap(),
            None
        );
        assert_eq!(
            store.mark_done(ids[2].clone(), "u2".into()).await.unwrap(),
            Some(BatchState::Partial)
        );

        let status = store.get_status(receipt.batch_id).await.unwrap().unwrap();
        assert_eq!(status.completed + status.failed, status.total);
        assert_eq!(status.status, BatchState::Partial);
        assert_eq!(status.items[1].error.as_deref(), Some("boom"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn all_failed_batch_reports_error() {
        let (store, dir) = temp_store();
        let receipt = store
            .create_batch(batch_of(vec![design("a"), design("b")]))
            .await
            .unwrap();
        for id in &receipt.item_ids {
            store.mark_error(id.clone(), "down".into()).await.unwrap();
        }
        let status = store.get_status(receipt.batch_id).await.unwrap().unwrap();
        assert_eq!(status.status, BatchState::Error);
        assert_eq!(status.failed, 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn finished_items_are_not_requeued() {
        let (store, dir) = temp_store();
        store
            .create_batch(batch_of(vec![design("a")]))
            .await
            .unwrap();
        let popped = store.pop_up_to(1).await.unwrap();
        store
            .mark_done(popped[0].item_id.clone(), "u".into())
            .await
            .unwrap();

        assert_eq!(store.push_front(&popped).await.unwrap(), 0);
        assert!(!store.push(&popped[0]).await.unwrap());
        assert_eq!(store.queue_len().await.unwrap(), 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn unknown_item_cannot_be_marked() {
        let (store, dir) = temp_store();
        let result = store.mark_done("item_nope".into(), "u".into()).await;
        assert!(matches!(result, Err(Error::ItemNotFound(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn purge_keeps_unfinished_batches() {
        let (store, dir) = temp_store();
        let done = store
            .create_batch(batch_of(vec![design("a")]))
            .await
            .unwrap();
        let pending = store
            .create_batch(batch_of(vec![design("b")]))
            .await
            .unwrap();
        store
            .mark_done(done.item_ids[0].clone(), "u".into())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            store.purge_finished_batches(Duration::ZERO).await.unwrap(),
            1
        );
        assert!(store.get_status(done.batch_id).await.unwrap().is_none());
        assert!(store.get_status(pending.batch_id).await.unwrap().is_some());
        assert_eq!(store.queue_len().await.unwrap(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_marks_count_each_item_once() {
        let (store, dir) = temp_store();
        let receipt = store
            .create_batch(batch_of(vec![design("a"), design("b"), design("c")]))
            .await
            .unwrap();
        store.pop_up_to(3).await.unwrap();

        let mut tasks = Vec::new();
        for item_id in &receipt.item_ids {
            for attempt in 0..16 {
                let store = store.clone();
                let item_id = item_id.clone();
                tasks.push(tokio::spawn(async move {
                    let result = if attempt % 2 == 0 {
                        let url = format!("/v1/files/{attempt}");
                        store.mark_done(item_id.clone(), url).await
                    } else {
                        let message = format!("attempt {attempt}");
                        store.mark_error(item_id.clone(), message).await
                    };
                    (item_id, result)
                }));
            }
        }

        let mut accepted: HashMap<String, usize> = HashMap::new();
        let mut finalizations = Vec::new();
        for task in tasks {
            let (item_id, result) = task.await.unwrap();
            match result {
                Ok(finalized) => {
                    *accepted.entry(item_id).or_default() += 1;
                    finalizations.extend(finalized);
                }
                Err(Error::ItemAlreadyFinished { .. }) => {}
                Err(err) => panic!("unexpected mark failure: {err}"),
            }
        }
        assert_eq!(accepted.len(), 3);
        assert!(accepted.values().all(|count| *count == 1));
        assert_eq!(finalizations.len(), 1);

        let status = store.get_status(receipt.batch_id).await.unwrap().unwrap();
        assert_eq!(status.completed + status.failed, status.total);
        assert_eq!(status.status, finalizations[0]);
        assert!(status.status.is_terminal());
        assert!(status.items.iter().all(|item| item.status.is_terminal()));
        assert_eq!(store.queue_len().await.unwrap(), 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_are_popped_exactly_once() {
        let (store, dir) = temp_store();

        let creators: Vec<_> = (0..8)
            .map(|batch| {
                let store = store.clone();
                tokio::spawn(async move {
                    let jobs = (0..3)
                        .map(|item| design(&format!("batch {batch} item {item}")))
                        .collect();
                    let receipt = store.create_batch(batch_of(jobs)).await.unwrap();
                    let status = store
                        .get_status(receipt.batch_id.clone())
                        .await
                        .unwrap()
                        .unwrap();
                    assert_eq!(status.total, 3);
                    receipt
                })
            })
            .collect();

        let popper = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut popped = Vec::new();
                for _ in 0..1000 {
                    if popped.len() >= 24 {
                        break;
                    }
                    let items = store.pop_up_to(5).await.unwrap();
                    if items.is_empty() {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    popped.extend(ids(&items));
                }
                popped
            })
        };

        let mut receipts = Vec::new();
        for creator in creators {
            receipts.push(creator.await.unwrap());
        }
        let popped = popper.await.unwrap();

        assert_eq!(popped.len(), 24);
        let unique: HashSet<&String> = popped.iter().collect();
        let submitted: HashSet<&String> = receipts
            .iter()
            .flat_map(|receipt| receipt.item_ids.iter())
            .collect();
        assert_eq!(unique, submitted);

        // Items of one batch leave the queue in submission order.
        for receipt in &receipts {
            let positions: Vec<usize> = receipt
                .item_ids
                .iter()
                .map(|id| popped.iter().position(|popped_id| popped_id == id).unwrap())
                .collect();
            assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        }
        assert_eq!(store.queue_len().await.unwrap(), 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
