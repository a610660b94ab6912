//! Durable FIFO operations: push, push-to-front and atomic pop.

use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use super::store::{
    finish_item_tx, map_queued_row, now_unix_millis_i64, open_connection, ItemOutcome, JobStore,
    QUEUED_ITEM_COLUMNS,
};
use crate::error::Result;
use crate::job::{BatchState, ItemState, JobItem};

impl JobStore {
    /// Append an existing, unfinished item to the tail of the queue.
    ///
    /// Returns `false` when the item is unknown, already finished or already queued.
    pub async fn push(&self, item: &JobItem) -> Result<bool> {
        let item_id = item.item_id.clone();
        self.run_blocking(move |db_path| {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pushed = requeue_tx(&tx, &item_id, None)?;
            tx.commit()?;
            Ok(pushed)
        })
        .await
    }

    /// Reinsert items at the head of the queue, keeping their relative order,
    /// and reset them to `queued`.
    ///
    /// Finished items are skipped. Returns how many items were requeued.
    pub async fn push_front(&self, items: &[JobItem]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let item_ids: Vec<String> = items.iter().map(|item| item.item_id.clone()).collect();

        self.run_blocking(move |db_path| {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let head: Option<i64> =
                tx.query_row("SELECT MIN(position) FROM job_queue", [], |row| row.get(0))?;
            let first_position = head.unwrap_or(1) - item_ids.len() as i64;

            let mut requeued = 0;
            for (offset, item_id) in item_ids.iter().enumerate() {
                if requeue_tx(&tx, item_id, Some(first_position + offset as i64))? {
                    requeued += 1;
                }
            }

            tx.commit()?;
            Ok(requeued)
        })
        .await
    }

    /// Atomically remove up to `max_items` from the head of the queue and mark
    /// them `processing`. Never blocks waiting for work.
    pub async fn pop_up_to(&self, max_items: usize) -> Result<Vec<JobItem>> {
        if max_items == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(max_items).unwrap_or(i64::MAX);

        self.run_blocking(move |db_path| {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let rows = {
                let mut stmt = tx.prepare(&format!(
                    r#"
                    SELECT {QUEUED_ITEM_COLUMNS}
                    FROM job_queue q
                    JOIN job_items i ON i.item_id = q.item_id
                    ORDER BY q.position ASC
                    LIMIT ?1
                    "#
                ))?;
                let mapped = stmt.query_map(params![limit], map_queued_row)?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let now = now_unix_millis_i64();
            let mut items = Vec::with_capacity(rows.len());
            for row in rows {
                tx.execute(
                    "DELETE FROM job_queue WHERE position = ?1",
                    params![row.position],
                )?;

                match row.into_job_item() {
                    Ok(item) => {
                        tx.execute(
                            r#"
                            UPDATE job_items SET status = ?2, updated_at = ?3
                            WHERE item_id = ?1 AND status = ?4
                            "#,
                            params![
                                item.item_id,
                                ItemState::Processing.as_str(),
                                now,
                                ItemState::Queued.as_str()
                            ],
                        )?;
                        tx.execute(
                            "UPDATE job_batches SET status = ?2 \
                             WHERE batch_id = ?1 AND status = ?3",
                            params![
                                item.batch_id,
                                BatchState::Processing.as_str(),
                                BatchState::Queued.as_str()
                            ],
                        )?;
                        items.push(item);
                    }
                    Err((item_id, err)) => {
                        // An undecodable payload would otherwise wedge the head of the queue.
                        warn!("Dropping queued item {item_id} with unreadable payload: {err}");
                        let message = format!("Stored job payload is unreadable: {err}");
                        finish_item_tx(&tx, &item_id, ItemOutcome::Failed { message: &message })?;
                    }
                }
            }

            tx.commit()?;
            if !items.is_empty() {
                debug!("Popped {} queued item(s)", items.len());
            }
            Ok(items)
        })
        .await
    }
}

/// Reset an unfinished item to `queued` and place it in the queue.
///
/// `position` of `None` appends after the current tail.
pub(super) fn requeue_tx(
    tx: &Transaction<'_>,
    item_id: &str,
    position: Option<i64>,
) -> Result<bool> {
    let updated = tx.execute(
        r#"
        UPDATE job_items SET status = ?2, updated_at = ?3
        WHERE item_id = ?1 AND status IN (?2, ?4)
        "#,
        params![
            item_id,
            ItemState::Queued.as_str(),
            now_unix_millis_i64(),
            ItemState::Processing.as_str()
        ],
    )?;
    if updated == 0 {
        return Ok(false);
    }

    let already_queued: Option<i64> = tx
        .query_row(
            "SELECT position FROM job_queue WHERE item_id = ?1",
            params![item_id],
            |row| row.get(0),
        )
        .optional()?;
    if already_queued.is_some() {
        return Ok(false);
    }

    match position {
        Some(position) => tx.execute(
            "INSERT INTO job_queue (position, item_id) VALUES (?1, ?2)",
            params![position, item_id],
        )?,
        None => tx.execute(
            "INSERT INTO job_queue (item_id) VALUES (?1)",
            params![item_id],
        )?,
    };
    Ok(true)
}
