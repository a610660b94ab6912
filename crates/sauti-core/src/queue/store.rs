//! SQLite database shared by the durable queue and the batch state records.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task;
use tracing::warn;

use crate::error::{Error, Result};
use crate::job::{derive_batch_state, BatchState, ItemState, JobItem, JobTask};

const MAX_ERROR_CHARS: usize = 2_000;

/// Durable queue plus per-item and per-batch state, backed by one SQLite file.
///
/// Every public operation opens its own connection on the blocking pool, and
/// every multi-step update runs inside a single `BEGIN IMMEDIATE` transaction.
#[derive(Debug, Clone)]
pub struct JobStore {
    db_path: PathBuf,
}

impl JobStore {
    pub fn initialize(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    Error::Storage(format!(
                        "Failed to create queue database directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = open_connection(&db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS job_batches (
                batch_id TEXT PRIMARY KEY,
                label TEXT NULL,
                total INTEGER NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                finalized_at INTEGER NULL
            );

            CREATE TABLE IF NOT EXISTS job_items (
                item_id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL REFERENCES job_batches(batch_id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                custom_id TEXT NULL,
                operation TEXT NOT NULL,
                temperature REAL NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                result_url TEXT NULL,
                error TEXT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_items_batch
                ON job_items(batch_id, seq);

            CREATE INDEX IF NOT EXISTS idx_job_batches_finalized
                ON job_batches(finalized_at);

            CREATE TABLE IF NOT EXISTS job_queue (
                position INTEGER PRIMARY KEY,
                item_id TEXT NOT NULL UNIQUE REFERENCES job_items(item_id) ON DELETE CASCADE
            );
            "#,
        )?;

        Ok(Self { db_path })
    }

    /// Number of items currently waiting in the queue.
    pub async fn queue_len(&self) -> Result<usize> {
        self.run_blocking(|db_path| {
            let conn = open_connection(&db_path)?;
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM job_queue", [], |row| row.get(0))?;
            Ok(i64_to_u64(count) as usize)
        })
        .await
    }

    /// Current state of one item, `None` when the id is unknown.
    pub async fn item_state(&self, item_id: String) -> Result<Option<ItemState>> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM job_items WHERE item_id = ?1",
                    params![item_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(status.as_deref().and_then(ItemState::parse))
        })
        .await
    }

    pub(super) async fn run_blocking<F, T>(&self, task_fn: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || task_fn(db_path))
            .await
            .map_err(|err| Error::Storage(format!("Queue storage worker failed: {err}")))?
    }
}

/// Terminal outcome recorded for an item.
#[derive(Debug, Clone, Copy)]
pub(super) enum ItemOutcome<'a> {
    Done { url: &'a str },
    Failed { message: &'a str },
}

/// Move a non-terminal item to its terminal state, bump the matching batch
/// counter and finalize the batch once every item has finished.
pub(super) fn finish_item_tx(
    tx: &Transaction<'_>,
    item_id: &str,
    outcome: ItemOutcome<'_>,
) -> Result<Option<BatchState>> {
    let current: Option<(String, String)> = tx
        .query_row(
            "SELECT batch_id, status FROM job_items WHERE item_id = ?1",
            params![item_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((batch_id, status)) = current else {
        return Err(Error::ItemNotFound(item_id.to_string()));
    };
    if ItemState::parse(&status).is_some_and(ItemState::is_terminal) {
        return Err(Error::ItemAlreadyFinished {
            item_id: item_id.to_string(),
            status,
        });
    }

    // A finished item must never be handed out again.
    tx.execute(
        "DELETE FROM job_queue WHERE item_id = ?1",
        params![item_id],
    )?;

    let now = now_unix_millis_i64();
    match outcome {
        ItemOutcome::Done { url } => {
            tx.execute(
                r#"
                UPDATE job_items
                SET status = ?2, result_url = ?3, error = NULL, updated_at = ?4
                WHERE item_id = ?1
                "#,
                params![item_id, ItemState::Done.as_str(), url, now],
            )?;
            tx.execute(
                "UPDATE job_batches SET completed = completed + 1 WHERE batch_id = ?1",
                params![batch_id],
            )?;
        }
        ItemOutcome::Failed { message } => {
            let message = truncate_message(message);
            tx.execute(
                r#"
                UPDATE job_items
                SET status = ?2, error = ?3, updated_at = ?4
                WHERE item_id = ?1
                "#,
                params![item_id, ItemState::Error.as_str(), message, now],
            )?;
            tx.execute(
                "UPDATE job_batches SET failed = failed + 1 WHERE batch_id = ?1",
                params![batch_id],
            )?;
        }
    }

    finalize_batch_tx(tx, &batch_id, now)
}

/// Assign the final batch state exactly once, when every item has finished.
fn finalize_batch_tx(
    tx: &Transaction<'_>,
    batch_id: &str,
    now: i64,
) -> Result<Option<BatchState>> {
    let (total, completed, failed, status): (i64, i64, i64, String) = tx.query_row(
        "SELECT total, completed, failed, status FROM job_batches WHERE batch_id = ?1",
        params![batch_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    if BatchState::parse(&status).is_some_and(BatchState::is_terminal) {
        return Ok(None);
    }

    let derived = derive_batch_state(
        i64_to_u64(total),
        i64_to_u64(completed),
        i64_to_u64(failed),
        true,
    );
    if derived.is_terminal() {
        tx.execute(
            r#"
            UPDATE job_batches
            SET status = ?2, finalized_at = ?3
            WHERE batch_id = ?1 AND finalized_at IS NULL
            "#,
            params![batch_id, derived.as_str(), now],
        )?;
        return Ok(Some(derived));
    }

    if status == BatchState::Queued.as_str() {
        tx.execute(
            "UPDATE job_batches SET status = ?2 WHERE batch_id = ?1",
            params![batch_id, BatchState::Processing.as_str()],
        )?;
    }
    Ok(None)
}

/// Columns selected by [`map_queued_row`], prefixed with the queue position.
pub(super) const QUEUED_ITEM_COLUMNS: &str =
    "q.position, i.item_id, i.batch_id, i.custom_id, i.temperature, i.payload";

pub(super) struct QueuedRow {
    pub position: i64,
    pub item_id: String,
    pub batch_id: String,
    pub custom_id: Option<String>,
    pub temperature: f64,
    pub payload: String,
}

pub(super) fn map_queued_row(row: &Row<'_>) -> rusqlite::Result<QueuedRow> {
    Ok(QueuedRow {
        position: row.get(0)?,
        item_id: row.get(1)?,
        batch_id: row.get(2)?,
        custom_id: row.get(3)?,
        temperature: row.get(4)?,
        payload: row.get(5)?,
    })
}

impl QueuedRow {
    pub fn into_job_item(self) -> std::result::Result<JobItem, (String, serde_json::Error)> {
        match serde_json::from_str::<JobTask>(&self.payload) {
            Ok(task) => Ok(JobItem {
                item_id: self.item_id,
                batch_id: self.batch_id,
                custom_id: self.custom_id,
                temperature: self.temperature as f32,
                task,
            }),
            Err(err) => Err((self.item_id, err)),
        }
    }
}

pub(super) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|err| {
        Error::Storage(format!(
            "Unable to open SQLite database at {}: {err}",
            path.display()
        ))
    })?;
    conn.busy_timeout(Duration::from_secs(3))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn truncate_message(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= MAX_ERROR_CHARS {
        return trimmed.to_string();
    }
    warn!("Truncating oversized item error message");
    let mut result: String = trimmed.chars().take(MAX_ERROR_CHARS).collect();
    result.push_str("...");
    result
}

pub(super) fn now_unix_millis_i64() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}

pub(super) fn i64_to_u64(value: i64) -> u64 {
    if value.is_negative() {
        0
    } else {
        value as u64
    }
}
