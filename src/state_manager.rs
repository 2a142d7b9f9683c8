// src/state_manager.rs

use crate::models::{DownloadRecord, DownloadedState};
use futures_util::stream::{BoxStream, StreamExt};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_rusqlite::Connection;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

const COLUMNS: &str =
    "id, course_id, title, size, path, url, file_type, state, progress, last_modified";

/// Re-enqueueing an existing id rewrites the row but keeps its `seq`, so the
/// record keeps its place in the queue.
const UPSERT_SQL: &str = "INSERT INTO downloads
        (id, course_id, title, size, path, url, file_type, state, progress, last_modified)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            course_id = excluded.course_id,
            title = excluded.title,
            size = excluded.size,
            path = excluded.path,
            url = excluded.url,
            file_type = excluded.file_type,
            state = excluded.state,
            progress = excluded.progress,
            last_modified = excluded.last_modified";

/// Durable table of download records.
///
/// All mutations go through one SQLite connection and are serialized by
/// `write_lock`; every committed mutation publishes a fresh full snapshot to
/// subscribers before the call returns.
pub struct QueueStore {
    conn: Connection,
    write_lock: Mutex<()>,
    snapshots: watch::Sender<Vec<DownloadRecord>>,
}

impl QueueStore {
    /// Opens (or creates) the database file and the `downloads` table.
    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(db_path).await?;
        Self::with_connection(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> Result<Self, StateError> {
        conn.call(|conn| {
            let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS downloads (
                    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                    id              TEXT NOT NULL UNIQUE,
                    course_id       TEXT NOT NULL,
                    title           TEXT NOT NULL,
                    size            INTEGER NOT NULL,
                    path            TEXT NOT NULL,
                    url             TEXT NOT NULL,
                    file_type       TEXT NOT NULL,
                    state           TEXT NOT NULL,
                    progress        REAL,
                    last_modified   TEXT
                );
                CREATE INDEX IF NOT EXISTS downloads_course_id ON downloads (course_id);
                CREATE INDEX IF NOT EXISTS downloads_state ON downloads (state);",
            )?;
            Ok(())
        })
        .await?;

        let (snapshots, _) = watch::channel(Vec::new());
        let store = Self { conn, write_lock: Mutex::new(()), snapshots };
        store.publish().await?;
        Ok(store)
    }

    /// Inserts or overwrites `records` in one transaction.
    pub async fn upsert(&self, records: Vec<DownloadRecord>) -> Result<(), StateError> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let count = records.len();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
                    for record in &records {
                        stmt.execute(params![
                            record.id,
                            record.course_id,
                            record.title,
                            to_sql_size(record.size),
                            record.path.to_string_lossy().into_owned(),
                            record.url,
                            record.file_type.as_str(),
                            record.state.as_str(),
                            record.progress.map(f64::from),
                            record.last_modified,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!(count, "upserted download records");
        self.publish().await
    }

    /// Deletes the rows with the given ids. Unknown ids are ignored.
    pub async fn delete_by_ids(&self, ids: &[String]) -> Result<(), StateError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let ids = ids.to_vec();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let sql = format!("DELETE FROM downloads WHERE id IN ({})", placeholders(ids.len()));
                let deleted = tx.execute(&sql, params_from_iter(ids.iter()))?;
                tx.commit()?;
                Ok(deleted)
            })
            .await?;
        debug!(deleted, "deleted download records");
        self.publish().await
    }

    /// Replaces the row of `record.id` with `record`, but only if the stored
    /// state is still `expected`. Returns whether the row was updated.
    pub async fn transition(
        &self,
        record: &DownloadRecord,
        expected: DownloadedState,
    ) -> Result<bool, StateError> {
        let _guard = self.write_lock.lock().await;
        let record = record.clone();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE downloads SET size = ?2, path = ?3, state = ?4, progress = ?5
                     WHERE id = ?1 AND state = ?6",
                    params![
                        record.id,
                        to_sql_size(record.size),
                        record.path.to_string_lossy().into_owned(),
                        record.state.as_str(),
                        record.progress.map(f64::from),
                        expected.as_str(),
                    ],
                )?;
                Ok(changed)
            })
            .await?;
        if changed == 0 {
            return Ok(false);
        }
        self.publish().await?;
        Ok(true)
    }

    /// Stores the last known progress of a record that is still downloading.
    pub async fn update_progress(&self, id: &str, fraction: f32) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;
        let id = id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE downloads SET progress = ?2 WHERE id = ?1 AND state = ?3",
                    params![id, f64::from(fraction), DownloadedState::Downloading.as_str()],
                )?;
                Ok(changed)
            })
            .await?;
        if changed > 0 {
            self.publish().await?;
        }
        Ok(())
    }

    /// Puts records that were mid-transfer when the process died back into the
    /// waiting state. Returns how many rows were reset.
    pub async fn reset_interrupted(&self) -> Result<usize, StateError> {
        let _guard = self.write_lock.lock().await;
        let reset = self
            .conn
            .call(|conn| {
                let reset = conn.execute(
                    "UPDATE downloads SET state = ?1, progress = NULL WHERE state = ?2",
                    params![DownloadedState::Waiting.as_str(), DownloadedState::Downloading.as_str()],
                )?;
                Ok(reset)
            })
            .await?;
        if reset > 0 {
            self.publish().await?;
        }
        Ok(reset)
    }

    /// One-shot read of every record, in queue order.
    pub async fn snapshot(&self) -> Result<Vec<DownloadRecord>, StateError> {
        self.query("", Vec::new()).await
    }

    pub async fn by_ids(&self, ids: &[String]) -> Result<Vec<DownloadRecord>, StateError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = format!("WHERE id IN ({})", placeholders(ids.len()));
        self.query(&filter, ids.to_vec()).await
    }

    pub async fn by_course_id(&self, course_id: &str) -> Result<Vec<DownloadRecord>, StateError> {
        self.query("WHERE course_id = ?1", vec![course_id.to_string()]).await
    }

    /// Waiting records, oldest first.
    pub async fn waiting(&self) -> Result<Vec<DownloadRecord>, StateError> {
        self.query("WHERE state = ?1", vec![DownloadedState::Waiting.as_str().to_string()])
            .await
    }

    /// Live view of the table. The receiver holds the current snapshot and is
    /// notified after every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DownloadRecord>> {
        self.snapshots.subscribe()
    }

    /// [`subscribe`](Self::subscribe) as a stream; the first item is the
    /// current snapshot.
    pub fn watch(&self) -> BoxStream<'static, Vec<DownloadRecord>> {
        WatchStream::new(self.subscribe()).boxed()
    }

    async fn query(&self, filter: &str, args: Vec<String>) -> Result<Vec<DownloadRecord>, StateError> {
        let sql = format!("SELECT {COLUMNS} FROM downloads {filter} ORDER BY seq");
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), row_to_record)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row?);
                }
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    async fn publish(&self) -> Result<(), StateError> {
        let records = self.snapshot().await?;
        self.snapshots.send_replace(records);
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn to_sql_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let size: i64 = row.get(3)?;
    let path: String = row.get(4)?;
    let file_type: String = row.get(6)?;
    let state: String = row.get(7)?;
    let progress: Option<f64> = row.get(8)?;
    Ok(DownloadRecord {
        id: row.get(0)?,
        course_id: row.get(1)?,
        title: row.get(2)?,
        size: u64::try_from(size).unwrap_or(0),
        path: PathBuf::from(path),
        url: row.get(5)?,
        file_type: file_type
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
        state: state
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?,
        progress: progress.map(|p| p as f32),
        last_modified: row.get(9)?,
    })
}
