//! Embedded relational store for metrics, messages, tool calls, settings,
//! user memories, conversation summaries, and file-recall rows.
//!
//! The working database lives in memory; a debounced flush (at most once per
//! second after a write burst) copies it to the on-disk file via the SQLite
//! backup API. [`Store::flush_now`] runs synchronously on shutdown and
//! [`Store::reload`] re-imports the file image for read-mostly consumers.
//!
//! Connection work runs on the blocking pool (`spawn_blocking`), one
//! serialized writer behind a mutex; readers see consistent snapshots.

mod memories;
mod recall;
mod requests;
mod settings;
mod summaries;

pub use memories::MemoryRow;
pub use recall::{RecallFileRow, RecallInstanceRow};
pub use requests::{NewRequest, RequestRecord, RequestTotals};
pub use summaries::SummaryRow;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::backup::Backup;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::cost::default_pricing_rows;
use crate::error::StoreError;

/// Debounce window between a write burst and the disk flush.
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(1);

/// Current UNIX time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) struct Inner {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    dirty: AtomicBool,
    flush_scheduled: AtomicBool,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Storage("store mutex poisoned".to_string()))
    }

    /// Copies the in-memory database over the on-disk file.
    fn flush_blocking(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Storage(format!("create db dir: {e}")))?;
        }
        let conn = self.lock()?;
        let mut file = Connection::open(&self.db_path)?;
        let backup = Backup::new(&*conn, &mut file)?;
        backup.run_to_completion(64, Duration::from_millis(5), None)?;
        Ok(())
    }

    /// Replaces the in-memory database with the on-disk image.
    fn reload_blocking(&self) -> Result<(), StoreError> {
        if !self.db_path.exists() {
            return Ok(());
        }
        let file = Connection::open(&self.db_path)?;
        let mut conn = self.lock()?;
        let backup = Backup::new(&file, &mut *conn)?;
        backup.run_to_completion(64, Duration::from_millis(5), None)?;
        Ok(())
    }
}

/// The process-wide persistence store.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<Inner>,
}

impl Store {
    /// Opens the store: imports the on-disk image when one exists, ensures
    /// the schema, and seeds default pricing settings.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        let mut conn = Connection::open_in_memory()?;
        if db_path.exists() {
            let file = Connection::open(&db_path)?;
            let backup = Backup::new(&file, &mut conn)?;
            backup.run_to_completion(64, Duration::from_millis(5), None)?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::ensure_schema(&conn)?;
        Self::seed_settings(&conn)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                db_path,
                dirty: AtomicBool::new(false),
                flush_scheduled: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL DEFAULT '',
                instance_id TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL,
                provider TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens INTEGER NOT NULL DEFAULT 0,
                cache_write_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'failed',
                latency_ms INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id INTEGER NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tool_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id INTEGER NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                tool_name TEXT NOT NULL,
                parameters TEXT NOT NULL,
                result TEXT NOT NULL DEFAULT '',
                success INTEGER NOT NULL DEFAULT 0,
                execution_ms INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS conversation_summaries (
                conversation_id TEXT PRIMARY KEY,
                summary TEXT NOT NULL,
                watermark INTEGER NOT NULL,
                compaction_count INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recall_instances (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                api_key TEXT NOT NULL,
                vector_store_id TEXT,
                access_token TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recall_files (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES recall_instances(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                storage_name TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                size INTEGER NOT NULL,
                media_type TEXT NOT NULL DEFAULT '',
                upstream_file_id TEXT,
                upstream_vector_file_id TEXT,
                status TEXT NOT NULL DEFAULT 'processing',
                error TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE(instance_id, sha256)
            );
            CREATE INDEX IF NOT EXISTS idx_requests_conversation
                ON requests(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_memories_user
                ON user_memories(user_id);
            "#,
        )?;
        Ok(())
    }

    fn seed_settings(conn: &Connection) -> Result<(), StoreError> {
        let mut stmt =
            conn.prepare("INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)")?;
        for (key, value) in default_pricing_rows() {
            stmt.execute(rusqlite::params![key, value])?;
        }
        Ok(())
    }

    /// Runs a read-only closure against the connection on the blocking pool.
    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let conn = inner.lock()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Storage(format!("blocking task: {e}")))?
    }

    /// Runs a mutating closure, then marks the store dirty and schedules the
    /// debounced flush.
    pub(crate) async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let result = self.read(f).await?;
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.schedule_flush();
        Ok(result)
    }

    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            inner.flush_scheduled.store(false, Ordering::SeqCst);
            if inner.dirty.swap(false, Ordering::SeqCst) {
                let worker = inner.clone();
                let flushed =
                    tokio::task::spawn_blocking(move || worker.flush_blocking()).await;
                match flushed {
                    Ok(Ok(())) => debug!("store flushed to disk"),
                    Ok(Err(e)) => warn!(error = %e, "store flush failed"),
                    Err(e) => warn!(error = %e, "store flush task failed"),
                }
            }
        });
    }

    /// Synchronous flush for shutdown paths.
    pub async fn flush_now(&self) -> Result<(), StoreError> {
        self.inner.dirty.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.flush_blocking())
            .await
            .map_err(|e| StoreError::Storage(format!("blocking task: {e}")))?
    }

    /// Re-imports the on-disk image (another process may have written it).
    pub async fn reload(&self) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.reload_blocking())
            .await
            .map_err(|e| StoreError::Storage(format!("blocking task: {e}")))?
    }

    /// Deletes request rows older than `days` (cascading messages and tool
    /// calls) and rebuilds free space. A zero retention keeps everything.
    pub async fn purge_older_than(&self, days: u32) -> Result<usize, StoreError> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = now_millis() - i64::from(days) * 86_400_000;
        self.write(move |conn| {
            let removed = conn.execute(
                "DELETE FROM requests WHERE created_at < ?1",
                rusqlite::params![cutoff],
            )?;
            conn.execute_batch("VACUUM;")?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: open on a fresh path creates the schema and seeds pricing.
    #[tokio::test]
    async fn open_seeds_pricing_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();
        let settings = store.settings_with_prefix("pricing.").await.unwrap();
        assert!(settings.contains_key("pricing.anthropic.default.input"));
    }

    /// **Scenario**: flush_now writes a file another Store can open and read.
    #[tokio::test]
    async fn flush_and_reopen_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let store = Store::open(&path).unwrap();
        store.set_setting("custom.key", "v1").await.unwrap();
        store.flush_now().await.unwrap();

        let second = Store::open(&path).unwrap();
        let v = second.get_setting("custom.key").await.unwrap();
        assert_eq!(v.as_deref(), Some("v1"));
    }

    /// **Scenario**: reload picks up rows written to the file by another store.
    #[tokio::test]
    async fn reload_sees_external_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let writer = Store::open(&path).unwrap();
        let reader = Store::open(&path).unwrap();

        writer.set_setting("shared.key", "hello").await.unwrap();
        writer.flush_now().await.unwrap();

        assert_eq!(reader.get_setting("shared.key").await.unwrap(), None);
        reader.reload().await.unwrap();
        assert_eq!(
            reader.get_setting("shared.key").await.unwrap().as_deref(),
            Some("hello")
        );
    }

    /// **Scenario**: purge with zero retention is a no-op.
    #[tokio::test]
    async fn purge_zero_days_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();
        assert_eq!(store.purge_older_than(0).await.unwrap(), 0);
    }
}
