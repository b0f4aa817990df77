#![forbid(unsafe_code)]

mod error;
mod jobs;
mod outputs;

pub use error::StoreError;

use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const DB_FILENAME: &str = "calc_jobs.db";
const SCHEMA_VERSION: &str = "1";

/// SQLite-backed job ledger shared by every orchestrator process on the host.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    storage_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let conn = Connection::open(storage_dir.join(DB_FILENAME))?;
        // Several job processes write concurrently; wait for the lock instead of failing fast.
        conn.busy_timeout(Duration::from_secs(5))?;
        install_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            storage_dir,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(DB_FILENAME)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Read-then-write transactions take the write lock up front. A deferred transaction that
/// upgrades after another connection committed fails with `SQLITE_BUSY` without waiting.
fn write_tx(conn: &mut Connection) -> Result<Transaction<'_>, StoreError> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;

        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          status TEXT NOT NULL,
          pid INTEGER NOT NULL DEFAULT 0,
          parent_id INTEGER,
          is_array_member INTEGER NOT NULL DEFAULT 0,
          description TEXT NOT NULL,
          params_json TEXT NOT NULL,
          log_file TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          completed_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS outputs (
          calc_id INTEGER NOT NULL,
          key TEXT NOT NULL,
          size_mb REAL NOT NULL,
          PRIMARY KEY (calc_id, key)
        );

        CREATE TABLE IF NOT EXISTS datastores (
          calc_id INTEGER PRIMARY KEY,
          size_mb REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status_id ON jobs(status, id);
        "#,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

fn to_sqlite_i64(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("numeric overflow"))
}
