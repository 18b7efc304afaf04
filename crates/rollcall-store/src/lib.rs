//! rollcall-store: SQLite persistence for the enrollment gallery and the
//! attendance ledger.
//!
//! One [`Database`] owns a single connection behind a mutex; the face store
//! and the ledger are cheap handles onto it.

pub mod faces;
pub mod ledger;
pub mod schema;

pub use faces::SqliteFaceStore;
pub use ledger::SqliteLedger;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database failed integrity check: {0}")]
    Corrupt(String),
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::apply_pragmas(&conn)?;
        schema::apply_schema(&conn)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        };
        if let Err(e) = db.integrity_check() {
            tracing::warn!(error = %e, path = %path.display(), "SQLite integrity check failed on startup");
        }
        tracing::info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::apply_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn face_store(&self) -> SqliteFaceStore {
        SqliteFaceStore::new(self.clone())
    }

    pub fn ledger(&self) -> SqliteLedger {
        SqliteLedger::new(self.clone())
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(schema::read_schema_version(&self.lock())?)
    }

    /// `PRAGMA quick_check`.
    pub fn integrity_check(&self) -> Result<(), StoreError> {
        let result: String = self
            .lock()
            .query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result == "ok" {
            Ok(())
        } else {
            Err(StoreError::Corrupt(result))
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
