//! Database lifecycle collaborator.
//!
//! The monitors keep all state in bounded in-memory stores; this handle
//! exists only so the process owns an open/close lifecycle around a SQLite
//! file that future persistence could attach to. Nothing reads or writes it
//! during normal operation.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, SitewatchError};

pub struct Database {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(Database {
            conn: Mutex::new(Some(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Close the handle. Idempotent; a second call is a no-op.
    pub fn close(&self) -> Result<()> {
        let conn = match self.conn.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| SitewatchError::Database(e))?;
            tracing::info!(path = %self.path.display(), "database closed");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
