//! SQLite-backed service table.
//!
//! Stands in for the pinned kernel map: one row per (service key, backend)
//! pair, both stored as the four network-order octets the data-plane reads,
//! with a hard row limit enforced on insert. Because it is durable, a
//! restarted synchronizer finds exactly what the previous process left.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use lifter_addr::{BackendAddress, ServiceKey};
use lifter_reconcile::{ServiceTable, TableError};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors opening or reading the table file.
#[derive(Debug, Error)]
pub enum TableStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

impl From<TableStoreError> for TableError {
    fn from(err: TableStoreError) -> Self {
        match err {
            TableStoreError::Sqlite(e) => classify(e),
            TableStoreError::InvalidRow(msg) => TableError::Unavailable(msg),
        }
    }
}

/// Busy/locked databases clear on their own; anything else means the file
/// is not usable.
fn classify(err: rusqlite::Error) -> TableError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            TableError::Transient(err.to_string())
        }
        _ => TableError::Unavailable(err.to_string()),
    }
}

/// Durable fixed-capacity table.
pub struct SqliteTable {
    conn: Mutex<Connection>,
    capacity: usize,
}

impl SqliteTable {
    /// Open or create a table file at the given path.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, TableStoreError> {
        let conn = Connection::open(path)?;

        // WAL lets external readers inspect the table while we write.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let table = Self {
            conn: Mutex::new(conn),
            capacity,
        };
        table.init_schema()?;

        Ok(table)
    }

    /// Open an in-memory table (for testing).
    pub fn open_in_memory(capacity: usize) -> Result<Self, TableStoreError> {
        let table = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            capacity,
        };
        table.init_schema()?;
        Ok(table)
    }

    fn init_schema(&self) -> Result<(), TableStoreError> {
        self.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS svc_map (
                service_key BLOB NOT NULL,
                backend BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (service_key, backend)
            ) WITHOUT ROWID;
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored pairs.
    pub fn len(&self) -> Result<usize, TableStoreError> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM svc_map", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, TableStoreError> {
        Ok(self.len()? == 0)
    }

    fn insert(&self, key: ServiceKey, backend: BackendAddress) -> Result<(), TableError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(classify)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM svc_map WHERE service_key = ?1 AND backend = ?2",
                params![key.to_wire().as_slice(), backend.to_wire().as_slice()],
                |_| Ok(()),
            )
            .optional()
            .map_err(classify)?
            .is_some();

        if !exists {
            let count: i64 = tx
                .query_row("SELECT COUNT(*) FROM svc_map", [], |row| row.get(0))
                .map_err(classify)?;
            if count as usize >= self.capacity {
                return Err(TableError::CapacityExceeded {
                    capacity: self.capacity,
                });
            }

            tx.execute(
                "INSERT INTO svc_map (service_key, backend, updated_at) VALUES (?1, ?2, ?3)",
                params![
                    key.to_wire().as_slice(),
                    backend.to_wire().as_slice(),
                    Utc::now().timestamp()
                ],
            )
            .map_err(classify)?;
        }

        tx.commit().map_err(classify)?;
        debug!(service_key = %key, backend = %backend, inserted = !exists, "[SQLITE] upsert");
        Ok(())
    }

    fn remove(&self, key: ServiceKey, backend: BackendAddress) -> Result<(), TableError> {
        let removed = self
            .lock()
            .execute(
                "DELETE FROM svc_map WHERE service_key = ?1 AND backend = ?2",
                params![key.to_wire().as_slice(), backend.to_wire().as_slice()],
            )
            .map_err(classify)?;
        debug!(service_key = %key, backend = %backend, removed, "[SQLITE] delete");
        Ok(())
    }

    fn rows(&self) -> Result<Vec<(ServiceKey, BackendAddress)>, TableStoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT service_key, backend FROM svc_map")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut pairs = Vec::new();
        for row in rows {
            let (key, backend) = row?;
            pairs.push((
                ServiceKey::from_wire(octets(&key)?),
                BackendAddress::from_wire(octets(&backend)?),
            ));
        }
        Ok(pairs)
    }
}

fn octets(raw: &[u8]) -> Result<[u8; 4], TableStoreError> {
    raw.try_into()
        .map_err(|_| TableStoreError::InvalidRow(format!("expected 4 octets, found {}", raw.len())))
}

#[async_trait]
impl ServiceTable for SqliteTable {
    async fn upsert(&self, key: ServiceKey, backend: BackendAddress) -> Result<(), TableError> {
        self.insert(key, backend)
    }

    async fn delete(&self, key: ServiceKey, backend: BackendAddress) -> Result<(), TableError> {
        self.remove(key, backend)
    }

    async fn list(&self) -> Result<Vec<(ServiceKey, BackendAddress)>, TableError> {
        Ok(self.rows()?)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
