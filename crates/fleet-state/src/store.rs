//! StateStore: redb-backed state persistence for the fleet services.
//!
//! Provides typed operations over plugin packages, config templates,
//! uploads, export jobs and subscriptions. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Operations are grouped by domain in sibling modules (`packages`,
//! `templates`, `jobs`, `subscriptions`), each adding an `impl StateStore`
//! block. Multi-row invariants are enforced inside a single write
//! transaction; redb serialises writers, so a transaction that returns an
//! error before `commit` leaves no trace.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Row table keyed by numeric id.
pub(crate) type RowTable = TableDefinition<'static, u64, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.open_table(PLUGIN_DESCS).map_err(map_err!(Table))?;
        txn.open_table(PACKAGES).map_err(map_err!(Table))?;
        txn.open_table(PACKAGE_INDEX).map_err(map_err!(Table))?;
        txn.open_table(PROC_CONTROLS).map_err(map_err!(Table))?;
        txn.open_table(CONFIG_TEMPLATES).map_err(map_err!(Table))?;
        txn.open_table(TEMPLATE_INDEX).map_err(map_err!(Table))?;
        txn.open_table(CONFIG_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(UPLOADS).map_err(map_err!(Table))?;
        txn.open_table(EXPORT_JOBS).map_err(map_err!(Table))?;
        txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
        txn.open_table(SUBSCRIPTION_STEPS).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCE_RECORDS).map_err(map_err!(Table))?;
        txn.open_table(LATEST_RECORDS).map_err(map_err!(Table))?;
        txn.open_table(PROCESS_TREES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Row helpers ────────────────────────────────────────────────

    /// Get one JSON row by id.
    pub(crate) fn get_row<T: DeserializeOwned>(
        &self,
        def: RowTable,
        id: u64,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all rows of a table in id order, keeping those `keep` accepts.
    pub(crate) fn list_rows<T: DeserializeOwned>(
        &self,
        def: RowTable,
        keep: impl Fn(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: T = decode(value.value())?;
            if keep(&row) {
                results.push(row);
            }
        }
        Ok(results)
    }

    /// Insert or replace one JSON row.
    pub(crate) fn put_row<T: Serialize>(&self, def: RowTable, id: u64, row: &T) -> StateResult<()> {
        let value = encode(row)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

/// Allocate the next id from a named sequence inside `txn`.
pub(crate) fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
    let current = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
