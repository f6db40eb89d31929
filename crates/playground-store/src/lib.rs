//! playground-store — run-record persistence.
//!
//! Stores one flat JSON document per run, keyed by run id. Records are
//! written once after a query finishes and never updated. Supports both
//! on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;
use tracing::debug;

use playground_core::run::Run;

const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("query_runs");

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the run store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe run store backed by redb.
#[derive(Clone)]
pub struct RunStore {
    db: Arc<Database>,
}

impl RunStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_table()?;
        debug!(?path, "run store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_table()?;
        Ok(store)
    }

    fn ensure_table(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Persist one run record.
    pub fn put(&self, run: &Run) -> StoreResult<()> {
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            table
                .insert(run.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %run.id, "run stored");
        Ok(())
    }

    /// Fetch a run record by id.
    pub fn get(&self, id: &str) -> StoreResult<Option<Run>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let run: Run =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playground_core::settings::{ClickHouseSettings, RunSettings};

    fn test_run() -> Run {
        let mut run = Run::new("SELECT 1", "clickhouse", "21.8", None);
        run.output = "1\n".to_string();
        run.execution_time_ms = 250;
        run
    }

    #[test]
    fn put_and_get_round_trip() {
        let store = RunStore::open_in_memory().unwrap();
        let run = test_run();

        store.put(&run).unwrap();
        let loaded = store.get(&run.id).unwrap().unwrap();

        assert_eq!(loaded, run);
    }

    #[test]
    fn get_missing_returns_none() {
        let store = RunStore::open_in_memory().unwrap();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn settings_survive_persistence() {
        let store = RunStore::open_in_memory().unwrap();
        let mut run = test_run();
        run.settings = Some(RunSettings::ClickHouse(ClickHouseSettings {
            output_format: Some("JSONEachRow".to_string()),
        }));

        store.put(&run).unwrap();
        let loaded = store.get(&run.id).unwrap().unwrap();
        assert_eq!(loaded.settings, run.settings);
    }

    #[test]
    fn documents_use_flat_store_keys() {
        // The store contract is a flat document keyed by Id.
        let run = test_run();
        let doc = serde_json::to_value(&run).unwrap();
        assert_eq!(doc["Id"], run.id.as_str());
        assert_eq!(doc["Input"], "SELECT 1");
        assert_eq!(doc["Output"], "1\n");
    }
}
