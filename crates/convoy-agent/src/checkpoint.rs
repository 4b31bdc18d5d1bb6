use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use convoy_core::config::CheckpointTarget;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::CheckpointStore;
use convoy_core::types::{Checkpoint, RunId, SharedState, Topology};

fn persistence<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> ConvoyError {
    move |e| ConvoyError::Persistence(format!("{}: {}", context, e))
}

/// Checkpoint store backed by SQLite.
///
/// Every snapshot is kept, one row per step; `load` returns the newest.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(persistence("Failed to create checkpoint directory"))?;
            }
        }

        let conn = Connection::open(path).map_err(persistence("Failed to open checkpoint store"))?;
        Self::init(conn)
    }

    /// Database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(persistence("Failed to open checkpoint store"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 step INTEGER NOT NULL,
                 node TEXT,
                 topology TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_run_step
                 ON checkpoints(run_id, step DESC);",
        )
        .map_err(persistence("Failed to initialize checkpoint schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ConvoyError::Persistence(e.to_string()))
    }
}

/// Raw row, decoded outside the rusqlite closure so JSON errors stay typed.
struct Row {
    run_id: String,
    step: i64,
    node: Option<String>,
    topology: String,
    state_json: String,
    created_at: String,
}

impl Row {
    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            step: row.get(1)?,
            node: row.get(2)?,
            topology: row.get(3)?,
            state_json: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<Checkpoint> {
        let state: SharedState = serde_json::from_str(&self.state_json)
            .map_err(persistence("Failed to decode checkpoint state"))?;
        let topology: Topology = self
            .topology
            .parse()
            .map_err(persistence("Failed to decode checkpoint topology"))?;
        Ok(Checkpoint {
            run_id: RunId(self.run_id),
            step: self.step as usize,
            node: self.node,
            topology,
            state,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT run_id, step, node, topology, state_json, created_at FROM checkpoints";

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, cp: &Checkpoint) -> Result<()> {
        let state_json = serde_json::to_string(&cp.state)
            .map_err(persistence("Failed to serialize checkpoint state"))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO checkpoints (run_id, step, node, topology, state_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                cp.run_id.as_str(),
                cp.step as i64,
                cp.node,
                cp.topology.to_string(),
                state_json,
                cp.created_at.to_rfc3339(),
            ],
        )
        .map_err(persistence("Failed to save checkpoint"))?;

        debug!(run_id = %cp.run_id, step = cp.step, "Checkpoint saved");
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> Result<Checkpoint> {
        let row = {
            let conn = self.lock()?;
            conn.query_row(
                &format!(
                    "{} WHERE run_id = ?1 ORDER BY step DESC, id DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![run_id.as_str()],
                Row::from_sql,
            )
            .optional()
            .map_err(persistence("Failed to load checkpoint"))?
        };
        row.ok_or_else(|| ConvoyError::NotFound(run_id.to_string()))?
            .decode()
    }

    fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE run_id = ?1 ORDER BY step ASC, id ASC",
                    SELECT_COLUMNS
                ))
                .map_err(persistence("Failed to prepare query"))?;
            let rows = stmt
                .query_map(params![run_id.as_str()], Row::from_sql)
                .map_err(persistence("Failed to list checkpoints"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(persistence("Failed to list checkpoints"))?;
            rows
        };
        rows.into_iter().map(Row::decode).collect()
    }

    fn list_runs(&self) -> Result<Vec<RunId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id FROM checkpoints
                 GROUP BY run_id
                 ORDER BY MIN(id) ASC",
            )
            .map_err(persistence("Failed to prepare query"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(persistence("Failed to list runs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(persistence("Failed to list runs"))?;
        Ok(ids.into_iter().map(RunId).collect())
    }

    fn delete_run(&self, run_id: &RunId) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM checkpoints WHERE run_id = ?1",
            params![run_id.as_str()],
        )
        .map_err(persistence("Failed to delete checkpoints"))
    }
}

/// Checkpoint store held in process memory. Gone when the process exits.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, Vec<Checkpoint>>>,
    order: Mutex<Vec<String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, cp: &Checkpoint) -> Result<()> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|e| ConvoyError::Persistence(e.to_string()))?;
        let key = cp.run_id.as_str().to_string();
        if !runs.contains_key(&key) {
            self.order
                .lock()
                .map_err(|e| ConvoyError::Persistence(e.to_string()))?
                .push(key.clone());
        }
        runs.entry(key).or_default().push(cp.clone());
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> Result<Checkpoint> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| ConvoyError::Persistence(e.to_string()))?;
        runs.get(run_id.as_str())
            .and_then(|snapshots| snapshots.iter().max_by_key(|cp| cp.step))
            .cloned()
            .ok_or_else(|| ConvoyError::NotFound(run_id.to_string()))
    }

    fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| ConvoyError::Persistence(e.to_string()))?;
        let mut snapshots = runs.get(run_id.as_str()).cloned().unwrap_or_default();
        snapshots.sort_by_key(|cp| cp.step);
        Ok(snapshots)
    }

    fn list_runs(&self) -> Result<Vec<RunId>> {
        let order = self
            .order
            .lock()
            .map_err(|e| ConvoyError::Persistence(e.to_string()))?;
        Ok(order.iter().map(|id| RunId(id.clone())).collect())
    }

    fn delete_run(&self, run_id: &RunId) -> Result<usize> {
        let removed = self
            .runs
            .lock()
            .map_err(|e| ConvoyError::Persistence(e.to_string()))?
            .remove(run_id.as_str())
            .map(|snapshots| snapshots.len())
            .unwrap_or(0);
        self.order
            .lock()
            .map_err(|e| ConvoyError::Persistence(e.to_string()))?
            .retain(|id| id != run_id.as_str());
        Ok(removed)
    }
}

/// Open the store a configuration points at.
pub fn open_store(target: &CheckpointTarget) -> Result<Arc<dyn CheckpointStore>> {
    match target {
        CheckpointTarget::Memory => Ok(Arc::new(MemoryCheckpointStore::new())),
        CheckpointTarget::Sqlite(path) => Ok(Arc::new(SqliteCheckpointStore::open(path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::types::{Message, Metadata, Role};

    fn temp_store() -> SqliteCheckpointStore {
        let dir =
            std::env::temp_dir().join(format!("convoy_checkpoint_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        SqliteCheckpointStore::open(&dir.join("checkpoints.db")).unwrap()
    }

    fn state() -> SharedState {
        let mut meta = Metadata::new();
        meta.insert("max_turns".into(), serde_json::json!(4));
        meta.insert("nested".into(), serde_json::json!({"a": [1, 2]}));
        SharedState::new(
            vec![
                Message::user("start").with_id("m-0"),
                Message::agent("draft")
                    .with_id("m-1")
                    .with_meta("agent", serde_json::json!("writer")),
                Message::new(Role::Tool, "search: 3 results").with_id("m-2"),
            ],
            meta,
        )
    }

    fn checkpoint(run: &str, step: usize, node: Option<&str>) -> Checkpoint {
        Checkpoint::new(
            RunId::from(run),
            step,
            node.map(String::from),
            Topology::Sequential,
            state(),
        )
    }

    fn exercise(store: &dyn CheckpointStore) {
        let run = RunId::from("run-1");
        assert!(matches!(store.load(&run), Err(ConvoyError::NotFound(_))));
        assert!(!store.exists(&run).unwrap());

        store.save(&checkpoint("run-1", 0, None)).unwrap();
        store.save(&checkpoint("run-1", 1, Some("writer"))).unwrap();
        store.save(&checkpoint("run-2", 0, None)).unwrap();

        let latest = store.load(&run).unwrap();
        assert_eq!(latest.step, 1);
        assert_eq!(latest.node.as_deref(), Some("writer"));
        assert_eq!(latest.topology, Topology::Sequential);
        assert_eq!(latest.state, state());
        assert_eq!(store.load_state(&run).unwrap(), state());

        let steps: Vec<usize> = store.history(&run).unwrap().iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![0, 1]);
        assert_eq!(
            store.list_runs().unwrap(),
            vec![RunId::from("run-1"), RunId::from("run-2")]
        );

        assert_eq!(store.delete_run(&run).unwrap(), 2);
        assert!(!store.exists(&run).unwrap());
        assert_eq!(store.list_runs().unwrap(), vec![RunId::from("run-2")]);
        assert_eq!(store.delete_run(&run).unwrap(), 0);
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&temp_store());
    }

    #[test]
    fn test_sqlite_in_memory_store() {
        exercise(&SqliteCheckpointStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryCheckpointStore::new());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("convoy_reopen_{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("cp.db");
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.save(&checkpoint("run-x", 2, Some("critic"))).unwrap();
        }
        let store = SqliteCheckpointStore::open(&path).unwrap();
        let loaded = store.load(&RunId::from("run-x")).unwrap();
        assert_eq!(loaded.state.history[1].id_str(), Some("m-1"));
        assert_eq!(loaded.state.history[1].metadata["agent"], "writer");
        assert_eq!(loaded.state.metadata["nested"]["a"][1], 2);
    }

    #[test]
    fn test_float_metadata_is_lossless() {
        let values = [0.7, 0.1, 1.4002e-5, 0.30000000000000004, 1.0 / 3.0, 6.02214076e23];
        let mut meta = Metadata::new();
        meta.insert("temperatures".into(), serde_json::json!(values));
        let mut history = state().history;
        for (i, v) in values.iter().enumerate() {
            history.push(
                Message::agent(format!("sample {}", i))
                    .with_id(format!("f-{}", i).as_str())
                    .with_meta("score", serde_json::json!(v)),
            );
        }
        let cp = Checkpoint::new(
            RunId::from("floats"),
            3,
            Some("critic".into()),
            Topology::Broadcast,
            SharedState::new(history, meta),
        );

        let stores: Vec<Box<dyn CheckpointStore>> = vec![
            Box::new(temp_store()),
            Box::new(SqliteCheckpointStore::open_in_memory().unwrap()),
            Box::new(MemoryCheckpointStore::new()),
        ];
        for store in stores {
            store.save(&cp).unwrap();
            let loaded = store.load(&cp.run_id).unwrap();
            assert_eq!(loaded.state, cp.state);
            for (i, v) in values.iter().enumerate() {
                let score = loaded.state.history[3 + i].metadata["score"].as_f64();
                assert_eq!(score, Some(*v));
            }
        }
    }

    #[test]
    fn test_corrupt_row_is_persistence_error() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO checkpoints (run_id, step, node, topology, state_json, created_at)
                 VALUES ('bad', 0, NULL, 'sequential', '{not json', '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        assert!(matches!(
            store.load(&RunId::from("bad")),
            Err(ConvoyError::Persistence(_))
        ));
    }

    #[test]
    fn test_open_store_targets() {
        let memory = open_store(&CheckpointTarget::parse("")).unwrap();
        memory.save(&checkpoint("r", 0, None)).unwrap();
        assert!(memory.exists(&RunId::from("r")).unwrap());

        let dir = std::env::temp_dir().join(format!("convoy_target_{}", uuid::Uuid::new_v4()));
        let path = dir.join("cp.db");
        let sqlite = open_store(&CheckpointTarget::Sqlite(path.clone())).unwrap();
        sqlite.save(&checkpoint("r", 0, None)).unwrap();
        assert!(path.exists());
    }
}
