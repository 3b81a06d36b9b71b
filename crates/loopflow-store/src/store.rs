use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use loopflow_core::error::{LoopflowError, Result};
use loopflow_core::traits::RunStore;
use loopflow_core::types::{GraphId, GraphRecord, RunId, RunRecord};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS graphs (
        graph_id TEXT PRIMARY KEY,
        payload TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        graph_id TEXT NOT NULL,
        state TEXT NOT NULL,
        finished INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_graph ON runs(graph_id);";

/// SQLite-backed store for graph definitions and run snapshots.
///
/// Both tables are upserted by primary key, so the latest write wins.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LoopflowError::Persistence(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LoopflowError::Persistence(e.to_string()))
    }

    /// Number of runs with a persisted snapshot.
    pub fn run_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as usize)
    }

    /// Ids of unfinished runs, i.e. runs abandoned by a previous process.
    pub fn unfinished_runs(&self) -> Result<Vec<RunId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT run_id FROM runs WHERE finished = 0 ORDER BY updated_at ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(RunId(row.map_err(db_err)?));
        }
        Ok(ids)
    }
}

impl RunStore for SqliteRunStore {
    fn save_graph(&self, record: &GraphRecord) -> BoxFuture<'_, Result<()>> {
        let graph_id = record.graph_id.0.clone();
        let payload = serde_json::to_string(record);

        Box::pin(async move {
            let payload = payload?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO graphs (graph_id, payload) VALUES (?1, ?2)",
                params![graph_id, payload],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn save_run(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>> {
        let run_id = record.run_id.0.clone();
        let graph_id = record.graph_id.0.clone();
        let state = serde_json::to_string(&record.state);
        let finished = record.finished;
        let updated_at = record.updated_at.to_rfc3339();

        Box::pin(async move {
            let state = state?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO runs (run_id, graph_id, state, finished, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, graph_id, state, finished, updated_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_graph(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<Option<GraphRecord>>> {
        let graph_id = graph_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM graphs WHERE graph_id = ?1",
                    params![graph_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match payload {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let run_id = run_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    "SELECT run_id, graph_id, state, finished, updated_at
                     FROM runs WHERE run_id = ?1",
                    params![run_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;

            let Some((run_id, graph_id, state, finished, ts_str)) = row else {
                return Ok(None);
            };

            Ok(Some(RunRecord {
                run_id: RunId(run_id),
                graph_id: GraphId(graph_id),
                state: serde_json::from_str(&state)?,
                finished,
                updated_at: DateTime::parse_from_rfc3339(&ts_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            }))
        })
    }
}

fn db_err(e: rusqlite::Error) -> LoopflowError {
    LoopflowError::Persistence(e.to_string())
}
