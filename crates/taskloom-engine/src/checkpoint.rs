use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use taskloom_core::error::{LoomError, Result};

use crate::graph::GraphState;

/// Version of the `state_json` layout. Bumped whenever `GraphState`
/// serialization changes incompatibly.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// The latest snapshot of one session.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub session_id: String,
    pub version: u32,
    pub state: GraphState,
    /// When the session was first checkpointed.
    pub created_at: DateTime<Utc>,
    /// When this snapshot was written.
    pub saved_at: DateTime<Utc>,
}

/// Listing entry for a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointInfo {
    pub session_id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

/// Persistent session checkpoint store backed by SQLite.
///
/// One row per session: saving overwrites the previous snapshot and keeps the
/// original creation time.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| LoomError::Database(format!("failed to open checkpoint store: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::init(conn)
    }

    /// Store that lives only as long as the process.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                 session_id TEXT PRIMARY KEY,
                 version INTEGER NOT NULL,
                 state_json TEXT NOT NULL,
                 created_at_ms INTEGER NOT NULL,
                 saved_at_ms INTEGER NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_saved_at ON checkpoints(saved_at_ms);",
        )
        .map_err(|e| LoomError::Database(format!("failed to initialize checkpoint schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LoomError::Database(e.to_string()))
    }

    /// Save a session snapshot, replacing any previous one.
    pub fn save(&self, session_id: &str, state: &GraphState) -> Result<()> {
        let state_json = serde_json::to_string(state)?;
        let now = Utc::now().timestamp_millis();

        self.conn()?
            .execute(
                "INSERT INTO checkpoints (session_id, version, state_json, created_at_ms, saved_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                     version = excluded.version,
                     state_json = excluded.state_json,
                     saved_at_ms = excluded.saved_at_ms",
                params![session_id, CHECKPOINT_SCHEMA_VERSION, state_json, now],
            )
            .map_err(|e| LoomError::Checkpoint(format!("failed to save checkpoint: {}", e)))?;
        Ok(())
    }

    /// Latest snapshot of a session's state.
    pub fn load(&self, session_id: &str) -> Result<Option<GraphState>> {
        Ok(self.load_checkpoint(session_id)?.map(|cp| cp.state))
    }

    /// Latest checkpoint record of a session.
    pub fn load_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT version, state_json, created_at_ms, saved_at_ms
                 FROM checkpoints WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((version, state_json, created_at_ms, saved_at_ms)) = row else {
            return Ok(None);
        };
        if version > CHECKPOINT_SCHEMA_VERSION {
            return Err(LoomError::Checkpoint(format!(
                "checkpoint for session {} has schema version {} (supported: {})",
                session_id, version, CHECKPOINT_SCHEMA_VERSION
            )));
        }
        let state: GraphState = serde_json::from_str(&state_json).map_err(|e| {
            LoomError::Checkpoint(format!("corrupt checkpoint for session {}: {}", session_id, e))
        })?;

        Ok(Some(Checkpoint {
            session_id: session_id.to_string(),
            version,
            state,
            created_at: from_millis(created_at_ms),
            saved_at: from_millis(saved_at_ms),
        }))
    }

    /// Delete a session's checkpoint. Returns whether one existed.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute(
                "DELETE FROM checkpoints WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    /// All stored checkpoints, most recently saved first.
    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, version, created_at_ms, saved_at_ms
                 FROM checkpoints ORDER BY saved_at_ms DESC, session_id",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok(CheckpointInfo {
                    session_id: row.get(0)?,
                    version: row.get(1)?,
                    created_at: from_millis(row.get(2)?),
                    saved_at: from_millis(row.get(3)?),
                })
            })
            .map_err(db_err)?;

        let infos = rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)?;
        Ok(infos)
    }

    /// Remove checkpoints saved at least `max_age` ago. Returns how many.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize> {
        self.cleanup_except(max_age, &HashSet::new())
    }

    /// Like [`cleanup`](Self::cleanup), but never removes the checkpoints of
    /// sessions in `keep`.
    pub fn cleanup_except(&self, max_age: Duration, keep: &HashSet<String>) -> Result<usize> {
        let age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(age_ms);

        if keep.is_empty() {
            return self
                .conn()?
                .execute(
                    "DELETE FROM checkpoints WHERE saved_at_ms <= ?1",
                    params![cutoff],
                )
                .map_err(db_err);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let stale: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT session_id FROM checkpoints WHERE saved_at_ms <= ?1")
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)?
        };

        let mut removed = 0;
        for session_id in stale.iter().filter(|id| !keep.contains(*id)) {
            removed += tx
                .execute(
                    "DELETE FROM checkpoints WHERE session_id = ?1",
                    params![session_id],
                )
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(removed)
    }
}

fn db_err(e: rusqlite::Error) -> LoomError {
    LoomError::Database(e.to_string())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
