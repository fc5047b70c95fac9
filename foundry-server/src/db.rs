//! SQLite persistence for the broker.
//!
//! Stores subtasks (with their queue position), ledger states, test metrics
//! and the submitted project structure so a restarted broker resumes with
//! the same queues and ledger.

use std::collections::HashMap;
use std::path::Path;

use foundry_sdk::protocol::{Metrics, Role, Subtask, TaskState};
use foundry_sdk::structure::ProjectStructure;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A persisted subtask row.
#[derive(Debug, Clone)]
pub struct SubtaskRow {
    pub subtask: Subtask,
    /// Still waiting in its role queue.
    pub queued: bool,
    /// Submission order; queues are rebuilt in ascending `seq`.
    pub seq: i64,
}

/// Everything needed to rebuild a broker's ledger.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub subtasks: Vec<SubtaskRow>,
    pub statuses: HashMap<String, TaskState>,
    pub metrics: HashMap<String, Metrics>,
    pub structure: Option<ProjectStructure>,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS subtasks (
                id       TEXT PRIMARY KEY,
                role     TEXT NOT NULL,
                filename TEXT NOT NULL,
                text     TEXT NOT NULL,
                code     TEXT,
                queued   INTEGER NOT NULL DEFAULT 1,
                seq      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_subtasks_queue
                ON subtasks(role, queued, seq);

            CREATE TABLE IF NOT EXISTS statuses (
                subtask_id TEXT PRIMARY KEY,
                status     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics (
                subtask_id   TEXT PRIMARY KEY,
                metrics_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS structure (
                id   INTEGER PRIMARY KEY CHECK (id = 1),
                json TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Subtasks ───────────────────────────────────────────────────────

    pub fn insert_subtask(&self, subtask: &Subtask, seq: i64) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO subtasks (id, role, filename, text, code, queued, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![
                subtask.id,
                subtask.role.as_str(),
                subtask.filename,
                subtask.text,
                subtask.code,
                seq,
            ],
        )?;
        Ok(())
    }

    /// Mark a subtask as pulled off its queue. The payload is no longer needed.
    pub fn dequeue_subtask(&self, id: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE subtasks SET queued = 0, code = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // ── Ledger ─────────────────────────────────────────────────────────

    pub fn save_status(&self, subtask_id: &str, status: &TaskState) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO statuses (subtask_id, status) VALUES (?1, ?2)
             ON CONFLICT(subtask_id) DO UPDATE SET status = excluded.status",
            params![subtask_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn save_metrics(&self, subtask_id: &str, metrics: &Metrics) -> SqlResult<()> {
        let json = serde_json::to_string(metrics).unwrap_or_else(|_| "{}".to_string());
        self.conn.execute(
            "INSERT INTO metrics (subtask_id, metrics_json) VALUES (?1, ?2)
             ON CONFLICT(subtask_id) DO UPDATE SET metrics_json = excluded.metrics_json",
            params![subtask_id, json],
        )?;
        Ok(())
    }

    pub fn save_structure(&self, structure: &ProjectStructure) -> SqlResult<()> {
        let json = serde_json::to_string(structure).unwrap_or_else(|_| "{}".to_string());
        self.conn.execute(
            "INSERT INTO structure (id, json) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET json = excluded.json",
            params![json],
        )?;
        Ok(())
    }

    /// Drop queues, ledger and metrics. The structure is kept.
    pub fn clear_ledger(&self) -> SqlResult<()> {
        self.conn.execute_batch(
            "DELETE FROM subtasks; DELETE FROM statuses; DELETE FROM metrics;",
        )?;
        Ok(())
    }

    // ── Restore ────────────────────────────────────────────────────────

    pub fn load(&self) -> SqlResult<Snapshot> {
        let mut snapshot = Snapshot::default();

        let mut stmt = self.conn.prepare(
            "SELECT id, role, filename, text, code, queued, seq FROM subtasks ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let role: String = row.get(1)?;
            Ok((
                role,
                SubtaskRow {
                    subtask: Subtask {
                        id: row.get(0)?,
                        role: Role::Executor,
                        filename: row.get(2)?,
                        text: row.get(3)?,
                        code: row.get(4)?,
                    },
                    queued: row.get::<_, i32>(5)? != 0,
                    seq: row.get(6)?,
                },
            ))
        })?;
        for row in rows {
            let (role, mut entry) = row?;
            match role.parse::<Role>() {
                Ok(role) => {
                    entry.subtask.role = role;
                    snapshot.subtasks.push(entry);
                }
                Err(e) => tracing::warn!("Skipping persisted subtask {}: {e}", entry.subtask.id),
            }
        }

        let mut stmt = self.conn.prepare("SELECT subtask_id, status FROM statuses")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (id, status) = row?;
            snapshot.statuses.insert(id, TaskState::from(status));
        }

        let mut stmt = self.conn.prepare("SELECT subtask_id, metrics_json FROM metrics")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (id, json) = row?;
            snapshot
                .metrics
                .insert(id, serde_json::from_str(&json).unwrap_or_default());
        }

        let structure: Option<String> = self
            .conn
            .query_row("SELECT json FROM structure WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        snapshot.structure = structure.and_then(|json| match serde_json::from_str(&json) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!("Ignoring unreadable persisted structure: {e}");
                None
            }
        });

        Ok(snapshot)
    }
}
