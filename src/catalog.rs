//! Progress catalog — the embedded store that owns all persistent state.
//!
//! Every planned unit of work, its state, and the CDC offsets live in a
//! small SQLite database under the working directory. Supervisors hold
//! task identities; all mutation goes through short transactions here, and
//! writes are durable on return (WAL journal, `synchronous=FULL`).
//!
//! Schema evolution is a version marker (`PRAGMA user_version`); on
//! mismatch the catalog is rebuilt empty and the run re-plans from a fresh
//! introspection. Resumability is guaranteed within a format version, not
//! across upgrades.
//!
//! # Concurrency
//!
//! One process, many worker tasks: the connection sits behind a mutex and
//! no caller holds it across network I/O. Claims are CAS updates
//! (`WHERE state = 'planned'`) so two workers can never own the same task.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, ShuttleError};
use crate::lsn::Lsn;
use crate::plan::{
    ConstraintKind, ConstraintTask, ExtensionTask, IndexTask, MatviewTask, ReplicaIdentity,
    SequenceTask, SplitStrategy, TablePart, TableTask, TaskState, WorkPlan,
};

/// Bumped whenever the schema below changes shape.
pub const CATALOG_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS shuttle_setup (
    id                INTEGER PRIMARY KEY CHECK (id = 1),
    catalog_version   INTEGER NOT NULL,
    system_identifier TEXT NOT NULL,
    timeline_id       INTEGER NOT NULL,
    snapshot          TEXT,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_step (
    step    TEXT PRIMARY KEY,
    done_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS table_task (
    oid                 INTEGER PRIMARY KEY,
    schema_name         TEXT NOT NULL,
    table_name          TEXT NOT NULL,
    bytes               INTEGER NOT NULL,
    reltuples           INTEGER NOT NULL,
    relpages            INTEGER NOT NULL,
    replica_identity    TEXT NOT NULL,
    identity_columns    TEXT NOT NULL DEFAULT '[]',
    is_partition_parent INTEGER NOT NULL,
    parent_oid          INTEGER,
    split_strategy      TEXT NOT NULL,
    part_key            TEXT,
    exclude_data        INTEGER NOT NULL,
    state               TEXT NOT NULL,
    attempts            INTEGER NOT NULL DEFAULT 0,
    bytes_transferred   INTEGER NOT NULL DEFAULT 0,
    rows_copied         INTEGER NOT NULL DEFAULT 0,
    started_at          TEXT,
    finished_at         TEXT,
    last_error          TEXT
);
CREATE INDEX IF NOT EXISTS idx_table_task_state ON table_task (state);

CREATE TABLE IF NOT EXISTS table_part (
    table_oid         INTEGER NOT NULL,
    part_num          INTEGER NOT NULL,
    total_parts       INTEGER NOT NULL,
    lower_bound       INTEGER NOT NULL,
    upper_bound       INTEGER,
    state             TEXT NOT NULL,
    attempts          INTEGER NOT NULL DEFAULT 0,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    rows_copied       INTEGER NOT NULL DEFAULT 0,
    started_at        TEXT,
    finished_at       TEXT,
    last_error        TEXT,
    PRIMARY KEY (table_oid, part_num)
);

CREATE TABLE IF NOT EXISTS index_task (
    oid              INTEGER PRIMARY KEY,
    table_oid        INTEGER NOT NULL,
    schema_name      TEXT NOT NULL,
    index_name       TEXT NOT NULL,
    definition       TEXT NOT NULL,
    is_unique        INTEGER NOT NULL,
    is_primary       INTEGER NOT NULL,
    backs_constraint TEXT,
    state            TEXT NOT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0,
    started_at       TEXT,
    finished_at      TEXT,
    last_error       TEXT
);
CREATE INDEX IF NOT EXISTS idx_index_task_table ON index_task (table_oid);

CREATE TABLE IF NOT EXISTS constraint_task (
    oid             INTEGER PRIMARY KEY,
    table_oid       INTEGER NOT NULL,
    constraint_name TEXT NOT NULL,
    definition      TEXT NOT NULL,
    kind            TEXT NOT NULL,
    index_oid       INTEGER,
    ref_table_oid   INTEGER,
    state           TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    started_at      TEXT,
    finished_at     TEXT,
    last_error      TEXT
);
CREATE INDEX IF NOT EXISTS idx_constraint_task_table ON constraint_task (table_oid);

CREATE TABLE IF NOT EXISTS sequence_task (
    oid           INTEGER PRIMARY KEY,
    schema_name   TEXT NOT NULL,
    sequence_name TEXT NOT NULL,
    last_value    INTEGER NOT NULL,
    is_called     INTEGER NOT NULL,
    state         TEXT NOT NULL,
    last_error    TEXT
);

CREATE TABLE IF NOT EXISTS extension_task (
    oid         INTEGER PRIMARY KEY,
    ext_name    TEXT NOT NULL,
    schema_name TEXT NOT NULL,
    version     TEXT NOT NULL,
    state       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS matview_task (
    oid          INTEGER PRIMARY KEY,
    schema_name  TEXT NOT NULL,
    matview_name TEXT NOT NULL,
    bytes        INTEGER NOT NULL,
    state        TEXT NOT NULL,
    last_error   TEXT
);

CREATE TABLE IF NOT EXISTS blob_state (
    id           INTEGER PRIMARY KEY CHECK (id = 1),
    last_oid     INTEGER NOT NULL DEFAULT 0,
    copied_count INTEGER NOT NULL DEFAULT 0,
    total_count  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS slot_state (
    slot_name        TEXT PRIMARY KEY,
    plugin           TEXT NOT NULL,
    consistent_point TEXT NOT NULL,
    write_lsn        TEXT NOT NULL,
    flush_lsn        TEXT NOT NULL,
    timeline_id      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sentinel (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    startpos      TEXT NOT NULL,
    endpos        TEXT,
    apply_enabled INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS apply_cursor (
    id                 INTEGER PRIMARY KEY CHECK (id = 1),
    applied_commit_lsn TEXT NOT NULL,
    written_lsn        TEXT NOT NULL,
    flushed_lsn        TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
"#;

const ALL_TABLES: &[&str] = &[
    "shuttle_setup",
    "run_step",
    "table_task",
    "table_part",
    "index_task",
    "constraint_task",
    "sequence_task",
    "extension_task",
    "matview_task",
    "blob_state",
    "slot_state",
    "sentinel",
    "apply_cursor",
];

/// Mutable progress attached to any task row.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: TaskState,
    pub attempts: u32,
    pub bytes_transferred: u64,
    pub rows_copied: u64,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_error: Option<String>,
}

/// The setup row written at plan time.
#[derive(Debug, Clone)]
pub struct SetupInfo {
    pub catalog_version: i32,
    pub system_identifier: String,
    pub timeline_id: i64,
    pub snapshot: Option<String>,
    pub created_at: String,
}

/// Persistent replication-slot state.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot_name: String,
    pub plugin: String,
    pub consistent_point: Lsn,
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub timeline_id: i64,
}

/// Operator-controlled CDC bounds.
#[derive(Debug, Clone, Default)]
pub struct Sentinel {
    pub startpos: Lsn,
    pub endpos: Option<Lsn>,
    pub apply_enabled: bool,
}

/// Apply-side progress. Invariant: `flushed <= written <= applied_commit`.
#[derive(Debug, Clone, Default)]
pub struct ApplyCursor {
    pub applied_commit_lsn: Lsn,
    pub written_lsn: Lsn,
    pub flushed_lsn: Lsn,
}

/// Handle on the embedded store. Cheap to share behind an `Arc`.
pub struct Catalog {
    conn: Mutex<Connection>,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

impl Catalog {
    /// Open (and if needed create) the catalog at `path`. Returns the
    /// catalog and whether an incompatible on-disk version was discarded.
    pub fn open(path: &Path) -> Result<(Catalog, bool)> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory catalog for tests and dry runs.
    pub fn open_in_memory() -> Result<Catalog> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::init(conn)?.0)
    }

    fn init(conn: Connection) -> Result<(Catalog, bool)> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA synchronous=FULL;\n\
             PRAGMA foreign_keys=ON;",
        )?;

        let found: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        let mut rebuilt = false;
        if found != 0 && found != CATALOG_VERSION {
            for table in ALL_TABLES {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
            }
            rebuilt = true;
        }
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(&format!("PRAGMA user_version = {CATALOG_VERSION}"))?;

        Ok((
            Catalog {
                conn: Mutex::new(conn),
            },
            rebuilt,
        ))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ShuttleError::Catalog("catalog lock poisoned".into()))
    }

    // ── Plan lifecycle ─────────────────────────────────────────────────

    pub fn plan_exists(&self) -> Result<bool> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT count(*) FROM shuttle_setup", [], |r| r.get(0))?;
        Ok(n > 0)
    }

    pub fn setup(&self) -> Result<Option<SetupInfo>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT catalog_version, system_identifier, timeline_id, snapshot, created_at \
             FROM shuttle_setup WHERE id = 1",
            [],
            |r| {
                Ok(SetupInfo {
                    catalog_version: r.get(0)?,
                    system_identifier: r.get(1)?,
                    timeline_id: r.get(2)?,
                    snapshot: r.get(3)?,
                    created_at: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Discard the plan, its tasks and the run-step markers, keeping the
    /// file. Used when a fresh (non-resume) run starts over. CDC state
    /// (slot, sentinel, cursor) is owned by `stream setup`/`cleanup` and
    /// survives a replan.
    pub fn plan_reset(&self) -> Result<()> {
        let conn = self.lock()?;
        for table in [
            "shuttle_setup",
            "run_step",
            "table_task",
            "table_part",
            "index_task",
            "constraint_task",
            "sequence_task",
            "extension_task",
            "matview_task",
            "blob_state",
        ] {
            conn.execute_batch(&format!("DELETE FROM {table}"))?;
        }
        Ok(())
    }

    /// Forget all CDC state: slot rows, sentinel and apply cursor. Called
    /// by `stream cleanup` after the slot is dropped on the source.
    pub fn stream_state_reset(&self) -> Result<()> {
        let conn = self.lock()?;
        for table in ["slot_state", "sentinel", "apply_cursor"] {
            conn.execute_batch(&format!("DELETE FROM {table}"))?;
        }
        Ok(())
    }

    /// Persist a freshly introspected plan. Fails if a plan already exists;
    /// callers decide between `plan_reset` and `--resume`.
    pub fn plan_init(&self, plan: &WorkPlan) -> Result<()> {
        plan.validate()?;
        let mut guard = self.lock()?;
        let tx = guard.transaction()?;

        let existing: i64 = tx.query_row("SELECT count(*) FROM shuttle_setup", [], |r| r.get(0))?;
        if existing > 0 {
            return Err(ShuttleError::Catalog(
                "a work plan already exists; use --resume or reset the working directory".into(),
            ));
        }

        tx.execute(
            "INSERT INTO shuttle_setup \
             (id, catalog_version, system_identifier, timeline_id, snapshot, created_at) \
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                CATALOG_VERSION,
                plan.system_identifier,
                plan.timeline_id,
                plan.snapshot,
                now()
            ],
        )?;

        for t in &plan.tables {
            // Partition parents and data-excluded tables never claim a
            // worker; they are planned as skipped.
            let state = if t.copies_rows() {
                TaskState::Planned
            } else {
                TaskState::Skipped
            };
            let identity_json = serde_json::to_string(&t.identity_columns)
                .map_err(|e| ShuttleError::Catalog(e.to_string()))?;
            tx.execute(
                "INSERT INTO table_task \
                 (oid, schema_name, table_name, bytes, reltuples, relpages, replica_identity, \
                  identity_columns, is_partition_parent, parent_oid, split_strategy, part_key, \
                  exclude_data, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    t.oid,
                    t.schema,
                    t.name,
                    t.bytes as i64,
                    t.reltuples,
                    t.relpages,
                    t.replica_identity.as_char().to_string(),
                    identity_json,
                    t.is_partition_parent,
                    t.parent_oid,
                    t.split.as_str(),
                    t.part_key,
                    t.exclude_data,
                    state.as_str()
                ],
            )?;
        }

        for p in &plan.parts {
            tx.execute(
                "INSERT INTO table_part \
                 (table_oid, part_num, total_parts, lower_bound, upper_bound, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    p.table_oid,
                    p.part_num,
                    p.total_parts,
                    p.lower,
                    p.upper,
                    TaskState::Planned.as_str()
                ],
            )?;
        }

        for ix in &plan.indexes {
            tx.execute(
                "INSERT INTO index_task \
                 (oid, table_oid, schema_name, index_name, definition, is_unique, is_primary, \
                  backs_constraint, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    ix.oid,
                    ix.table_oid,
                    ix.schema,
                    ix.name,
                    ix.definition,
                    ix.is_unique,
                    ix.is_primary,
                    ix.backs_constraint,
                    TaskState::Planned.as_str()
                ],
            )?;
        }

        for c in &plan.constraints {
            tx.execute(
                "INSERT INTO constraint_task \
                 (oid, table_oid, constraint_name, definition, kind, index_oid, ref_table_oid, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    c.oid,
                    c.table_oid,
                    c.name,
                    c.definition,
                    c.kind.as_str(),
                    c.index_oid,
                    c.ref_table_oid,
                    TaskState::Planned.as_str()
                ],
            )?;
        }

        for s in &plan.sequences {
            tx.execute(
                "INSERT INTO sequence_task \
                 (oid, schema_name, sequence_name, last_value, is_called, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    s.oid,
                    s.schema,
                    s.name,
                    s.last_value,
                    s.is_called,
                    TaskState::Planned.as_str()
                ],
            )?;
        }

        for e in &plan.extensions {
            tx.execute(
                "INSERT INTO extension_task (oid, ext_name, schema_name, version, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![e.oid, e.name, e.schema, e.version, TaskState::Planned.as_str()],
            )?;
        }

        for m in &plan.matviews {
            tx.execute(
                "INSERT INTO matview_task (oid, schema_name, matview_name, bytes, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    m.oid,
                    m.schema,
                    m.name,
                    m.bytes as i64,
                    TaskState::Planned.as_str()
                ],
            )?;
        }

        tx.execute(
            "INSERT INTO blob_state (id, last_oid, copied_count, total_count) \
             VALUES (1, 0, 0, ?1)",
            params![plan.large_object_count],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Reconstruct the immutable plan from the catalog (resume path).
    pub fn load_plan(&self) -> Result<WorkPlan> {
        let setup = self
            .setup()?
            .ok_or_else(|| ShuttleError::Catalog("no work plan in catalog".into()))?;
        let conn = self.lock()?;

        let mut tables = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT oid, schema_name, table_name, bytes, reltuples, relpages, \
                 replica_identity, identity_columns, is_partition_parent, parent_oid, \
                 split_strategy, part_key, exclude_data FROM table_task ORDER BY oid",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(TableTask {
                    oid: r.get(0)?,
                    schema: r.get(1)?,
                    name: r.get(2)?,
                    bytes: r.get::<_, i64>(3)? as u64,
                    reltuples: r.get(4)?,
                    relpages: r.get(5)?,
                    replica_identity: ReplicaIdentity::from_char(
                        r.get::<_, String>(6)?.chars().next().unwrap_or('d'),
                    ),
                    identity_columns: serde_json::from_str(&r.get::<_, String>(7)?)
                        .unwrap_or_default(),
                    is_partition_parent: r.get(8)?,
                    parent_oid: r.get(9)?,
                    split: SplitStrategy::parse(&r.get::<_, String>(10)?)
                        .unwrap_or(SplitStrategy::None),
                    part_key: r.get(11)?,
                    exclude_data: r.get(12)?,
                })
            })?;
            for row in rows {
                tables.push(row?);
            }
        }

        let mut parts = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT table_oid, part_num, total_parts, lower_bound, upper_bound \
                 FROM table_part ORDER BY table_oid, part_num",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(TablePart {
                    table_oid: r.get(0)?,
                    part_num: r.get(1)?,
                    total_parts: r.get(2)?,
                    lower: r.get(3)?,
                    upper: r.get(4)?,
                })
            })?;
            for row in rows {
                parts.push(row?);
            }
        }

        let mut indexes = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT oid, table_oid, schema_name, index_name, definition, is_unique, \
                 is_primary, backs_constraint FROM index_task ORDER BY oid",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(IndexTask {
                    oid: r.get(0)?,
                    table_oid: r.get(1)?,
                    schema: r.get(2)?,
                    name: r.get(3)?,
                    definition: r.get(4)?,
                    is_unique: r.get(5)?,
                    is_primary: r.get(6)?,
                    backs_constraint: r.get(7)?,
                })
            })?;
            for row in rows {
                indexes.push(row?);
            }
        }

        let mut constraints = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT oid, table_oid, constraint_name, definition, kind, index_oid, \
                 ref_table_oid FROM constraint_task ORDER BY oid",
            )?;
            let rows = stmt.query_map([], |r| {
                let kind = ConstraintKind::parse(&r.get::<_, String>(4)?)
                    .unwrap_or(ConstraintKind::ForeignKey);
                Ok(ConstraintTask {
                    oid: r.get(0)?,
                    table_oid: r.get(1)?,
                    name: r.get(2)?,
                    definition: r.get(3)?,
                    kind,
                    index_oid: r.get(5)?,
                    ref_table_oid: r.get(6)?,
                })
            })?;
            for row in rows {
                constraints.push(row?);
            }
        }

        let mut sequences = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT oid, schema_name, sequence_name, last_value, is_called \
                 FROM sequence_task ORDER BY oid",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(SequenceTask {
                    oid: r.get(0)?,
                    schema: r.get(1)?,
                    name: r.get(2)?,
                    last_value: r.get(3)?,
                    is_called: r.get(4)?,
                })
            })?;
            for row in rows {
                sequences.push(row?);
            }
        }

        let mut extensions = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT oid, ext_name, schema_name, version FROM extension_task ORDER BY oid",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(ExtensionTask {
                    oid: r.get(0)?,
                    name: r.get(1)?,
                    schema: r.get(2)?,
                    version: r.get(3)?,
                })
            })?;
            for row in rows {
                extensions.push(row?);
            }
        }

        let mut matviews = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT oid, schema_name, matview_name, bytes FROM matview_task ORDER BY oid",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(MatviewTask {
                    oid: r.get(0)?,
                    schema: r.get(1)?,
                    name: r.get(2)?,
                    bytes: r.get::<_, i64>(3)? as u64,
                })
            })?;
            for row in rows {
                matviews.push(row?);
            }
        }

        let large_object_count: i64 = conn
            .query_row("SELECT total_count FROM blob_state WHERE id = 1", [], |r| {
                r.get(0)
            })
            .optional()?
            .unwrap_or(0);

        Ok(WorkPlan {
            system_identifier: setup.system_identifier,
            timeline_id: setup.timeline_id,
            snapshot: setup.snapshot,
            tables,
            parts,
            indexes,
            constraints,
            sequences,
            extensions,
            matviews,
            large_object_count,
        })
    }

    // ── Claims and state transitions ───────────────────────────────────

    fn claim(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<bool> {
        let conn = self.lock()?;
        Ok(conn.execute(sql, params)? == 1)
    }

    /// Atomic planned → in-progress. Returns false if another worker (or a
    /// previous run) already owns or finished the task.
    pub fn claim_table(&self, oid: u32) -> Result<bool> {
        self.claim(
            "UPDATE table_task SET state = 'in-progress', attempts = attempts + 1, \
             started_at = ?2, last_error = NULL WHERE oid = ?1 AND state = 'planned'",
            params![oid, now()],
        )
    }

    pub fn claim_part(&self, oid: u32, part_num: u32) -> Result<bool> {
        self.claim(
            "UPDATE table_part SET state = 'in-progress', attempts = attempts + 1, \
             started_at = ?3, last_error = NULL \
             WHERE table_oid = ?1 AND part_num = ?2 AND state = 'planned'",
            params![oid, part_num, now()],
        )
    }

    pub fn claim_index(&self, oid: u32) -> Result<bool> {
        self.claim(
            "UPDATE index_task SET state = 'in-progress', attempts = attempts + 1, \
             started_at = ?2, last_error = NULL WHERE oid = ?1 AND state = 'planned'",
            params![oid, now()],
        )
    }

    pub fn claim_constraint(&self, oid: u32) -> Result<bool> {
        self.claim(
            "UPDATE constraint_task SET state = 'in-progress', attempts = attempts + 1, \
             started_at = ?2, last_error = NULL WHERE oid = ?1 AND state = 'planned'",
            params![oid, now()],
        )
    }

    pub fn claim_sequence(&self, oid: u32) -> Result<bool> {
        self.claim(
            "UPDATE sequence_task SET state = 'in-progress' WHERE oid = ?1 AND state = 'planned'",
            params![oid],
        )
    }

    pub fn claim_matview(&self, oid: u32) -> Result<bool> {
        self.claim(
            "UPDATE matview_task SET state = 'in-progress' WHERE oid = ?1 AND state = 'planned'",
            params![oid],
        )
    }

    /// Table finished: record final counters and timestamps.
    pub fn table_done(&self, oid: u32, bytes: u64, rows: u64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE table_task SET state = 'copied', bytes_transferred = ?2, \
             rows_copied = ?3, finished_at = ?4 WHERE oid = ?1",
            params![oid, bytes as i64, rows as i64, now()],
        )?;
        Ok(())
    }

    /// Transient failure: return the task to the queue for another attempt.
    pub fn table_requeue(&self, oid: u32, err: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE table_task SET state = 'planned', last_error = ?2 WHERE oid = ?1",
            params![oid, err],
        )?;
        Ok(())
    }

    pub fn table_failed(&self, oid: u32, err: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE table_task SET state = 'failed', last_error = ?2, finished_at = ?3 \
             WHERE oid = ?1",
            params![oid, err, now()],
        )?;
        Ok(())
    }

    pub fn part_done(&self, oid: u32, part_num: u32, bytes: u64, rows: u64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE table_part SET state = 'copied', bytes_transferred = ?3, \
             rows_copied = ?4, finished_at = ?5 WHERE table_oid = ?1 AND part_num = ?2",
            params![oid, part_num, bytes as i64, rows as i64, now()],
        )?;
        Ok(())
    }

    pub fn part_requeue(&self, oid: u32, part_num: u32, err: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE table_part SET state = 'planned', last_error = ?3 \
             WHERE table_oid = ?1 AND part_num = ?2",
            params![oid, part_num, err],
        )?;
        Ok(())
    }

    pub fn part_failed(&self, oid: u32, part_num: u32, err: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE table_part SET state = 'failed', last_error = ?3, finished_at = ?4 \
             WHERE table_oid = ?1 AND part_num = ?2",
            params![oid, part_num, err, now()],
        )?;
        Ok(())
    }

    /// If every part of a split table is copied, promote the table itself
    /// to copied with summed counters. Returns true when promotion
    /// happened (exactly once: the table must still be in-progress).
    pub fn finish_table_from_parts(&self, oid: u32) -> Result<bool> {
        let mut guard = self.lock()?;
        let tx = guard.transaction()?;
        let (remaining, failed): (i64, i64) = tx.query_row(
            "SELECT \
               count(*) FILTER (WHERE state NOT IN ('copied','failed')), \
               count(*) FILTER (WHERE state = 'failed') \
             FROM table_part WHERE table_oid = ?1",
            params![oid],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        if remaining > 0 || failed > 0 {
            return Ok(false);
        }
        let (bytes, rows): (i64, i64) = tx.query_row(
            "SELECT coalesce(sum(bytes_transferred), 0), coalesce(sum(rows_copied), 0) \
             FROM table_part WHERE table_oid = ?1",
            params![oid],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let changed = tx.execute(
            "UPDATE table_task SET state = 'copied', bytes_transferred = ?2, \
             rows_copied = ?3, finished_at = ?4 WHERE oid = ?1 AND state = 'in-progress'",
            params![oid, bytes, rows, now()],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    /// Mark the table itself in-progress when its first part is claimed.
    /// CAS so only the first claimer flips it.
    pub fn table_start_parts(&self, oid: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE table_task SET state = 'in-progress', started_at = ?2 \
             WHERE oid = ?1 AND state = 'planned'",
            params![oid, now()],
        )?;
        Ok(())
    }

    fn simple_done(&self, table: &str, oid: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!("UPDATE {table} SET state = 'copied', finished_at = ?2 WHERE oid = ?1"),
            params![oid, now()],
        )?;
        Ok(())
    }

    fn simple_requeue(&self, table: &str, oid: u32, err: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!("UPDATE {table} SET state = 'planned', last_error = ?2 WHERE oid = ?1"),
            params![oid, err],
        )?;
        Ok(())
    }

    fn simple_failed(&self, table: &str, oid: u32, err: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "UPDATE {table} SET state = 'failed', last_error = ?2, finished_at = ?3 \
                 WHERE oid = ?1"
            ),
            params![oid, err, now()],
        )?;
        Ok(())
    }

    pub fn index_done(&self, oid: u32) -> Result<()> {
        self.simple_done("index_task", oid)
    }

    pub fn index_requeue(&self, oid: u32, err: &str) -> Result<()> {
        self.simple_requeue("index_task", oid, err)
    }

    pub fn index_failed(&self, oid: u32, err: &str) -> Result<()> {
        self.simple_failed("index_task", oid, err)
    }

    pub fn constraint_done(&self, oid: u32) -> Result<()> {
        self.simple_done("constraint_task", oid)
    }

    pub fn constraint_requeue(&self, oid: u32, err: &str) -> Result<()> {
        self.simple_requeue("constraint_task", oid, err)
    }

    pub fn constraint_failed(&self, oid: u32, err: &str) -> Result<()> {
        self.simple_failed("constraint_task", oid, err)
    }

    pub fn sequence_done(&self, oid: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sequence_task SET state = 'copied' WHERE oid = ?1",
            params![oid],
        )?;
        Ok(())
    }

    pub fn sequence_failed(&self, oid: u32, err: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sequence_task SET state = 'failed', last_error = ?2 WHERE oid = ?1",
            params![oid, err],
        )?;
        Ok(())
    }

    pub fn matview_done(&self, oid: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE matview_task SET state = 'copied' WHERE oid = ?1",
            params![oid],
        )?;
        Ok(())
    }

    pub fn matview_failed(&self, oid: u32, err: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE matview_task SET state = 'failed', last_error = ?2 WHERE oid = ?1",
            params![oid, err],
        )?;
        Ok(())
    }

    // ── Queries used by the supervisors ────────────────────────────────

    pub fn table_status(&self, oid: u32) -> Result<Option<TaskStatus>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT state, attempts, bytes_transferred, rows_copied, started_at, finished_at, \
             last_error FROM table_task WHERE oid = ?1",
            params![oid],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, u32>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?
        .map(
            |(state, attempts, bytes, rows, started_at, finished_at, last_error)| {
                Ok(TaskStatus {
                    state: TaskState::parse(&state)?,
                    attempts,
                    bytes_transferred: bytes as u64,
                    rows_copied: rows as u64,
                    started_at,
                    finished_at,
                    last_error,
                })
            },
        )
        .transpose()
    }

    /// Whether an index task finished successfully; constraint promotion
    /// depends on it.
    pub fn index_state_is_copied(&self, oid: u32) -> Result<bool> {
        let conn = self.lock()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM index_task WHERE oid = ?1",
                params![oid],
                |r| r.get(0),
            )
            .optional()?;
        Ok(state.as_deref() == Some("copied"))
    }

    /// Current state of one split range.
    pub fn part_status(&self, oid: u32, part_num: u32) -> Result<Option<TaskState>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT state FROM table_part WHERE table_oid = ?1 AND part_num = ?2",
            params![oid, part_num],
            |r| r.get::<_, String>(0),
        )
        .optional()?
        .map(|s| TaskState::parse(&s))
        .transpose()
    }

    /// Whether every table reached a terminal state without failure.
    pub fn all_tables_copied(&self) -> Result<bool> {
        let conn = self.lock()?;
        let outstanding: i64 = conn.query_row(
            "SELECT count(*) FROM table_task WHERE state NOT IN ('copied', 'skipped')",
            [],
            |r| r.get(0),
        )?;
        Ok(outstanding == 0)
    }

    /// FK constraints whose endpoints are both safely loaded and that are
    /// still unclaimed.
    pub fn fk_constraints_ready(&self) -> Result<Vec<u32>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.oid FROM constraint_task c \
             JOIN table_task t ON t.oid = c.table_oid \
             LEFT JOIN table_task r ON r.oid = c.ref_table_oid \
             WHERE c.kind = 'foreign-key' AND c.state = 'planned' \
               AND t.state IN ('copied', 'skipped') \
               AND (c.ref_table_oid IS NULL OR r.state IN ('copied', 'skipped')) \
             ORDER BY c.oid",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Flip interrupted work back to planned. Called once when a resumed
    /// run opens the catalog; the previous process is gone, so nothing is
    /// actually in progress.
    ///
    /// A split table with a part caught mid-copy is reset wholesale: a
    /// crashed part may have committed rows the catalog never heard about,
    /// so the only safe resume is truncate-and-recopy of that table.
    pub fn recover(&self) -> Result<u64> {
        let mut guard = self.lock()?;
        let tx = guard.transaction()?;
        let mut n = 0usize;

        n += tx.execute(
            "UPDATE table_part SET state = 'planned', bytes_transferred = 0, rows_copied = 0 \
             WHERE table_oid IN \
               (SELECT DISTINCT table_oid FROM table_part WHERE state = 'in-progress')",
            [],
        )?;
        tx.execute(
            "UPDATE table_task SET state = 'planned', bytes_transferred = 0, rows_copied = 0 \
             WHERE oid IN (SELECT DISTINCT table_oid FROM table_part WHERE state = 'planned') \
               AND state = 'in-progress'",
            [],
        )?;

        // A crash between the last part finishing and the table promotion
        // leaves every part copied while the table is still in-progress;
        // promote it here so the resumed run sees it as done.
        tx.execute(
            "UPDATE table_task SET state = 'copied', \
               bytes_transferred = (SELECT coalesce(sum(bytes_transferred), 0) \
                                    FROM table_part WHERE table_oid = table_task.oid), \
               rows_copied = (SELECT coalesce(sum(rows_copied), 0) \
                              FROM table_part WHERE table_oid = table_task.oid), \
               finished_at = ?1 \
             WHERE state = 'in-progress' \
               AND oid IN (SELECT table_oid FROM table_part) \
               AND NOT EXISTS (SELECT 1 FROM table_part p \
                               WHERE p.table_oid = table_task.oid AND p.state <> 'copied')",
            params![now()],
        )?;

        for table in [
            "table_task",
            "table_part",
            "index_task",
            "constraint_task",
            "sequence_task",
            "matview_task",
        ] {
            n += tx.execute(
                &format!("UPDATE {table} SET state = 'planned' WHERE state = 'in-progress'"),
                [],
            )?;
        }
        tx.commit()?;
        Ok(n as u64)
    }

    /// Whether every part of a split table is still untouched. Decides if
    /// the table gets truncated before its parts are queued.
    pub fn parts_all_planned(&self, oid: u32) -> Result<bool> {
        let conn = self.lock()?;
        let other: i64 = conn.query_row(
            "SELECT count(*) FROM table_part WHERE table_oid = ?1 AND \
               (state <> 'planned' OR bytes_transferred > 0)",
            params![oid],
            |r| r.get(0),
        )?;
        Ok(other == 0)
    }

    /// Leaf partitions of `parent_oid` that have not reached a terminal
    /// state yet. Zero means the parent's indexes can be built.
    pub fn partition_children_outstanding(&self, parent_oid: u32) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT count(*) FROM table_task \
             WHERE parent_oid = ?1 AND state NOT IN ('copied', 'skipped')",
            params![parent_oid],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    /// `(kind, qualified name, attempts, error)` for every failed task.
    pub fn failed_tasks(&self) -> Result<Vec<(String, String, u32, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT 'table', schema_name || '.' || table_name, attempts, \
                    coalesce(last_error, '') FROM table_task WHERE state = 'failed' \
             UNION ALL \
             SELECT 'index', schema_name || '.' || index_name, attempts, \
                    coalesce(last_error, '') FROM index_task WHERE state = 'failed' \
             UNION ALL \
             SELECT 'constraint', constraint_name, attempts, coalesce(last_error, '') \
             FROM constraint_task WHERE state = 'failed' \
             UNION ALL \
             SELECT 'sequence', schema_name || '.' || sequence_name, 1, \
                    coalesce(last_error, '') FROM sequence_task WHERE state = 'failed' \
             UNION ALL \
             SELECT 'matview', schema_name || '.' || matview_name, 1, \
                    coalesce(last_error, '') FROM matview_task WHERE state = 'failed'",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// `(kind, state, count)` summary used by `list progress`.
    pub fn progress_counts(&self) -> Result<Vec<(String, String, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT 'table', state, count(*) FROM table_task GROUP BY state \
             UNION ALL SELECT 'index', state, count(*) FROM index_task GROUP BY state \
             UNION ALL SELECT 'constraint', state, count(*) FROM constraint_task GROUP BY state \
             UNION ALL SELECT 'sequence', state, count(*) FROM sequence_task GROUP BY state \
             UNION ALL SELECT 'matview', state, count(*) FROM matview_task GROUP BY state",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Total `(bytes, rows)` moved by copied tables.
    pub fn copy_totals(&self) -> Result<(u64, u64)> {
        let conn = self.lock()?;
        let (bytes, rows): (i64, i64) = conn.query_row(
            "SELECT coalesce(sum(bytes_transferred), 0), coalesce(sum(rows_copied), 0) \
             FROM table_task WHERE state = 'copied'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok((bytes as u64, rows as u64))
    }

    // ── Run steps ──────────────────────────────────────────────────────

    pub fn step_done(&self, step: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM run_step WHERE step = ?1",
            params![step],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn step_mark(&self, step: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO run_step (step, done_at) VALUES (?1, ?2)",
            params![step, now()],
        )?;
        Ok(())
    }

    // ── Blob cursor ────────────────────────────────────────────────────

    /// Highest successfully copied large-object OID.
    pub fn blob_cursor(&self) -> Result<u32> {
        let conn = self.lock()?;
        conn.query_row("SELECT last_oid FROM blob_state WHERE id = 1", [], |r| {
            r.get(0)
        })
        .optional()
        .map(|v| v.unwrap_or(0))
        .map_err(Into::into)
    }

    /// Advance the blob cursor after a batch lands.
    pub fn blob_advance(&self, last_oid: u32, copied: u64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO blob_state (id, last_oid, copied_count, total_count) \
             VALUES (1, ?1, ?2, 0) \
             ON CONFLICT (id) DO UPDATE SET \
               last_oid = max(last_oid, excluded.last_oid), \
               copied_count = copied_count + excluded.copied_count",
            params![last_oid, copied as i64],
        )?;
        Ok(())
    }

    pub fn blob_counts(&self) -> Result<(i64, i64)> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT copied_count, total_count FROM blob_state WHERE id = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map(|v| v.unwrap_or((0, 0)))
        .map_err(Into::into)
    }

    // ── Slot state, sentinel, apply cursor ─────────────────────────────

    pub fn slot_get(&self, slot_name: &str) -> Result<Option<SlotState>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT slot_name, plugin, consistent_point, write_lsn, flush_lsn, timeline_id \
             FROM slot_state WHERE slot_name = ?1",
            params![slot_name],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?
        .map(|(slot_name, plugin, consistent, write, flush, timeline_id)| {
            Ok(SlotState {
                slot_name,
                plugin,
                consistent_point: consistent.parse()?,
                write_lsn: write.parse()?,
                flush_lsn: flush.parse()?,
                timeline_id,
            })
        })
        .transpose()
    }

    pub fn slot_put(&self, slot: &SlotState) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO slot_state \
             (slot_name, plugin, consistent_point, write_lsn, flush_lsn, timeline_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (slot_name) DO UPDATE SET \
               plugin = excluded.plugin, \
               consistent_point = excluded.consistent_point, \
               write_lsn = excluded.write_lsn, \
               flush_lsn = excluded.flush_lsn, \
               timeline_id = excluded.timeline_id",
            params![
                slot.slot_name,
                slot.plugin,
                slot.consistent_point.to_string(),
                slot.write_lsn.to_string(),
                slot.flush_lsn.to_string(),
                slot.timeline_id
            ],
        )?;
        Ok(())
    }

    pub fn slot_update_positions(&self, slot_name: &str, write: Lsn, flush: Lsn) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE slot_state SET write_lsn = ?2, flush_lsn = ?3 WHERE slot_name = ?1",
            params![slot_name, write.to_string(), flush.to_string()],
        )?;
        Ok(())
    }

    pub fn slot_delete(&self, slot_name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM slot_state WHERE slot_name = ?1", params![slot_name])?;
        Ok(())
    }

    pub fn sentinel_get(&self) -> Result<Option<Sentinel>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT startpos, endpos, apply_enabled FROM sentinel WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, bool>(2)?,
                ))
            },
        )
        .optional()?
        .map(|(startpos, endpos, apply_enabled)| {
            Ok(Sentinel {
                startpos: startpos.parse()?,
                endpos: endpos.map(|e| e.parse()).transpose()?,
                apply_enabled,
            })
        })
        .transpose()
    }

    pub fn sentinel_put(&self, s: &Sentinel) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sentinel (id, startpos, endpos, apply_enabled) VALUES (1, ?1, ?2, ?3) \
             ON CONFLICT (id) DO UPDATE SET \
               startpos = excluded.startpos, \
               endpos = excluded.endpos, \
               apply_enabled = excluded.apply_enabled",
            params![
                s.startpos.to_string(),
                s.endpos.map(|e| e.to_string()),
                s.apply_enabled
            ],
        )?;
        Ok(())
    }

    pub fn cursor_read(&self) -> Result<ApplyCursor> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT applied_commit_lsn, written_lsn, flushed_lsn FROM apply_cursor WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?
        .map(|(applied, written, flushed)| {
            Ok(ApplyCursor {
                applied_commit_lsn: applied.parse()?,
                written_lsn: written.parse()?,
                flushed_lsn: flushed.parse()?,
            })
        })
        .transpose()
        .map(|c| c.unwrap_or_default())
    }

    /// Persist the apply cursor. The applied commit LSN never moves
    /// backwards, whatever the caller hands in. Textual `X/Y` LSNs do not
    /// compare numerically in SQL, so the clamp happens here.
    pub fn cursor_write(&self, cursor: &ApplyCursor) -> Result<()> {
        let mut guard = self.lock()?;
        let tx = guard.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT applied_commit_lsn FROM apply_cursor WHERE id = 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        let mut applied = cursor.applied_commit_lsn;
        if let Some(existing) = current {
            let existing: Lsn = existing.parse()?;
            applied = applied.max(existing);
        }
        tx.execute(
            "INSERT INTO apply_cursor (id, applied_commit_lsn, written_lsn, flushed_lsn, updated_at) \
             VALUES (1, ?1, ?2, ?3, ?4) \
             ON CONFLICT (id) DO UPDATE SET \
               applied_commit_lsn = excluded.applied_commit_lsn, \
               written_lsn = excluded.written_lsn, \
               flushed_lsn = excluded.flushed_lsn, \
               updated_at = excluded.updated_at",
            params![
                applied.to_string(),
                cursor.written_lsn.to_string(),
                cursor.flushed_lsn.to_string(),
                now()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan;

    fn sample_plan() -> WorkPlan {
        let mut tables = vec![
            TableTask {
                oid: 16384,
                schema: "public".into(),
                name: "a".into(),
                bytes: 8192,
                reltuples: 100,
                relpages: 1,
                replica_identity: ReplicaIdentity::Default,
                identity_columns: vec!["id".into()],
                is_partition_parent: false,
                parent_oid: None,
                split: SplitStrategy::None,
                part_key: None,
                exclude_data: false,
            },
            TableTask {
                oid: 16390,
                schema: "public".into(),
                name: "b".into(),
                bytes: 4096,
                reltuples: 50,
                relpages: 1,
                replica_identity: ReplicaIdentity::Default,
                identity_columns: vec!["id".into()],
                is_partition_parent: false,
                parent_oid: None,
                split: SplitStrategy::None,
                part_key: None,
                exclude_data: false,
            },
        ];
        plan::largest_first(&mut tables);
        WorkPlan {
            system_identifier: "7000000000000000001".into(),
            timeline_id: 1,
            snapshot: Some("00000003-00000002-1".into()),
            tables,
            parts: vec![],
            indexes: vec![IndexTask {
                oid: 16400,
                table_oid: 16384,
                schema: "public".into(),
                name: "a_pkey".into(),
                definition: "CREATE UNIQUE INDEX a_pkey ON public.a USING btree (id)".into(),
                is_unique: true,
                is_primary: true,
                backs_constraint: Some("a_pkey".into()),
            }],
            constraints: vec![ConstraintTask {
                oid: 16401,
                table_oid: 16390,
                name: "b_a_fkey".into(),
                definition: "FOREIGN KEY (a_id) REFERENCES public.a(id)".into(),
                kind: ConstraintKind::ForeignKey,
                index_oid: None,
                ref_table_oid: Some(16384),
            }],
            sequences: vec![],
            extensions: vec![],
            matviews: vec![],
            large_object_count: 3,
        }
    }

    #[test]
    fn test_plan_init_and_load_round_trip() {
        let cat = Catalog::open_in_memory().unwrap();
        assert!(!cat.plan_exists().unwrap());
        cat.plan_init(&sample_plan()).unwrap();
        assert!(cat.plan_exists().unwrap());

        let plan = cat.load_plan().unwrap();
        assert_eq!(plan.tables.len(), 2);
        assert_eq!(plan.indexes.len(), 1);
        assert_eq!(plan.constraints.len(), 1);
        assert_eq!(plan.large_object_count, 3);
        assert_eq!(plan.snapshot.as_deref(), Some("00000003-00000002-1"));

        // second init is rejected
        assert!(cat.plan_init(&sample_plan()).is_err());
        // but reset + init works
        cat.plan_reset().unwrap();
        cat.plan_init(&sample_plan()).unwrap();
    }

    #[test]
    fn test_claim_is_exactly_once() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.plan_init(&sample_plan()).unwrap();

        assert!(cat.claim_table(16384).unwrap());
        // a second claim must lose the race
        assert!(!cat.claim_table(16384).unwrap());

        cat.table_done(16384, 8192, 100).unwrap();
        // terminal tasks are never claimable again
        assert!(!cat.claim_table(16384).unwrap());

        let status = cat.table_status(16384).unwrap().unwrap();
        assert_eq!(status.state, TaskState::Copied);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.bytes_transferred, 8192);
        assert_eq!(status.rows_copied, 100);
    }

    #[test]
    fn test_requeue_allows_reclaim_and_counts_attempts() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.plan_init(&sample_plan()).unwrap();

        assert!(cat.claim_table(16384).unwrap());
        cat.table_requeue(16384, "connection reset").unwrap();
        assert!(cat.claim_table(16384).unwrap());

        let status = cat.table_status(16384).unwrap().unwrap();
        assert_eq!(status.state, TaskState::InProgress);
        assert_eq!(status.attempts, 2);
    }

    #[test]
    fn test_recover_flips_in_progress_back() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.plan_init(&sample_plan()).unwrap();
        assert!(cat.claim_table(16384).unwrap());
        assert!(cat.claim_index(16400).unwrap());

        let n = cat.recover().unwrap();
        assert_eq!(n, 2);
        // claimable again after recovery
        assert!(cat.claim_table(16384).unwrap());
    }

    #[test]
    fn test_fk_readiness_waits_for_both_endpoints() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.plan_init(&sample_plan()).unwrap();

        assert!(cat.fk_constraints_ready().unwrap().is_empty());

        // owning table copied, referenced table not yet
        cat.claim_table(16390).unwrap();
        cat.table_done(16390, 4096, 50).unwrap();
        assert!(cat.fk_constraints_ready().unwrap().is_empty());

        cat.claim_table(16384).unwrap();
        cat.table_done(16384, 8192, 100).unwrap();
        assert_eq!(cat.fk_constraints_ready().unwrap(), vec![16401]);

        // claiming removes it from the ready list
        assert!(cat.claim_constraint(16401).unwrap());
        assert!(cat.fk_constraints_ready().unwrap().is_empty());
    }

    #[test]
    fn test_split_parts_promote_table_once() {
        let mut plan = sample_plan();
        plan.tables[0].split = SplitStrategy::ByIntegerColumn;
        plan.tables[0].part_key = Some("id".into());
        let mut parts = plan::integer_ranges(1, 100, 2);
        for p in &mut parts {
            p.table_oid = plan.tables[0].oid;
        }
        plan.parts = parts;

        let oid = plan.tables[0].oid;
        let cat = Catalog::open_in_memory().unwrap();
        cat.plan_init(&plan).unwrap();

        assert!(cat.claim_part(oid, 0).unwrap());
        cat.table_start_parts(oid).unwrap();
        assert!(cat.claim_part(oid, 1).unwrap());
        assert!(!cat.claim_part(oid, 1).unwrap());

        cat.part_done(oid, 0, 500, 50).unwrap();
        assert!(!cat.finish_table_from_parts(oid).unwrap());
        cat.part_done(oid, 1, 500, 50).unwrap();
        assert!(cat.finish_table_from_parts(oid).unwrap());
        // at-most-once promotion
        assert!(!cat.finish_table_from_parts(oid).unwrap());

        let status = cat.table_status(oid).unwrap().unwrap();
        assert_eq!(status.state, TaskState::Copied);
        assert_eq!(status.bytes_transferred, 1000);
        assert_eq!(status.rows_copied, 100);
    }

    #[test]
    fn test_run_steps() {
        let cat = Catalog::open_in_memory().unwrap();
        assert!(!cat.step_done("schema-pre-data").unwrap());
        cat.step_mark("schema-pre-data").unwrap();
        assert!(cat.step_done("schema-pre-data").unwrap());
    }

    #[test]
    fn test_blob_cursor_monotonic() {
        let cat = Catalog::open_in_memory().unwrap();
        assert_eq!(cat.blob_cursor().unwrap(), 0);
        cat.blob_advance(100, 10).unwrap();
        cat.blob_advance(50, 5).unwrap(); // stale batch cannot move it back
        assert_eq!(cat.blob_cursor().unwrap(), 100);
        let (copied, _) = cat.blob_counts().unwrap();
        assert_eq!(copied, 15);
    }

    #[test]
    fn test_slot_sentinel_cursor_round_trip() {
        let cat = Catalog::open_in_memory().unwrap();

        assert!(cat.slot_get("pgshuttle").unwrap().is_none());
        cat.slot_put(&SlotState {
            slot_name: "pgshuttle".into(),
            plugin: "wal2json".into(),
            consistent_point: "0/15D3A60".parse().unwrap(),
            write_lsn: Lsn::ZERO,
            flush_lsn: Lsn::ZERO,
            timeline_id: 1,
        })
        .unwrap();
        let slot = cat.slot_get("pgshuttle").unwrap().unwrap();
        assert_eq!(slot.consistent_point.to_string(), "0/15D3A60");

        cat.sentinel_put(&Sentinel {
            startpos: "0/15D3A60".parse().unwrap(),
            endpos: None,
            apply_enabled: false,
        })
        .unwrap();
        let mut s = cat.sentinel_get().unwrap().unwrap();
        s.endpos = Some("0/2000000".parse().unwrap());
        s.apply_enabled = true;
        cat.sentinel_put(&s).unwrap();
        let s = cat.sentinel_get().unwrap().unwrap();
        assert_eq!(s.endpos.unwrap().to_string(), "0/2000000");
        assert!(s.apply_enabled);

        let cursor = cat.cursor_read().unwrap();
        assert!(cursor.applied_commit_lsn.is_zero());
        cat.cursor_write(&ApplyCursor {
            applied_commit_lsn: "0/1900000".parse().unwrap(),
            written_lsn: "0/1A00000".parse().unwrap(),
            flushed_lsn: "0/1800000".parse().unwrap(),
        })
        .unwrap();
        // an older applied LSN cannot move the cursor backwards
        cat.cursor_write(&ApplyCursor {
            applied_commit_lsn: "0/1000000".parse().unwrap(),
            written_lsn: "0/1A00001".parse().unwrap(),
            flushed_lsn: "0/1900000".parse().unwrap(),
        })
        .unwrap();
        let cursor = cat.cursor_read().unwrap();
        assert_eq!(cursor.applied_commit_lsn.to_string(), "0/1900000");
        assert_eq!(cursor.written_lsn.to_string(), "0/1A00001");
    }

    #[test]
    fn test_failed_tasks_and_progress_counts() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.plan_init(&sample_plan()).unwrap();
        cat.claim_table(16384).unwrap();
        cat.table_failed(16384, "copy interrupted").unwrap();

        let failed = cat.failed_tasks().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "table");
        assert_eq!(failed[0].1, "public.a");
        assert_eq!(failed[0].3, "copy interrupted");

        let counts = cat.progress_counts().unwrap();
        assert!(counts
            .iter()
            .any(|(k, s, n)| k == "table" && s == "failed" && *n == 1));
        assert!(!cat.all_tables_copied().unwrap());
    }
}
