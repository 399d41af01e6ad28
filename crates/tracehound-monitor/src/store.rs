//! SQLite-backed trace storage.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{
    params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracehound_core::{
    now_ms, Anomaly, AnomalyType, Edge, NewAnomaly, Node, RunStatus, Severity, Trace,
};
use tracing::{debug, info};

use crate::query::{NodeUpdate, StoreSummary, TraceDetail, TraceQuery, TraceUpdate};

const SCHEMA_VERSION: i64 = 1;
const READER_POOL_SIZE: usize = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TRACE_COLUMNS: &str = "id, project_name, start_time, end_time, status, total_cost, \
     node_count, metadata, created_at, updated_at";
const NODE_COLUMNS: &str = "id, trace_id, run_id, parent_run_id, status, start_time, end_time, \
     data, cost, tokens, latency_ms, error";
const EDGE_COLUMNS: &str = "id, trace_id, from_run, to_run";
const ANOMALY_COLUMNS: &str =
    "id, trace_id, type, severity, message, run_ids, suggestion, metadata, created_at";

/// Errors from trace store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("Database error: {0}")]
    Database(rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Lock error")]
    Lock,
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == ErrorCode::ConstraintViolation =>
            {
                let detail = msg.clone().unwrap_or_else(|| err.to_string());
                match err.extended_code {
                    rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => StoreError::DuplicateKey(detail),
                    _ => StoreError::ConstraintViolation(detail),
                }
            }
            _ => StoreError::Database(e),
        }
    }
}

/// SQLite-backed trace storage.
///
/// Writes go through a single connection and run inside immediate
/// transactions. File-backed stores run in WAL mode and serve reads from a
/// small pool of read-only connections, so readers never queue behind a
/// writer. In-memory stores read through the writer connection.
pub struct TraceStore {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl TraceStore {
    /// Opens (or creates) a trace store at the given database path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(path)?;
        configure(&writer)?;
        writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        apply_schema(&writer)?;

        let readers = (0..READER_POOL_SIZE)
            .map(|_| open_reader(path).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        info!("Trace store opened at {}", path.display());
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    /// Creates an in-memory trace store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        apply_schema(&conn)?;
        Ok(Self {
            writer: Mutex::new(conn),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
        })
    }

    /// Applies the schema. Safe to call on an already-initialized store.
    pub fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.writer.lock().map_err(|_| StoreError::Lock)?;
        apply_schema(&conn)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.writer.lock().map_err(|_| StoreError::Lock)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if self.readers.is_empty() {
            let conn = self.writer.lock().map_err(|_| StoreError::Lock)?;
            return f(&conn);
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].lock().map_err(|_| StoreError::Lock)?;
        f(&conn)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Traces
    // ─────────────────────────────────────────────────────────────────────────

    /// Inserts a new running trace.
    pub fn create_trace(
        &self,
        id: &str,
        project_name: &str,
        start_time: i64,
        metadata: HashMap<String, Value>,
    ) -> Result<Trace, StoreError> {
        let now = now_ms();
        let trace = Trace {
            id: id.to_string(),
            project_name: project_name.to_string(),
            start_time,
            end_time: None,
            status: RunStatus::Running,
            total_cost: 0.0,
            node_count: 0,
            metadata,
            created_at: now,
            updated_at: now,
        };
        let metadata_json = serde_json::to_string(&trace.metadata)?;

        self.write(|tx| {
            if row_exists(tx, "SELECT 1 FROM traces WHERE id = ?1", id)? {
                return Err(StoreError::DuplicateKey(format!("trace {id}")));
            }
            tx.execute(
                r#"INSERT INTO traces
                   (id, project_name, start_time, end_time, status, total_cost, node_count,
                    metadata, created_at, updated_at)
                   VALUES (?1, ?2, ?3, NULL, ?4, 0, 0, ?5, ?6, ?6)"#,
                params![
                    trace.id,
                    trace.project_name,
                    trace.start_time,
                    trace.status.as_str(),
                    metadata_json,
                    now,
                ],
            )?;
            Ok(())
        })?;

        debug!(trace_id = %id, project = %project_name, "Created trace");
        Ok(trace)
    }

    /// Applies the provided fields of `update` and returns the resulting trace.
    pub fn update_trace(&self, id: &str, update: &TraceUpdate) -> Result<Trace, StoreError> {
        self.write(|tx| {
            let mut trace = query_trace(tx, id)?
                .ok_or_else(|| StoreError::NotFound(format!("trace {id}")))?;
            if update.is_empty() {
                return Ok(trace);
            }

            let finalized = trace.status.is_terminal();
            if let Some(status) = update.status {
                if finalized && status != trace.status {
                    return Err(StoreError::ConstraintViolation(format!(
                        "trace {id} is already {}",
                        trace.status.as_str()
                    )));
                }
                trace.status = status;
            }
            if let Some(end_time) = update.end_time {
                if finalized && trace.end_time != Some(end_time) {
                    return Err(StoreError::ConstraintViolation(format!(
                        "trace {id} already ended"
                    )));
                }
                trace.end_time = Some(end_time);
            }
            if trace.end_time.is_some_and(|end| end < trace.start_time) {
                return Err(StoreError::ConstraintViolation(format!(
                    "trace {id} cannot end before it starts"
                )));
            }
            if let Some(total_cost) = update.total_cost {
                trace.total_cost = total_cost;
            }
            if let Some(node_count) = update.node_count {
                trace.node_count = node_count;
            }
            trace.updated_at = now_ms();

            tx.execute(
                r#"UPDATE traces SET
                   end_time = ?1, status = ?2, total_cost = ?3, node_count = ?4, updated_at = ?5
                   WHERE id = ?6"#,
                params![
                    trace.end_time,
                    trace.status.as_str(),
                    trace.total_cost,
                    trace.node_count,
                    trace.updated_at,
                    trace.id,
                ],
            )?;
            Ok(trace)
        })
    }

    /// Retrieves a trace by ID.
    pub fn get_trace(&self, id: &str) -> Result<Option<Trace>, StoreError> {
        self.read(|conn| query_trace(conn, id))
    }

    /// Lists traces, most recently created first.
    pub fn list_traces(&self, query: &TraceQuery) -> Result<Vec<Trace>, StoreError> {
        self.read(|conn| {
            let mut sql = format!("SELECT {TRACE_COLUMNS} FROM traces WHERE 1=1");
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(ref project) = query.project_name {
                sql.push_str(" AND project_name = ?");
                params_vec.push(Box::new(project.clone()));
            }

            if let Some(status) = query.status {
                sql.push_str(" AND status = ?");
                params_vec.push(Box::new(status.as_str().to_string()));
            }

            sql.push_str(" ORDER BY created_at DESC, rowid DESC");

            match (query.limit, query.offset) {
                (Some(limit), Some(offset)) => {
                    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
                }
                (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
                (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
                (None, None) => {}
            }

            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|p| p.as_ref()).collect();
            let rows = stmt.query_map(params_refs.as_slice(), trace_from_row)?;

            let mut traces = Vec::new();
            for row in rows {
                traces.push(row?);
            }
            Ok(traces)
        })
    }

    /// Deletes a trace together with its nodes, edges and anomalies.
    pub fn delete_trace(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self.write(|tx| {
            Ok(tx.execute("DELETE FROM traces WHERE id = ?1", params![id])? > 0)
        })?;
        if deleted {
            info!(trace_id = %id, "Deleted trace");
        }
        Ok(deleted)
    }

    /// Retention cleanup: deletes every trace created before `cutoff_ms`.
    pub fn purge_traces_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let purged = self.write(|tx| {
            Ok(tx.execute("DELETE FROM traces WHERE created_at < ?1", params![cutoff_ms])?)
        })?;
        if purged > 0 {
            info!("Purged {} traces created before {}", purged, cutoff_ms);
        }
        Ok(purged)
    }

    /// Reads a trace and everything it owns from a single snapshot.
    pub fn get_trace_detail(&self, id: &str) -> Result<Option<TraceDetail>, StoreError> {
        self.read(|conn| {
            let tx = conn.unchecked_transaction()?;
            let Some(trace) = query_trace(&tx, id)? else {
                return Ok(None);
            };
            let detail = TraceDetail {
                nodes: query_nodes(&tx, id)?,
                edges: query_edges(&tx, id)?,
                anomalies: query_anomalies(&tx, id)?,
                trace,
            };
            tx.commit()?;
            Ok(Some(detail))
        })
    }

    /// Gets aggregate counts for the dashboard.
    pub fn summary(&self) -> Result<StoreSummary, StoreError> {
        self.read(|conn| {
            let summary = conn.query_row(
                r#"SELECT
                   (SELECT COUNT(*) FROM traces),
                   (SELECT COUNT(*) FROM nodes),
                   (SELECT COUNT(*) FROM anomalies),
                   (SELECT COALESCE(SUM(total_cost), 0.0) FROM traces)"#,
                [],
                |row| {
                    Ok(StoreSummary {
                        trace_count: row.get(0)?,
                        node_count: row.get(1)?,
                        anomaly_count: row.get(2)?,
                        total_cost: row.get(3)?,
                    })
                },
            )?;
            Ok(summary)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Nodes
    // ─────────────────────────────────────────────────────────────────────────

    /// Inserts a node and refreshes its trace's roll-ups in the same transaction.
    pub fn create_node(&self, node: &Node) -> Result<Node, StoreError> {
        let data = serde_json::to_string(&node.payload)?;
        let tokens = node.tokens.as_ref().map(serde_json::to_string).transpose()?;

        self.write(|tx| {
            if !row_exists(tx, "SELECT 1 FROM traces WHERE id = ?1", &node.trace_id)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "trace {} does not exist",
                    node.trace_id
                )));
            }
            if row_exists(tx, "SELECT 1 FROM nodes WHERE run_id = ?1", &node.run_id)? {
                return Err(StoreError::DuplicateKey(format!("run {}", node.run_id)));
            }
            if let Some(parent) = &node.parent_run_id {
                match node_trace_id(tx, parent)? {
                    Some(owner) if owner == node.trace_id => {}
                    Some(owner) => {
                        return Err(StoreError::ConstraintViolation(format!(
                            "parent run {parent} belongs to trace {owner}"
                        )))
                    }
                    None => {
                        return Err(StoreError::ConstraintViolation(format!(
                            "parent run {parent} does not exist"
                        )))
                    }
                }
            }
            if node.end_time.is_some_and(|end| end < node.start_time) {
                return Err(StoreError::ConstraintViolation(format!(
                    "run {} cannot end before it starts",
                    node.run_id
                )));
            }

            tx.execute(
                r#"INSERT INTO nodes
                   (id, trace_id, run_id, parent_run_id, type, status, start_time, end_time,
                    data, cost, tokens, latency_ms, error)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
                params![
                    node.id,
                    node.trace_id,
                    node.run_id,
                    node.parent_run_id,
                    node.node_type().as_str(),
                    node.status.as_str(),
                    node.start_time,
                    node.end_time,
                    data,
                    node.cost,
                    tokens,
                    node.latency_ms,
                    node.error,
                ],
            )?;
            refresh_rollups(tx, &node.trace_id)
        })?;

        debug!(run_id = %node.run_id, node_type = node.node_type().as_str(), "Created node");
        Ok(node.clone())
    }

    /// Applies the provided fields of `update` and returns the resulting node.
    ///
    /// A finalized node (complete or error) only accepts an empty update.
    pub fn update_node(&self, run_id: &str, update: &NodeUpdate) -> Result<Node, StoreError> {
        self.write(|tx| {
            let mut node = query_node(tx, run_id)?
                .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
            if update.is_empty() {
                return Ok(node);
            }
            if node.status.is_terminal() {
                return Err(StoreError::ConstraintViolation(format!(
                    "run {run_id} is already {}",
                    node.status.as_str()
                )));
            }

            if let Some(payload) = &update.payload {
                if payload.node_type() != node.node_type() {
                    return Err(StoreError::ConstraintViolation(format!(
                        "run {run_id} is a {} node, not {}",
                        node.node_type().as_str(),
                        payload.node_type().as_str()
                    )));
                }
                node.payload = payload.clone();
            }
            if let Some(status) = update.status {
                node.status = status;
            }
            if let Some(end_time) = update.end_time {
                if end_time < node.start_time {
                    return Err(StoreError::ConstraintViolation(format!(
                        "run {run_id} cannot end before it starts"
                    )));
                }
                node.end_time = Some(end_time);
            }
            node.latency_ms = update
                .latency_ms
                .or_else(|| update.end_time.map(|end| end - node.start_time))
                .or(node.latency_ms);
            if update.cost.is_some() {
                node.cost = update.cost;
            }
            if update.tokens.is_some() {
                node.tokens = update.tokens;
            }
            if update.error.is_some() {
                node.error = update.error.clone();
            }

            let data = serde_json::to_string(&node.payload)?;
            let tokens = node.tokens.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                r#"UPDATE nodes SET
                   status = ?1, end_time = ?2, data = ?3, cost = ?4, tokens = ?5,
                   latency_ms = ?6, error = ?7
                   WHERE run_id = ?8"#,
                params![
                    node.status.as_str(),
                    node.end_time,
                    data,
                    node.cost,
                    tokens,
                    node.latency_ms,
                    node.error,
                    run_id,
                ],
            )?;
            if update.cost.is_some() {
                refresh_rollups(tx, &node.trace_id)?;
            }
            Ok(node)
        })
    }

    /// Looks up a node by its run identifier.
    pub fn get_node_by_run_id(&self, run_id: &str) -> Result<Option<Node>, StoreError> {
        self.read(|conn| query_node(conn, run_id))
    }

    /// Lists a trace's nodes in ascending start order (ties by run id).
    pub fn list_nodes_by_trace(&self, trace_id: &str) -> Result<Vec<Node>, StoreError> {
        self.read(|conn| query_nodes(conn, trace_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Edges & Anomalies
    // ─────────────────────────────────────────────────────────────────────────

    /// Inserts an edge. Both endpoints must already be nodes of the edge's trace.
    pub fn create_edge(&self, edge: &Edge) -> Result<Edge, StoreError> {
        self.write(|tx| {
            if row_exists(tx, "SELECT 1 FROM edges WHERE id = ?1", &edge.id)? {
                return Err(StoreError::DuplicateKey(format!("edge {}", edge.id)));
            }
            for run_id in [&edge.from_run, &edge.to_run] {
                if node_trace_id(tx, run_id)?.as_deref() != Some(edge.trace_id.as_str()) {
                    return Err(StoreError::ConstraintViolation(format!(
                        "edge endpoint {run_id} is not a node of trace {}",
                        edge.trace_id
                    )));
                }
            }
            tx.execute(
                "INSERT INTO edges (id, trace_id, from_run, to_run) VALUES (?1, ?2, ?3, ?4)",
                params![edge.id, edge.trace_id, edge.from_run, edge.to_run],
            )?;
            Ok(())
        })?;
        Ok(edge.clone())
    }

    /// Lists a trace's edges (no particular order).
    pub fn list_edges_by_trace(&self, trace_id: &str) -> Result<Vec<Edge>, StoreError> {
        self.read(|conn| query_edges(conn, trace_id))
    }

    /// Persists an anomaly, assigning its identifier and creation time.
    pub fn create_anomaly(&self, anomaly: &NewAnomaly) -> Result<Anomaly, StoreError> {
        let anomaly = Anomaly {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: anomaly.trace_id.clone(),
            anomaly_type: anomaly.anomaly_type.clone(),
            severity: anomaly.severity,
            message: anomaly.message.clone(),
            run_ids: anomaly.run_ids.clone(),
            suggestion: anomaly.suggestion.clone(),
            metadata: anomaly.metadata.clone(),
            created_at: now_ms(),
        };
        let run_ids = serde_json::to_string(&anomaly.run_ids)?;
        let metadata = anomaly.metadata.as_ref().map(serde_json::to_string).transpose()?;

        self.write(|tx| {
            if !row_exists(tx, "SELECT 1 FROM traces WHERE id = ?1", &anomaly.trace_id)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "trace {} does not exist",
                    anomaly.trace_id
                )));
            }
            for run_id in &anomaly.run_ids {
                if node_trace_id(tx, run_id)?.as_deref() != Some(anomaly.trace_id.as_str()) {
                    return Err(StoreError::ConstraintViolation(format!(
                        "run {run_id} is not part of trace {}",
                        anomaly.trace_id
                    )));
                }
            }
            tx.execute(
                r#"INSERT INTO anomalies
                   (id, trace_id, type, severity, message, run_ids, suggestion, metadata, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                params![
                    anomaly.id,
                    anomaly.trace_id,
                    anomaly.anomaly_type.as_str(),
                    anomaly.severity.as_str(),
                    anomaly.message,
                    run_ids,
                    anomaly.suggestion,
                    metadata,
                    anomaly.created_at,
                ],
            )?;
            Ok(())
        })?;

        info!(
            trace_id = %anomaly.trace_id,
            anomaly_type = anomaly.anomaly_type.as_str(),
            severity = anomaly.severity.as_str(),
            "Recorded anomaly"
        );
        Ok(anomaly)
    }

    /// Lists a trace's anomalies, most recent first.
    pub fn list_anomalies_by_trace(&self, trace_id: &str) -> Result<Vec<Anomaly>, StoreError> {
        self.read(|conn| query_anomalies(conn, trace_id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection setup
// ─────────────────────────────────────────────────────────────────────────────

fn configure(conn: &Connection) -> Result<(), StoreError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(())
}

fn open_reader(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS traces (
            id TEXT PRIMARY KEY,
            project_name TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            status TEXT NOT NULL CHECK (status IN ('running', 'complete', 'error')),
            total_cost REAL NOT NULL DEFAULT 0,
            node_count INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (end_time IS NULL OR end_time >= start_time)
        );

        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            trace_id TEXT NOT NULL REFERENCES traces(id) ON DELETE CASCADE,
            run_id TEXT NOT NULL UNIQUE,
            parent_run_id TEXT,
            type TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('running', 'complete', 'error')),
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            data TEXT NOT NULL,
            cost REAL,
            tokens TEXT,
            latency_ms INTEGER,
            error TEXT
        );

        CREATE TABLE IF NOT EXISTS edges (
            id TEXT PRIMARY KEY,
            trace_id TEXT NOT NULL REFERENCES traces(id) ON DELETE CASCADE,
            from_run TEXT NOT NULL REFERENCES nodes(run_id) ON DELETE CASCADE,
            to_run TEXT NOT NULL REFERENCES nodes(run_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            id TEXT PRIMARY KEY,
            trace_id TEXT NOT NULL REFERENCES traces(id) ON DELETE CASCADE,
            type TEXT NOT NULL,
            severity TEXT NOT NULL CHECK (severity IN ('low', 'medium', 'high', 'critical')),
            message TEXT NOT NULL,
            run_ids TEXT NOT NULL,
            suggestion TEXT,
            metadata TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_traces_project ON traces(project_name);
        CREATE INDEX IF NOT EXISTS idx_traces_created ON traces(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_nodes_trace ON nodes(trace_id);
        CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_run_id);
        CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(type);
        CREATE INDEX IF NOT EXISTS idx_nodes_start ON nodes(start_time);
        CREATE INDEX IF NOT EXISTS idx_edges_trace ON edges(trace_id);
        CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_run);
        CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_run);
        CREATE INDEX IF NOT EXISTS idx_anomalies_trace ON anomalies(trace_id);
        "#,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

fn row_exists(conn: &Connection, sql: &str, key: &str) -> Result<bool, StoreError> {
    Ok(conn.query_row(sql, params![key], |_| Ok(())).optional()?.is_some())
}

fn node_trace_id(conn: &Connection, run_id: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT trace_id FROM nodes WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Recomputes node count and total cost from the trace's nodes.
fn refresh_rollups(conn: &Connection, trace_id: &str) -> Result<(), StoreError> {
    conn.execute(
        r#"UPDATE traces SET
           node_count = (SELECT COUNT(*) FROM nodes WHERE trace_id = ?1),
           total_cost = (SELECT COALESCE(SUM(cost), 0.0) FROM nodes WHERE trace_id = ?1),
           updated_at = ?2
           WHERE id = ?1"#,
        params![trace_id, now_ms()],
    )?;
    Ok(())
}

fn query_trace(conn: &Connection, id: &str) -> Result<Option<Trace>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {TRACE_COLUMNS} FROM traces WHERE id = ?1"),
            params![id],
            trace_from_row,
        )
        .optional()?)
}

fn query_node(conn: &Connection, run_id: &str) -> Result<Option<Node>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE run_id = ?1"),
            params![run_id],
            node_from_row,
        )
        .optional()?)
}

fn query_nodes(conn: &Connection, trace_id: &str) -> Result<Vec<Node>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE trace_id = ?1 ORDER BY start_time ASC, run_id ASC"
    ))?;
    let rows = stmt.query_map(params![trace_id], node_from_row)?;

    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(row?);
    }
    Ok(nodes)
}

fn query_edges(conn: &Connection, trace_id: &str) -> Result<Vec<Edge>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EDGE_COLUMNS} FROM edges WHERE trace_id = ?1"
    ))?;
    let rows = stmt.query_map(params![trace_id], |row| {
        Ok(Edge {
            id: row.get(0)?,
            trace_id: row.get(1)?,
            from_run: row.get(2)?,
            to_run: row.get(3)?,
        })
    })?;

    let mut edges = Vec::new();
    for row in rows {
        edges.push(row?);
    }
    Ok(edges)
}

fn query_anomalies(conn: &Connection, trace_id: &str) -> Result<Vec<Anomaly>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE trace_id = ?1 \
         ORDER BY created_at DESC, rowid DESC"
    ))?;
    let rows = stmt.query_map(params![trace_id], anomaly_from_row)?;

    let mut anomalies = Vec::new();
    for row in rows {
        anomalies.push(row?);
    }
    Ok(anomalies)
}

// ─────────────────────────────────────────────────────────────────────────────
// Row decoding
// ─────────────────────────────────────────────────────────────────────────────

fn trace_from_row(row: &Row<'_>) -> rusqlite::Result<Trace> {
    Ok(Trace {
        id: row.get(0)?,
        project_name: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        status: status_column(row, 4)?,
        total_cost: row.get(5)?,
        node_count: row.get(6)?,
        metadata: json_column(row, 7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        run_id: row.get(2)?,
        parent_run_id: row.get(3)?,
        status: status_column(row, 4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        payload: json_column(row, 7)?,
        cost: row.get(8)?,
        tokens: opt_json_column(row, 9)?,
        latency_ms: row.get(10)?,
        error: row.get(11)?,
    })
}

fn anomaly_from_row(row: &Row<'_>) -> rusqlite::Result<Anomaly> {
    let severity: String = row.get(3)?;
    Ok(Anomaly {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        anomaly_type: AnomalyType::from(row.get::<_, String>(2)?),
        severity: Severity::parse(&severity)
            .ok_or_else(|| conversion_error(3, format!("unknown severity '{severity}'")))?,
        message: row.get(4)?,
        run_ids: json_column(row, 5)?,
        suggestion: row.get(6)?,
        metadata: opt_json_column(row, 7)?,
        created_at: row.get(8)?,
    })
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<RunStatus> {
    let raw: String = row.get(idx)?;
    RunStatus::parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown status '{raw}'")))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}
