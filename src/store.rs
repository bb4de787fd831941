//! The embedded graph store: nodes, edges, and watermarks persisted in an embedded `rusqlite`
//! database. `STRICT` tables, a `CHECK` constraint guarding a domain invariant, WAL journalling,
//! and a temp-table + `LEFT JOIN` pattern for bulk missing-key lookups.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;

use crate::core::EdgeKind;
use crate::core::NodeKind;
use crate::errors::EngineError;
use crate::errors::EngineResult;

pub type Pooled = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

#[derive(Debug, Clone)]
pub struct NodeRow {
    pub uid: String,
    pub kind: NodeKind,
    pub natural_key: String,
    pub props: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub src: String,
    pub rel: EdgeKind,
    pub dst: String,
    pub timestamp: Option<String>,
    pub props: serde_json::Value,
    pub sources: Vec<String>,
    pub confidence: Option<f64>,
    pub first_seen_ts: Option<String>,
    pub last_seen_ts: Option<String>,
}

const SCHEMA: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA foreign_keys = ON",
    "CREATE TABLE IF NOT EXISTS nodes (
        uid TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        natural_key TEXT NOT NULL,
        props TEXT NOT NULL,
        UNIQUE(kind, natural_key)
    ) STRICT",
    "CREATE TABLE IF NOT EXISTS edges (
        src TEXT NOT NULL,
        rel TEXT NOT NULL,
        dst TEXT NOT NULL,
        timestamp TEXT,
        props TEXT NOT NULL,
        sources TEXT NOT NULL,
        confidence REAL,
        first_seen_ts TEXT,
        last_seen_ts TEXT,
        CHECK (confidence IS NULL OR (confidence >= 0.0 AND confidence <= 1.0))
    ) STRICT",
    "CREATE TABLE IF NOT EXISTS watermarks (
        family TEXT PRIMARY KEY,
        last_ts TEXT,
        last_run_id TEXT
    ) STRICT",
    "CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind)",
    // STRICT tables make every PRIMARY KEY column implicitly NOT NULL, and most structural
    // edges (CONTAINS, PART_OF, USES_LIBRARY...) carry no timestamp, so identity is enforced
    // by this expression index instead of a composite primary key: COALESCE collapses a NULL
    // timestamp to '' so two untimestamped edges with the same (src, rel, dst) still collide.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_edges_identity ON edges(src, rel, dst, COALESCE(timestamp, ''))",
    "CREATE INDEX IF NOT EXISTS idx_edges_rel_timestamp ON edges(rel, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst)",
    "CREATE VIRTUAL TABLE IF NOT EXISTS chunk_fulltext USING fts5(uid UNINDEXED, content)",
    "CREATE VIRTUAL TABLE IF NOT EXISTS commit_fulltext USING fts5(uid UNINDEXED, message)",
];

impl Store {
    /// Open (creating if absent) the embedded store at `path` and run the Schema Manager's
    /// bootstrap. All declarations are `IF NOT EXISTS`-style and safe to re-run.
    pub fn open(path: &Path) -> EngineResult<Store> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::StorePermanent(e.into()))?;
        }

        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout = 30000;"));
        let pool = Pool::builder()
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(|e| EngineError::StoreTransient(e.into()))?;

        let store = Store { pool };
        store.bootstrap_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> EngineResult<Store> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| EngineError::StoreTransient(e.into()))?;
        let store = Store { pool };
        store.bootstrap_schema()?;
        Ok(store)
    }

    fn conn(&self) -> EngineResult<Pooled> {
        self.pool.get().map_err(|e| EngineError::StoreTransient(e.into()))
    }

    fn bootstrap_schema(&self) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(&SCHEMA.join(";\n"))
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        Ok(())
    }

    /// `reset_graph=true`: drop every table and edge, then re-run the schema bootstrap.
    pub fn reset(&self) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "DROP TABLE IF EXISTS nodes;
             DROP TABLE IF EXISTS edges;
             DROP TABLE IF EXISTS watermarks;
             DROP TABLE IF EXISTS chunk_fulltext;
             DROP TABLE IF EXISTS commit_fulltext;",
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
        drop(conn);
        self.bootstrap_schema()
    }

    /// Batched idempotent node upsert, one transaction per call.
    /// Per-row transactions are forbidden; callers pass a full batch at once.
    pub fn upsert_nodes(&self, rows: &[NodeRow]) -> EngineResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| EngineError::StorePermanent(e.into()))?;
        upsert_nodes_conn(&tx, rows)?;
        tx.commit().map_err(|e| EngineError::StorePermanent(e.into()))
    }

    /// Upsert an edge, applying the confidence composition rule when the edge already
    /// exists and new evidence has arrived. When `confidence`/`sources` are `None`/empty the
    /// edge is a plain structural/temporal edge with no evidence bookkeeping.
    pub fn upsert_edge(&self, row: &EdgeRow, ts: Option<&str>) -> EngineResult<()> {
        let conn = self.conn()?;
        upsert_edge_conn(&conn, row, ts)
    }

    /// Bulk "which of these keys are missing" query: load candidates into a temp table, then
    /// `LEFT JOIN` against `nodes`.
    pub fn missing_node_keys(&self, kind: NodeKind, keys: &[String]) -> EngineResult<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| EngineError::StorePermanent(e.into()))?;

        tx.execute_batch("CREATE TEMP TABLE IF NOT EXISTS working_keys (natural_key TEXT PRIMARY KEY)")
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        tx.execute("DELETE FROM working_keys", [])
            .map_err(|e| EngineError::StorePermanent(e.into()))?;

        {
            let mut stmt = tx
                .prepare_cached("INSERT OR IGNORE INTO working_keys (natural_key) VALUES (?1)")
                .map_err(|e| EngineError::StorePermanent(e.into()))?;
            for key in keys {
                stmt.execute(params![key]).map_err(|e| EngineError::StorePermanent(e.into()))?;
            }
        }

        let missing = {
            let mut stmt = tx
                .prepare(
                    "SELECT w.natural_key FROM working_keys w
                     LEFT JOIN nodes n ON n.natural_key = w.natural_key AND n.kind = ?1
                     WHERE n.uid IS NULL",
                )
                .map_err(|e| EngineError::StorePermanent(e.into()))?;
            let rows = stmt
                .query_map(params![kind.as_ref()], |r| r.get::<_, String>(0))
                .map_err(|e| EngineError::StorePermanent(e.into()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| EngineError::StorePermanent(e.into()))?
        };

        tx.commit().map_err(|e| EngineError::StorePermanent(e.into()))?;
        Ok(missing)
    }

    pub fn node_count(&self, kind: NodeKind) -> EngineResult<i64> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM nodes WHERE kind = ?1", params![kind.as_ref()], |r| r.get(0))
            .map_err(|e| EngineError::StorePermanent(e.into()))
    }

    pub fn edge_count(&self, rel: EdgeKind) -> EngineResult<i64> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM edges WHERE rel = ?1", params![rel.as_ref()], |r| r.get(0))
            .map_err(|e| EngineError::StorePermanent(e.into()))
    }

    pub fn watermark(&self, family: &str) -> EngineResult<Option<String>> {
        let conn = self.conn()?;
        conn.query_row("SELECT last_ts FROM watermarks WHERE family = ?1", params![family], |r| r.get(0))
            .optional()
            .map_err(|e| EngineError::StorePermanent(e.into()))
            .map(Option::flatten)
    }

    /// Advance a derivation family's watermark. Monotone by construction: callers only ever pass
    /// a timestamp greater than or equal to what `watermark()` last returned.
    pub fn advance_watermark(&self, family: &str, last_ts: &str, run_id: &str) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO watermarks (family, last_ts, last_run_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(family) DO UPDATE SET last_ts = excluded.last_ts, last_run_id = excluded.last_run_id",
            params![family, last_ts, run_id],
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
        Ok(())
    }

    pub fn raw_conn(&self) -> EngineResult<Pooled> {
        self.conn()
    }
}

/// Node upsert against an already-open connection (or transaction). Used both by `Store` methods,
/// which check one out from the pool, and by the Relationship Deriver, which holds a single
/// connection for an entire derivation pass so `dry_run`'s rollback actually covers every write.
pub fn upsert_nodes_conn(conn: &Connection, rows: &[NodeRow]) -> EngineResult<()> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO nodes (uid, kind, natural_key, props) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(uid) DO UPDATE SET props = excluded.props",
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    for row in rows {
        stmt.execute(params![row.uid, row.kind.as_ref(), row.natural_key, row.props.to_string()])
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
    }

    Ok(())
}

/// Edge upsert against an already-open connection (or transaction); see `upsert_nodes_conn`.
pub fn upsert_edge_conn(conn: &Connection, row: &EdgeRow, ts: Option<&str>) -> EngineResult<()> {
    let existing: Option<(f64, String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT confidence, sources, first_seen_ts, last_seen_ts FROM edges
             WHERE src = ?1 AND rel = ?2 AND dst = ?3 AND timestamp IS ?4",
            params![row.src, row.rel.as_ref(), row.dst, row.timestamp],
            |r| {
                Ok((
                    r.get::<_, Option<f64>>(0)?.unwrap_or(0.0),
                    r.get::<_, Option<String>>(1)?.unwrap_or_else(|| "[]".to_string()),
                    r.get(2)?,
                    r.get(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    let (confidence, sources, first_seen_ts, last_seen_ts) = match (existing, row.confidence) {
        (Some((prev_conf, prev_sources_json, prev_first, prev_last)), Some(c)) => {
            let mut prev_sources: Vec<String> =
                serde_json::from_str(&prev_sources_json).unwrap_or_default();
            // A source already on record contributed its confidence once already; composing it
            // again on a rerun with no new evidence would inflate confidence without bound.
            let already_recorded =
                !row.sources.is_empty() && row.sources.iter().all(|s| prev_sources.contains(s));
            for s in &row.sources {
                if !prev_sources.contains(s) {
                    prev_sources.push(s.clone());
                }
            }
            let composed =
                if already_recorded { prev_conf } else { 1.0 - (1.0 - prev_conf) * (1.0 - c) };
            let first = min_opt_ts(prev_first, ts);
            let last = max_opt_ts(prev_last, ts);
            (Some(composed), prev_sources, first, last)
        }
        (None, Some(c)) => (Some(c), row.sources.clone(), ts.map(String::from), ts.map(String::from)),
        (_, None) => (None, row.sources.clone(), row.first_seen_ts.clone(), row.last_seen_ts.clone()),
    };

    conn.execute(
        "INSERT INTO edges (src, rel, dst, timestamp, props, sources, confidence, first_seen_ts, last_seen_ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(src, rel, dst, COALESCE(timestamp, '')) DO UPDATE SET
           props = excluded.props,
           sources = excluded.sources,
           confidence = excluded.confidence,
           first_seen_ts = excluded.first_seen_ts,
           last_seen_ts = excluded.last_seen_ts",
        params![
            row.src,
            row.rel.as_ref(),
            row.dst,
            row.timestamp,
            row.props.to_string(),
            serde_json::to_string(&sources).unwrap(),
            confidence,
            first_seen_ts,
            last_seen_ts,
        ],
    )
    .map_err(|e| EngineError::StorePermanent(e.into()))?;

    Ok(())
}

fn min_opt_ts(prev: Option<String>, ts: Option<&str>) -> Option<String> {
    match (prev, ts) {
        (Some(p), Some(t)) => Some(std::cmp::min(p, t.to_string())),
        (Some(p), None) => Some(p),
        (None, Some(t)) => Some(t.to_string()),
        (None, None) => None,
    }
}

fn max_opt_ts(prev: Option<String>, ts: Option<&str>) -> Option<String> {
    match (prev, ts) {
        (Some(p), Some(t)) => Some(std::cmp::max(p, t.to_string())),
        (Some(p), None) => Some(p),
        (None, Some(t)) => Some(t.to_string()),
        (None, None) => None,
    }
}

/// A connection freshly opened for a worker thread, bypassing the pool. Used by stages that
/// want one dedicated connection per thread for the lifetime of a batch, cloned into
/// `std::thread::spawn` the same way a pooled `Store` handle would be.
pub fn dedicated_connection(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path).context("failed to open dedicated connection")?;
    conn.execute_batch("PRAGMA busy_timeout = 30000;")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_idempotent() {
        let store = Store::in_memory().unwrap();
        store.bootstrap_schema().unwrap();
        assert_eq!(store.node_count(NodeKind::File).unwrap(), 0);
    }

    #[test]
    fn confidence_composes_with_complementary_probability_rule() {
        let store = Store::in_memory().unwrap();
        let row = EdgeRow {
            src: "req:FR-01-02".into(),
            rel: EdgeKind::Implements,
            dst: "file:search.py".into(),
            timestamp: Some("2025-01-01T00:00:00Z".into()),
            props: serde_json::json!({}),
            sources: vec!["commit-message".into()],
            confidence: Some(0.9),
            first_seen_ts: None,
            last_seen_ts: None,
        };
        store.upsert_edge(&row, Some("2025-01-01T00:00:00Z")).unwrap();

        let row2 = EdgeRow { sources: vec!["doc-mention".into()], confidence: Some(0.5), ..row };
        store.upsert_edge(&row2, Some("2025-01-02T00:00:00Z")).unwrap();

        let conn = store.raw_conn().unwrap();
        let (confidence, sources): (f64, String) = conn
            .query_row(
                "SELECT confidence, sources FROM edges WHERE src = ?1 AND rel = ?2 AND dst = ?3",
                params!["req:FR-01-02", "IMPLEMENTS", "file:search.py"],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();

        assert!((confidence - 0.95).abs() < 1e-9);
        let sources: Vec<String> = serde_json::from_str(&sources).unwrap();
        assert_eq!(sources, vec!["commit-message".to_string(), "doc-mention".to_string()]);
    }

    #[test]
    fn untimestamped_structural_edge_can_be_inserted_and_reupserted() {
        let store = Store::in_memory().unwrap();
        let row = EdgeRow {
            src: "dir:src".into(),
            rel: EdgeKind::Contains,
            dst: "file:src/main.rs".into(),
            timestamp: None,
            props: serde_json::json!({}),
            sources: Vec::new(),
            confidence: None,
            first_seen_ts: None,
            last_seen_ts: None,
        };
        store.upsert_edge(&row, None).unwrap();
        store.upsert_edge(&row, None).unwrap();

        let conn = store.raw_conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM edges WHERE src = ?1 AND rel = ?2 AND dst = ?3",
                params!["dir:src", "CONTAINS", "file:src/main.rs"],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn rerunning_the_same_evidence_does_not_inflate_confidence() {
        let store = Store::in_memory().unwrap();
        let row = EdgeRow {
            src: "req:FR-01-02".into(),
            rel: EdgeKind::Implements,
            dst: "file:search.py".into(),
            timestamp: Some("2025-01-01T00:00:00Z".into()),
            props: serde_json::json!({}),
            sources: vec!["commit-message".into()],
            confidence: Some(0.9),
            first_seen_ts: None,
            last_seen_ts: None,
        };
        store.upsert_edge(&row, Some("2025-01-01T00:00:00Z")).unwrap();
        store.upsert_edge(&row, Some("2025-01-01T00:00:00Z")).unwrap();

        let conn = store.raw_conn().unwrap();
        let confidence: f64 = conn
            .query_row(
                "SELECT confidence FROM edges WHERE src = ?1 AND rel = ?2 AND dst = ?3",
                params!["req:FR-01-02", "IMPLEMENTS", "file:search.py"],
                |r| r.get(0),
            )
            .unwrap();
        assert!((confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn reset_drops_and_recreates_schema() {
        let store = Store::in_memory().unwrap();
        store
            .upsert_nodes(&[NodeRow {
                uid: "a".into(),
                kind: NodeKind::File,
                natural_key: "a.rs".into(),
                props: serde_json::json!({}),
            }])
            .unwrap();
        assert_eq!(store.node_count(NodeKind::File).unwrap(), 1);
        store.reset().unwrap();
        assert_eq!(store.node_count(NodeKind::File).unwrap(), 0);
    }
}
