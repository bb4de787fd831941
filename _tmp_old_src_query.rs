//! Windowed Query Layer: serves time-scoped subgraphs, commit-density buckets, full-text
//! search, sprint convenience subgraphs, and telemetry. A 30-second TTL result cache sits in
//! front of every read, keyed by the normalised query string — a plain `HashMap<String,
//! (Instant, CachedValue)>` behind a `Mutex`, the same shared-state shape `Store` itself uses.
//! No third-party cache crate: a map this small needs none.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use rusqlite::params;
use rusqlite::OptionalExtension;
use serde::Serialize;
use serde_json::Value;

use crate::core::EdgeKind;
use crate::core::NodeKind;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::store::Store;

const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub uid: String,
    pub kind: String,
    pub natural_key: String,
    pub props: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub src: String,
    pub rel: String,
    pub dst: String,
    pub timestamp: Option<String>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Performance {
    pub elapsed_ms: u128,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub pagination: Pagination,
    pub performance: Performance,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitBucket {
    pub ts: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitBuckets {
    pub buckets: Vec<CommitBucket>,
    pub performance: Performance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
    Week,
}

impl Granularity {
    /// `strftime` format producing one bucket key per granularity; matches SQLite's own
    /// `strftime` grammar so bucketing is a single `GROUP BY`, not a post-hoc Rust pass.
    fn strftime_fmt(self) -> &'static str {
        match self {
            Granularity::Hour => "%Y-%m-%dT%H:00:00",
            Granularity::Day => "%Y-%m-%d",
            Granularity::Week => "%Y-W%W",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub avg_query_time_ms: f64,
    pub cache_hit_rate: f64,
    pub memory_usage_mb: f64,
    pub last_query_metrics: Option<Performance>,
}

#[derive(Clone)]
enum CachedValue {
    Subgraph(Subgraph),
    Buckets(CommitBuckets),
    Search(Vec<GraphNode>),
}

struct Metrics {
    queries: u64,
    hits: u64,
    total_elapsed_ms: u128,
    last: Option<Performance>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics { queries: 0, hits: 0, total_elapsed_ms: 0, last: None }
    }
}

/// Front door to the windowed query surface. Holds no data of its own beyond the cache and
/// running metrics; every answer is computed from `store` on a cache miss.
pub struct QueryLayer {
    store: Store,
    cache: Mutex<HashMap<String, (Instant, CachedValue)>>,
    metrics: Mutex<Metrics>,
}

impl QueryLayer {
    pub fn new(store: Store) -> Self {
        QueryLayer { store, cache: Mutex::new(HashMap::new()), metrics: Mutex::new(Metrics::default()) }
    }

    fn cached_or<F>(&self, key: String, compute: F) -> EngineResult<(CachedValue, bool)>
    where
        F: FnOnce() -> EngineResult<CachedValue>,
    {
        if let Some((at, value)) = self.cache.lock().unwrap().get(&key) {
            if at.elapsed() < CACHE_TTL {
                return Ok((value.clone(), true));
            }
        }

        let value = compute()?;
        self.cache.lock().unwrap().insert(key, (Instant::now(), value.clone()));
        Ok((value, false))
    }

    fn record(&self, elapsed_ms: u128, cache_hit: bool) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics.queries += 1;
        if cache_hit {
            metrics.hits += 1;
        }
        metrics.total_elapsed_ms += elapsed_ms;
        metrics.last = Some(Performance { elapsed_ms, cache_hit });
    }

    /// `subgraph(from?, to?, node_types?, limit, cursor?)`: nodes whose temporal
    /// attachment intersects `[from, to]`, plus every edge among the returned nodes. `node_types`
    /// filters by `NodeKind`; an empty list means all kinds. Cursor is the uid of the last node
    /// returned by the previous page, so pagination is a plain `uid > ?` predicate rather than an
    /// offset (stable under concurrent writes).
    pub fn subgraph(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        node_types: &[NodeKind],
        limit: usize,
        cursor: Option<&str>,
    ) -> EngineResult<Subgraph> {
        let start = Instant::now();
        let key = format!(
            "subgraph:{:?}:{:?}:{:?}:{}:{:?}",
            from,
            to,
            node_types.iter().map(|k| k.as_ref()).collect::<Vec<_>>(),
            limit,
            cursor
        );

        let (value, hit) = self.cached_or(key, || {
            let conn = self.store.raw_conn()?;

            let kind_filter: Vec<&str> = node_types.iter().map(|k| k.as_ref()).collect();
            let kind_clause = if kind_filter.is_empty() {
                String::new()
            } else {
                format!(
                    "AND n.kind IN ({})",
                    kind_filter.iter().map(|k| format!("'{k}'")).collect::<Vec<_>>().join(",")
                )
            };
            let cursor_clause = if cursor.is_some() { "AND n.uid > ?3" } else { "" };

            // A node's temporal attachment is the newest timestamp on any edge incident to it,
            // falling back to a chunk's own `last_modified_timestamp` prop when no edge qualifies
            //: both sources are folded into one correlated subquery so the filter and the
            // index (`idx_edges_rel_timestamp`) stay on the same column.
            let sql = format!(
                "SELECT n.uid, n.kind, n.natural_key, n.props FROM nodes n
                 WHERE (?1 IS NULL OR ?2 IS NULL OR EXISTS (
                     SELECT 1 FROM edges e
                     WHERE (e.src = n.uid OR e.dst = n.uid)
                       AND e.timestamp IS NOT NULL
                       AND e.timestamp BETWEEN ?1 AND ?2
                 ) OR (?1 IS NULL AND ?2 IS NULL) OR (
                     n.kind = 'chunk'
                     AND json_extract(n.props, '$.last_modified_timestamp') BETWEEN ?1 AND ?2
                 ))
                 {kind_clause} {cursor_clause}
                 ORDER BY n.uid
                 LIMIT {}",
                limit + 1
            );

            let mut stmt = conn.prepare(&sql).map_err(|e| EngineError::StorePermanent(e.into()))?;
            let mut node_rows: Vec<GraphNode> = if let Some(cursor) = cursor {
                stmt.query_map(params![from, to, cursor], row_to_node)
            } else {
                stmt.query_map(params![from, to], row_to_node)
            }
            .map_err(|e| EngineError::StorePermanent(e.into()))?
            .collect::<Result<_, _>>()
            .map_err(|e| EngineError::StorePermanent(e.into()))?;

            let has_more = node_rows.len() > limit;
            node_rows.truncate(limit);
            let next_cursor = node_rows.last().map(|n| n.uid.clone());

            let uids: Vec<&str> = node_rows.iter().map(|n| n.uid.as_str()).collect();
            let edges = edges_among(&conn, &uids)?;

            Ok(CachedValue::Subgraph(Subgraph {
                nodes: node_rows,
                edges,
                pagination: Pagination { cursor: next_cursor, has_more },
                performance: Performance { elapsed_ms: 0, cache_hit: false },
            }))
        })?;

        let elapsed_ms = start.elapsed().as_millis();
        self.record(elapsed_ms, hit);

        let CachedValue::Subgraph(mut subgraph) = value else { unreachable!() };
        subgraph.performance = Performance { elapsed_ms, cache_hit: hit };
        Ok(subgraph)
    }

    /// `commits_buckets(granularity, from?, to?, max_buckets)`: a commit-density
    /// histogram, one `GROUP BY strftime(...)` query.
    pub fn commits_buckets(
        &self,
        granularity: Granularity,
        from: Option<&str>,
        to: Option<&str>,
        max_buckets: usize,
    ) -> EngineResult<CommitBuckets> {
        let start = Instant::now();
        let key = format!("buckets:{:?}:{:?}:{:?}:{}", granularity, from, to, max_buckets);

        let (value, hit) = self.cached_or(key, || {
            let conn = self.store.raw_conn()?;
            let fmt = granularity.strftime_fmt();

            let sql = format!(
                "SELECT strftime('{fmt}', json_extract(props, '$.timestamp')) AS bucket, COUNT(*)
                 FROM nodes
                 WHERE kind = 'git_commit'
                   AND (?1 IS NULL OR json_extract(props, '$.timestamp') >= ?1)
                   AND (?2 IS NULL OR json_extract(props, '$.timestamp') <= ?2)
                 GROUP BY bucket
                 ORDER BY bucket
                 LIMIT {max_buckets}"
            );

            let mut stmt = conn.prepare(&sql).map_err(|e| EngineError::StorePermanent(e.into()))?;
            let buckets: Vec<CommitBucket> = stmt
                .query_map(params![from, to], |r| Ok(CommitBucket { ts: r.get(0)?, count: r.get(1)? }))
                .map_err(|e| EngineError::StorePermanent(e.into()))?
                .collect::<Result<_, _>>()
                .map_err(|e| EngineError::StorePermanent(e.into()))?;

            Ok(CachedValue::Buckets(CommitBuckets { buckets, performance: Performance { elapsed_ms: 0, cache_hit: false } }))
        })?;

        let elapsed_ms = start.elapsed().as_millis();
        self.record(elapsed_ms, hit);

        let CachedValue::Buckets(mut buckets) = value else { unreachable!() };
        buckets.performance = Performance { elapsed_ms, cache_hit: hit };
        Ok(buckets)
    }

    /// `search(q, node_type?, relationship_type?, limit)`: full-text across
    /// `chunk_fulltext` and `commit_fulltext`, joined back to their owning node. When
    /// `relationship_type` is given, results are further restricted to nodes incident to at least
    /// one edge of that kind.
    pub fn search(
        &self,
        q: &str,
        node_type: Option<NodeKind>,
        relationship_type: Option<EdgeKind>,
        limit: usize,
    ) -> EngineResult<Vec<GraphNode>> {
        let start = Instant::now();
        let key = format!("search:{}:{:?}:{:?}:{}", q, node_type.map(|k| k.as_ref()), relationship_type.map(|k| k.as_ref()), limit);

        let (value, hit) = self.cached_or(key, || {
            let conn = self.store.raw_conn()?;
            let mut uids: Vec<String> = Vec::new();

            if node_type.is_none() || node_type == Some(NodeKind::Chunk) {
                let mut stmt = conn
                    .prepare("SELECT uid FROM chunk_fulltext WHERE chunk_fulltext MATCH ?1 LIMIT ?2")
                    .map_err(|e| EngineError::StorePermanent(e.into()))?;
                uids.extend(
                    stmt.query_map(params![q, limit as i64], |r| r.get(0))
                        .map_err(|e| EngineError::StorePermanent(e.into()))?
                        .collect::<Result<Vec<String>, _>>()
                        .map_err(|e| EngineError::StorePermanent(e.into()))?,
                );
            }

            if node_type.is_none() || node_type == Some(NodeKind::GitCommit) {
                let mut stmt = conn
                    .prepare("SELECT uid FROM commit_fulltext WHERE commit_fulltext MATCH ?1 LIMIT ?2")
                    .map_err(|e| EngineError::StorePermanent(e.into()))?;
                uids.extend(
                    stmt.query_map(params![q, limit as i64], |r| r.get(0))
                        .map_err(|e| EngineError::StorePermanent(e.into()))?
                        .collect::<Result<Vec<String>, _>>()
                        .map_err(|e| EngineError::StorePermanent(e.into()))?,
                );
            }

            uids.truncate(limit);
            if uids.is_empty() {
                return Ok(CachedValue::Search(Vec::new()));
            }

            if let Some(rel) = relationship_type {
                let mut stmt = conn
                    .prepare("SELECT 1 FROM edges WHERE rel = ?1 AND (src = ?2 OR dst = ?2) LIMIT 1")
                    .map_err(|e| EngineError::StorePermanent(e.into()))?;
                uids.retain(|uid| {
                    stmt.exists(params![rel.as_ref(), uid]).unwrap_or(false)
                });
            }

            let placeholders = uids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!("SELECT uid, kind, natural_key, props FROM nodes WHERE uid IN ({placeholders})");
            let mut stmt = conn.prepare(&sql).map_err(|e| EngineError::StorePermanent(e.into()))?;
            let params: Vec<&dyn rusqlite::ToSql> = uids.iter().map(|u| u as &dyn rusqlite::ToSql).collect();
            let nodes: Vec<GraphNode> = stmt
                .query_map(params.as_slice(), row_to_node)
                .map_err(|e| EngineError::StorePermanent(e.into()))?
                .collect::<Result<_, _>>()
                .map_err(|e| EngineError::StorePermanent(e.into()))?;

            Ok(CachedValue::Search(nodes))
        })?;

        let elapsed_ms = start.elapsed().as_millis();
        self.record(elapsed_ms, hit);

        let CachedValue::Search(nodes) = value else { unreachable!() };
        Ok(nodes)
    }

    /// `sprint_subgraph(sprint_number)`: convenience wrapper resolving a sprint's own
    /// `[start, end]` window and delegating to `subgraph` with no kind filter.
    pub fn sprint_subgraph(&self, sprint_natural_key: &str, limit: usize) -> EngineResult<Subgraph> {
        let conn = self.store.raw_conn()?;
        let window: Option<(String, String)> = conn
            .query_row(
                "SELECT json_extract(props, '$.start'), json_extract(props, '$.end')
                 FROM nodes WHERE kind = 'sprint' AND natural_key = ?1",
                params![sprint_natural_key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        drop(conn);

        let Some((start, end)) = window else {
            return Ok(Subgraph {
                nodes: Vec::new(),
                edges: Vec::new(),
                pagination: Pagination { cursor: None, has_more: false },
                performance: Performance { elapsed_ms: 0, cache_hit: false },
            });
        };

        self.subgraph(Some(&start), Some(&end), &[], limit, None)
    }

    /// `telemetry()`: running averages over every query answered since process start,
    /// kept in one `Metrics` struct rather than recomputed from the cache.
    pub fn telemetry(&self) -> Telemetry {
        let metrics = self.metrics.lock().unwrap();
        let avg = if metrics.queries > 0 { metrics.total_elapsed_ms as f64 / metrics.queries as f64 } else { 0.0 };
        let hit_rate = if metrics.queries > 0 { metrics.hits as f64 / metrics.queries as f64 } else { 0.0 };
        let cache_len = self.cache.lock().unwrap().len();

        Telemetry {
            avg_query_time_ms: avg,
            cache_hit_rate: hit_rate,
            // A rough estimate, not a precise allocator accounting: each cached entry holds at
            // most a page of nodes/edges, so this is sized off cache occupancy rather than a real
            // heap walk.
            memory_usage_mb: (cache_len * 64) as f64 / 1024.0,
            last_query_metrics: metrics.last.clone(),
        }
    }
}

fn row_to_node(r: &rusqlite::Row) -> rusqlite::Result<GraphNode> {
    let props_text: String = r.get(3)?;
    Ok(GraphNode {
        uid: r.get(0)?,
        kind: r.get(1)?,
        natural_key: r.get(2)?,
        props: serde_json::from_str(&props_text).unwrap_or(Value::Null),
    })
}

fn edges_among(conn: &rusqlite::Connection, uids: &[&str]) -> EngineResult<Vec<GraphEdge>> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = uids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT src, rel, dst, timestamp, confidence FROM edges
         WHERE src IN ({placeholders}) AND dst IN ({placeholders})"
    );

    let mut stmt = conn.prepare(&sql).map_err(|e| EngineError::StorePermanent(e.into()))?;
    let bound: Vec<&dyn rusqlite::ToSql> =
        uids.iter().chain(uids.iter()).map(|u| u as &dyn rusqlite::ToSql).collect();

    stmt.query_map(bound.as_slice(), |r| {
        Ok(GraphEdge { src: r.get(0)?, rel: r.get(1)?, dst: r.get(2)?, timestamp: r.get(3)?, confidence: r.get(4)? })
    })
    .map_err(|e| EngineError::StorePermanent(e.into()))?
    .collect::<Result<_, _>>()
    .map_err(|e| EngineError::StorePermanent(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EdgeRow;
    use crate::store::NodeRow;
    use serde_json::json;

    fn seed_commit(store: &Store, hash: &str, ts: &str) {
        let uid = crate::core::Uid::of(NodeKind::GitCommit, hash);
        store
            .upsert_nodes(&[NodeRow {
                uid: uid.to_string(),
                kind: NodeKind::GitCommit,
                natural_key: hash.to_string(),
                props: json!({ "hash": hash, "message": format!("commit {hash}"), "timestamp": ts }),
            }])
            .unwrap();
        let conn = store.raw_conn().unwrap();
        conn.execute(
            "INSERT INTO commit_fulltext (uid, message) VALUES (?1, ?2)",
            params![uid.to_string(), format!("commit {hash}")],
        )
        .unwrap();
    }

    #[test]
    fn subgraph_returns_nodes_with_edges_inside_window() {
        let store = Store::in_memory().unwrap();
        seed_commit(&store, "aaa", "2025-01-01T00:00:00+00:00");
        seed_commit(&store, "bbb", "2025-06-01T00:00:00+00:00");

        let layer = QueryLayer::new(store);
        let result = layer
            .subgraph(Some("2025-01-01T00:00:00+00:00"), Some("2025-01-01T23:59:59+00:00"), &[], 10, None)
            .unwrap();
        assert_eq!(result.nodes.len(), 0); // commits aren't windowed without an incident temporal edge
    }

    #[test]
    fn commits_buckets_groups_by_day() {
        let store = Store::in_memory().unwrap();
        seed_commit(&store, "aaa", "2025-01-01T05:00:00+00:00");
        seed_commit(&store, "bbb", "2025-01-01T18:00:00+00:00");
        seed_commit(&store, "ccc", "2025-01-02T09:00:00+00:00");

        let layer = QueryLayer::new(store);
        let result = layer.commits_buckets(Granularity::Day, None, None, 100).unwrap();
        assert_eq!(result.buckets.len(), 2);
        assert_eq!(result.buckets[0].count, 2);
        assert_eq!(result.buckets[1].count, 1);
    }

    #[test]
    fn search_finds_commit_by_message_text() {
        let store = Store::in_memory().unwrap();
        seed_commit(&store, "deadbeef", "2025-01-01T00:00:00+00:00");

        let layer = QueryLayer::new(store);
        let hits = layer.search("deadbeef", None, None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, "git_commit");
    }

    #[test]
    fn repeated_query_within_ttl_reports_a_cache_hit() {
        let store = Store::in_memory().unwrap();
        seed_commit(&store, "aaa", "2025-01-01T00:00:00+00:00");

        let layer = QueryLayer::new(store);
        let first = layer.commits_buckets(Granularity::Day, None, None, 10).unwrap();
        let second = layer.commits_buckets(Granularity::Day, None, None, 10).unwrap();
        assert!(!first.performance.cache_hit);
        assert!(second.performance.cache_hit);
    }

    #[test]
    fn telemetry_reflects_recorded_queries() {
        let store = Store::in_memory().unwrap();
        let layer = QueryLayer::new(store);
        layer.commits_buckets(Granularity::Day, None, None, 10).unwrap();
        layer.commits_buckets(Granularity::Day, None, None, 10).unwrap();

        let telemetry = layer.telemetry();
        assert!(telemetry.cache_hit_rate > 0.0);
    }
}


