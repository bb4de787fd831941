//! Pipeline Orchestrator & Job Registry: sequences the eight stages for a bootstrap or
//! incremental run, tracks progress through a `Job` record, and rejects a second concurrent
//! bootstrap against the same repository. The orchestrator itself is single-threaded and
//! advances one stage at a time; each stage does its own internal fan-out (walk/chunk/temporal
//! already spawn worker threads, so the orchestrator just calls them and joins).

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use indicatif::MultiProgress;
use serde::Serialize;
use uuid::Uuid;

use crate::chunking;
use crate::config::Config;
use crate::core::NodeKind;
use crate::core::Uid as GraphUid;
use crate::derive;
use crate::derive::DeriveReport;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::git_history::GitHistoryService;
use crate::sprint;
use crate::store::Store;
use crate::symbols;
use crate::walk;
use crate::walk::Classification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    SchemaManager,
    GitHistoryService,
    ChunkIngester,
    TemporalEngine,
    SprintMapper,
    SymbolLibraryExtractor,
    RelationshipDeriver,
    WindowedQueryLayer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct StageProgress {
    pub current_stage: Option<StageName>,
    pub stages_completed: Vec<StageName>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: StageProgress,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
    pub derive_report: Option<DeriveReportSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeriveReportSummary {
    pub implements: usize,
    pub evolves_from: usize,
    pub depends_on: usize,
    pub mentions: usize,
    pub relates_to: usize,
    pub co_occurs_with: usize,
    pub elapsed_ms: u128,
}

impl From<&DeriveReport> for DeriveReportSummary {
    fn from(r: &DeriveReport) -> Self {
        DeriveReportSummary {
            implements: r.counts.implements,
            evolves_from: r.counts.evolves_from,
            depends_on: r.counts.depends_on,
            mentions: r.counts.mentions,
            relates_to: r.counts.relates_to,
            co_occurs_with: r.counts.co_occurs_with,
            elapsed_ms: r.elapsed_ms,
        }
    }
}

/// In-memory job table. A second bootstrap against a repo already running is rejected
/// with `JobAlreadyRunning` rather than queued.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
    running_repos: Arc<Mutex<std::collections::HashSet<std::path::PathBuf>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn begin(&self, repo_path: &std::path::Path) -> EngineResult<Uuid> {
        let mut running = self.running_repos.lock().unwrap();
        if running.contains(repo_path) {
            return Err(EngineError::JobAlreadyRunning);
        }
        running.insert(repo_path.to_path_buf());

        let id = Uuid::new_v4();
        let job = Job {
            id,
            status: JobStatus::Running,
            progress: StageProgress::default(),
            started_at: chrono::Utc::now(),
            finished_at: None,
            error: None,
            derive_report: None,
        };
        self.jobs.lock().unwrap().insert(id, job);
        Ok(id)
    }

    fn update_progress(&self, id: Uuid, stage: StageName) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
            job.progress.current_stage = Some(stage);
            job.progress.stages_completed.push(stage);
        }
    }

    fn finish(&self, id: Uuid, repo_path: &std::path::Path, result: &EngineResult<DeriveReport>) {
        self.running_repos.lock().unwrap().remove(repo_path);
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
            job.finished_at = Some(chrono::Utc::now());
            match result {
                Ok(report) => {
                    job.status = JobStatus::Done;
                    job.derive_report = Some(report.into());
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(e.to_string());
                }
            }
        }
    }
}

/// Cooperative cancellation flag checked between batches within a stage. Cloned into every
/// worker pool a stage spawns.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run overrides accepted by the HTTP `/ingest/bootstrap` and `/ingest/start` bodies;
/// any field left `None` falls back to the `Engine`'s own resolved `Config`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct BootstrapOptions {
    pub commit_limit: Option<usize>,
    pub derive_relationships: Option<bool>,
    pub dry_run: Option<bool>,
}

/// Extension point between symbol extraction and relationship derivation for a future
/// embedding-generation stage. `Engine` always holds one and invokes it every bootstrap, but
/// `NullEmbedder` does no work: nothing currently in this crate consumes embeddings.
pub trait Stage7Embedder: Send + Sync {
    fn embed(&self, store: &Store) -> EngineResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullEmbedder;

impl Stage7Embedder for NullEmbedder {
    fn embed(&self, _store: &Store) -> EngineResult<()> {
        Ok(())
    }
}

/// Owns the pipeline's store and git service and runs the eight stages in order. One `Engine`
/// per repository; the HTTP layer and CLI both drive it the same way.
pub struct Engine {
    store: Store,
    git: GitHistoryService,
    config: Config,
    progress: MultiProgress,
    embedder: Box<dyn Stage7Embedder>,
}

impl Engine {
    pub fn open(config: Config) -> EngineResult<Self> {
        let store = Store::open(&config.store_path())?;
        if config.reset_graph {
            store.reset()?;
        }

        let git = GitHistoryService::open(&config.repo_path)?;
        Ok(Engine { store, git, config, progress: MultiProgress::new(), embedder: Box::new(NullEmbedder) })
    }

    /// Swap in a real `Stage7Embedder`. `Engine::open` registers `NullEmbedder` by default.
    pub fn with_embedder(mut self, embedder: Box<dyn Stage7Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn repo_path(&self) -> &std::path::Path {
        &self.config.repo_path
    }

    /// Run all eight stages once. Synchronous: returns only once the whole pipeline,
    /// including Stage 8 derivation, has completed or failed.
    pub fn bootstrap(&self, registry: &JobRegistry, cancel: &CancelToken, options: &BootstrapOptions) -> EngineResult<Uuid> {
        let job_id = registry.begin(&self.config.repo_path)?;
        self.run_bootstrap(registry, job_id, cancel, options).map(|_| job_id)
    }

    /// Run the pipeline against a job id allocated ahead of time by the caller, so the id is known before the pipeline finishes rather than after.
    pub fn run_bootstrap(
        &self,
        registry: &JobRegistry,
        job_id: Uuid,
        cancel: &CancelToken,
        options: &BootstrapOptions,
    ) -> EngineResult<DeriveReport> {
        let result = self.run_pipeline(registry, job_id, cancel, options);
        registry.finish(job_id, &self.config.repo_path, &result);
        result
    }

    fn run_pipeline(
        &self,
        registry: &JobRegistry,
        job_id: Uuid,
        cancel: &CancelToken,
        options: &BootstrapOptions,
    ) -> EngineResult<DeriveReport> {
        registry.update_progress(job_id, StageName::SchemaManager);
        // Schema Manager's bootstrap already ran inside `Store::open`/`Store::reset`.

        registry.update_progress(job_id, StageName::GitHistoryService);
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        registry.update_progress(job_id, StageName::ChunkIngester);
        let discovery = walk::discover(&self.config.repo_path, self.config.subpath.as_deref(), &self.config.exclude_patterns)
            .map_err(EngineError::Other)?;
        let file_uids = chunking::ingest_tree(&self.store, &discovery)?;

        let mut doc_uids_by_path: HashMap<String, GraphUid> = HashMap::new();
        let mut manifest_libraries: Vec<(String, Vec<String>)> = Vec::new();

        for file in &discovery.files {
            let bytes = match std::fs::read(&file.absolute_path) {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("failed to read {}: {e}, skipping", file.path);
                    continue;
                }
            };
            let Some(text) = walk::decode_text(&bytes) else {
                log::warn!("could not decode {} with any supported encoding, skipping", file.path);
                continue;
            };

            match &file.classification {
                Classification::Doc => {
                    // FileChunkIndex isn't needed here: symbols attach to their File directly
                    // (DEFINED_IN), and the Relationship Deriver matches against stored chunk
                    // content rather than re-deriving line ranges.
                    chunking::chunk_markdown(&self.store, &file.path, &text)?;
                    doc_uids_by_path.insert(file.path.clone(), GraphUid::of(NodeKind::Document, &file.path));
                }
                Classification::Code(lang) => {
                    chunking::chunk_source(&self.store, &file.path, &text)?;

                    let extracted_symbols = symbols::extract_symbols(*lang, &text);
                    symbols::ingest_symbols(&self.store, &file.path, &extracted_symbols)?;

                    let imports = symbols::extract_imports(*lang, &text);
                    symbols::resolve_and_ingest_imports(&self.store, &file.path, &imports, &file_uids)?;
                }
                Classification::Other => {}
            }

            if let Some(filename) = std::path::Path::new(&file.path).file_name().and_then(|n| n.to_str()) {
                let libs = symbols::parse_manifest(filename, &text);
                if !libs.is_empty() {
                    manifest_libraries.push((file.path.clone(), libs));
                }
            }
        }

        ingest_manifest_libraries(&self.store, &manifest_libraries)?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        registry.update_progress(job_id, StageName::TemporalEngine);
        let newest_commit_ts = crate::temporal::ingest_history(
            &self.store,
            &self.git,
            &file_uids,
            options.commit_limit.unwrap_or(self.config.commit_limit),
            self.config.max_workers,
            &self.progress,
        )?;
        if let Some(ts) = newest_commit_ts {
            self.store.advance_watermark("history", &ts, &job_id.to_string())?;
        }

        registry.update_progress(job_id, StageName::SprintMapper);
        let sprint_dirs = discovery
            .dirs
            .iter()
            .filter(|d| d.path.split('/').next_back().map(|n| n.starts_with("sprint")).unwrap_or(false))
            .map(|d| d.path.clone())
            .collect::<Vec<_>>();
        let sprints = sprint::discover_sprints(&self.config.repo_path, &sprint_dirs)?;
        let commit_rows = load_commits_for_sprints(&self.store)?;
        sprint::ingest_sprints(&self.store, &sprints, &doc_uids_by_path, &commit_rows)?;

        registry.update_progress(job_id, StageName::SymbolLibraryExtractor);
        // Symbol/library extraction already ran per-file above, interleaved with chunking so
        // each file's text is read from disk exactly once.
        self.embedder.embed(&self.store)?;

        registry.update_progress(job_id, StageName::RelationshipDeriver);
        let derive_relationships = options.derive_relationships.unwrap_or(self.config.derive_relationships);
        let dry_run = options.dry_run.unwrap_or(self.config.dry_run);
        let report = if derive_relationships {
            derive::derive_relationships(&self.store, &job_id.to_string(), dry_run)?
        } else {
            DeriveReport::default()
        };

        registry.update_progress(job_id, StageName::WindowedQueryLayer);
        // The query layer serves reads against whatever the above stages just wrote; nothing to
        // do here but mark the stage complete.

        Ok(report)
    }

    /// Run only Stage 8, against whatever the store already holds. `since_timestamp` and
    /// `strategies` are accepted by the HTTP body for forward compatibility but unused: the
    /// deriver always walks its own watermark-bounded range and all six ordered families.
    pub fn derive_relationships_only(&self, run_id: &str, dry_run: bool) -> EngineResult<DeriveReport> {
        derive::derive_relationships(&self.store, run_id, dry_run)
    }

    /// Schema invariants: every chunk has exactly one `CONTAINS_CHUNK` parent.
    /// Duplicate `(src, rel, dst, timestamp)` edges and out-of-range confidence can't occur in
    /// the first place, since both are enforced by the store's primary key and `CHECK` clause.
    pub fn validate_schema(&self) -> EngineResult<ValidationReport> {
        validate_schema(&self.store)
    }

    /// Temporal invariants: temporal edge kinds carry a timestamp, structural
    /// kinds never do, and every `GitCommit`'s natural key is a well-formed hash.
    pub fn validate_temporal(&self) -> EngineResult<ValidationReport> {
        validate_temporal(&self.store)
    }

    /// Relationship invariants: every derived edge (one carrying a confidence score)
    /// also carries at least one source. `requirements_without_part_of` is reported by
    /// `analytics()`, not here, per the recorded open-question decision: it is an expected
    /// residual, not a defect.
    pub fn validate_relationships(&self) -> EngineResult<ValidationReport> {
        validate_relationships(&self.store)
    }

    /// Delete nodes with no incident edge on either side. Returns the number removed.
    pub fn cleanup_orphans(&self) -> EngineResult<usize> {
        cleanup_orphans(&self.store)
    }

    /// Consolidated totals: node and edge counts by kind, each a single `GROUP BY`.
    pub fn stats(&self) -> EngineResult<Stats> {
        stats(&self.store)
    }

    /// Derived metrics: counts by type, requirement traceability coverage,
    /// and commit activity by day with the busiest day called out.
    pub fn analytics(&self) -> EngineResult<Analytics> {
        analytics(&self.store)
    }
}

fn validate_schema(store: &Store) -> EngineResult<ValidationReport> {
    let conn = store.raw_conn()?;
    let mut violations = Vec::new();

    let orphaned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM nodes n WHERE n.kind = 'chunk'
             AND NOT EXISTS (SELECT 1 FROM edges e WHERE e.rel = 'CONTAINS_CHUNK' AND e.dst = n.uid)",
            [],
            |r| r.get(0),
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    if orphaned > 0 {
        violations.push(format!("{orphaned} chunk(s) have no CONTAINS_CHUNK parent"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT dst, COUNT(DISTINCT src) AS parents FROM edges
             WHERE rel = 'CONTAINS_CHUNK' GROUP BY dst HAVING parents > 1",
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let multi_parent: Vec<String> = stmt
        .query_map([], |r| r.get(0))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    for dst in multi_parent {
        violations.push(format!("chunk {dst} has more than one CONTAINS_CHUNK parent"));
    }

    Ok(ValidationReport { ok: violations.is_empty(), violations })
}

fn validate_temporal(store: &Store) -> EngineResult<ValidationReport> {
    let conn = store.raw_conn()?;
    let mut violations = Vec::new();

    let mut stmt = conn
        .prepare("SELECT DISTINCT rel FROM edges WHERE timestamp IS NULL")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let untimestamped: Vec<String> = stmt
        .query_map([], |r| r.get(0))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    for rel in untimestamped {
        if let Ok(kind) = <crate::core::EdgeKind as std::str::FromStr>::from_str(&rel) {
            if kind.is_temporal() {
                violations.push(format!("{rel} edge(s) without a timestamp"));
            }
        }
    }

    let mut stmt = conn
        .prepare("SELECT DISTINCT rel FROM edges WHERE timestamp IS NOT NULL")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let timestamped: Vec<String> = stmt
        .query_map([], |r| r.get(0))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    for rel in timestamped {
        if let Ok(kind) = <crate::core::EdgeKind as std::str::FromStr>::from_str(&rel) {
            if !kind.is_temporal() {
                violations.push(format!("{rel} edge(s) carry a timestamp but are structural"));
            }
        }
    }

    let malformed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM nodes WHERE kind = 'git_commit'
             AND (length(natural_key) != 40 OR natural_key GLOB '*[^0-9a-f]*')",
            [],
            |r| r.get(0),
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    if malformed > 0 {
        violations.push(format!("{malformed} git_commit node(s) with a malformed hash"));
    }

    Ok(ValidationReport { ok: violations.is_empty(), violations })
}

fn validate_relationships(store: &Store) -> EngineResult<ValidationReport> {
    let conn = store.raw_conn()?;
    let mut violations = Vec::new();

    let unsourced: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM edges WHERE confidence IS NOT NULL AND sources = '[]'",
            [],
            |r| r.get(0),
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    if unsourced > 0 {
        violations.push(format!("{unsourced} derived edge(s) with a confidence score but no sources"));
    }

    Ok(ValidationReport { ok: violations.is_empty(), violations })
}

fn cleanup_orphans(store: &Store) -> EngineResult<usize> {
    let conn = store.raw_conn()?;
    conn.execute(
        "DELETE FROM nodes WHERE uid NOT IN (SELECT src FROM edges UNION SELECT dst FROM edges)",
        [],
    )
    .map_err(|e| EngineError::StorePermanent(e.into()))
}

fn stats(store: &Store) -> EngineResult<Stats> {
    let conn = store.raw_conn()?;

    let nodes_by_kind = count_by(&conn, "SELECT kind, COUNT(*) FROM nodes GROUP BY kind")?;
    let edges_by_kind = count_by(&conn, "SELECT rel, COUNT(*) FROM edges GROUP BY rel")?;
    let total_nodes = nodes_by_kind.values().sum();
    let total_edges = edges_by_kind.values().sum();

    Ok(Stats { nodes_by_kind, edges_by_kind, total_nodes, total_edges })
}

fn analytics(store: &Store) -> EngineResult<Analytics> {
    let conn = store.raw_conn()?;

    let nodes_by_kind = count_by(&conn, "SELECT kind, COUNT(*) FROM nodes GROUP BY kind")?;
    let edges_by_kind = count_by(&conn, "SELECT rel, COUNT(*) FROM edges GROUP BY rel")?;

    let total_requirements: i64 = conn
        .query_row("SELECT COUNT(*) FROM nodes WHERE kind = 'requirement'", [], |r| r.get(0))
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let requirements_with_part_of: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT src) FROM edges WHERE rel = 'PART_OF'
             AND src IN (SELECT uid FROM nodes WHERE kind = 'requirement')",
            [],
            |r| r.get(0),
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let requirements_without_part_of = total_requirements - requirements_with_part_of;
    let traceability_coverage_pct = if total_requirements > 0 {
        100.0 * requirements_with_part_of as f64 / total_requirements as f64
    } else {
        0.0
    };

    let mut stmt = conn
        .prepare(
            "SELECT strftime('%Y-%m-%d', json_extract(props, '$.timestamp')) AS day, COUNT(*)
             FROM nodes WHERE kind = 'git_commit' GROUP BY day ORDER BY day",
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let activity_per_day: Vec<(String, i64)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let peak_activity_day = activity_per_day.iter().max_by_key(|(_, count)| *count).cloned();

    Ok(Analytics {
        nodes_by_kind,
        edges_by_kind,
        traceability_coverage_pct,
        requirements_without_part_of,
        activity_per_day,
        peak_activity_day,
    })
}

fn count_by(conn: &crate::store::Pooled, sql: &str) -> EngineResult<HashMap<String, i64>> {
    let mut stmt = conn.prepare(sql).map_err(|e| EngineError::StorePermanent(e.into()))?;
    stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub nodes_by_kind: HashMap<String, i64>,
    pub edges_by_kind: HashMap<String, i64>,
    pub total_nodes: i64,
    pub total_edges: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analytics {
    pub nodes_by_kind: HashMap<String, i64>,
    pub edges_by_kind: HashMap<String, i64>,
    pub traceability_coverage_pct: f64,
    pub requirements_without_part_of: i64,
    pub activity_per_day: Vec<(String, i64)>,
    pub peak_activity_day: Option<(String, i64)>,
}

fn ingest_manifest_libraries(store: &Store, manifests: &[(String, Vec<String>)]) -> EngineResult<()> {
    use crate::core::EdgeKind;
    use crate::store::EdgeRow;
    use crate::store::NodeRow;
    use serde_json::json;

    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    for (manifest_path, libraries) in manifests {
        let manifest_uid = GraphUid::of(NodeKind::File, manifest_path);

        for library in libraries {
            let library_uid = GraphUid::of(NodeKind::Library, library);
            nodes.push(NodeRow {
                uid: library_uid.to_string(),
                kind: NodeKind::Library,
                natural_key: library.clone(),
                props: json!({ "name": library }),
            });
            edges.push(EdgeRow {
                src: manifest_uid.to_string(),
                rel: EdgeKind::UsesLibrary,
                dst: library_uid.to_string(),
                timestamp: None,
                props: json!({ "declared_in": manifest_path }),
                sources: vec!["manifest".to_string()],
                confidence: Some(1.0),
                first_seen_ts: None,
                last_seen_ts: None,
            });
        }
    }

    store.upsert_nodes(&nodes)?;
    for edge in &edges {
        store.upsert_edge(edge, None)?;
    }
    Ok(())
}

/// Pull `(commit_uid, timestamp, touched_file_uids)` triples for the Sprint Mapper, which
/// needs a commit's date to test it against a sprint window without re-walking git history.
fn load_commits_for_sprints(store: &Store) -> EngineResult<Vec<(GraphUid, chrono::DateTime<chrono::Utc>, Vec<GraphUid>)>> {
    let conn = store.raw_conn()?;
    let mut stmt = conn
        .prepare("SELECT uid, json_extract(props,'$.timestamp') FROM nodes WHERE kind = 'git_commit'")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let commits: Vec<(String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    let mut result = Vec::with_capacity(commits.len());
    for (uid_hex, ts) in commits {
        let Ok(bytes) = hex::decode(&uid_hex) else { continue };
        let Ok(arr) = <[u8; 20]>::try_from(bytes) else { continue };
        let uid = GraphUid(arr);

        let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(&ts) else { continue };

        let mut touched_stmt = conn
            .prepare("SELECT dst FROM edges WHERE src = ?1 AND rel = 'TOUCHED'")
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        let touched: Vec<String> = touched_stmt
            .query_map(rusqlite::params![uid_hex], |r| r.get(0))
            .map_err(|e| EngineError::StorePermanent(e.into()))?
            .collect::<Result<_, _>>()
            .map_err(|e| EngineError::StorePermanent(e.into()))?;

        let touched_uids = touched
            .into_iter()
            .filter_map(|hex_str| {
                let bytes = hex::decode(&hex_str).ok()?;
                let arr = <[u8; 20]>::try_from(bytes).ok()?;
                Some(GraphUid(arr))
            })
            .collect();

        result.push((uid, parsed.with_timezone(&chrono::Utc), touched_uids));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_bootstrap_against_same_repo_is_rejected() {
        let registry = JobRegistry::new();
        let repo = std::path::PathBuf::from("/tmp/some-repo");

        let first = registry.begin(&repo).unwrap();
        let second = registry.begin(&repo);
        assert!(matches!(second, Err(EngineError::JobAlreadyRunning)));

        let ok_result: EngineResult<DeriveReport> = Ok(DeriveReport::default());
        registry.finish(first, &repo, &ok_result);
        assert!(registry.begin(&repo).is_ok());
    }

    #[test]
    fn job_progress_records_stages_in_order() {
        let registry = JobRegistry::new();
        let repo = std::path::PathBuf::from("/tmp/another-repo");
        let id = registry.begin(&repo).unwrap();

        registry.update_progress(id, StageName::SchemaManager);
        registry.update_progress(id, StageName::GitHistoryService);

        let job = registry.get(id).unwrap();
        assert_eq!(job.progress.stages_completed.len(), 2);
        assert_eq!(job.progress.current_stage, Some(StageName::GitHistoryService));
    }

    #[test]
    fn cancel_token_reflects_cancellation() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn null_embedder_is_a_no_op() {
        let store = Store::in_memory().unwrap();
        assert!(NullEmbedder.embed(&store).is_ok());
        assert_eq!(store.node_count(NodeKind::File).unwrap(), 0);
    }

    fn seed(store: &Store, nodes: &[crate::store::NodeRow], edges: &[crate::store::EdgeRow]) {
        store.upsert_nodes(nodes).unwrap();
        for edge in edges {
            store.upsert_edge(edge, edge.timestamp.as_deref()).unwrap();
        }
    }

    #[test]
    fn validate_schema_flags_a_chunk_with_no_parent() {
        use crate::core::EdgeKind;
        use serde_json::json;

        let store = Store::in_memory().unwrap();
        seed(
            &store,
            &[crate::store::NodeRow {
                uid: "chunk-1".into(),
                kind: NodeKind::Chunk,
                natural_key: "doc.md#0".into(),
                props: json!({}),
            }],
            &[],
        );

        let report = validate_schema(&store).unwrap();
        assert!(!report.ok);
        assert!(report.violations[0].contains("no CONTAINS_CHUNK parent"));

        seed(
            &store,
            &[crate::store::NodeRow {
                uid: "doc-1".into(),
                kind: NodeKind::Document,
                natural_key: "doc.md".into(),
                props: json!({}),
            }],
            &[crate::store::EdgeRow {
                src: "doc-1".into(),
                rel: EdgeKind::ContainsChunk,
                dst: "chunk-1".into(),
                timestamp: None,
                props: json!({}),
                sources: vec![],
                confidence: None,
                first_seen_ts: None,
                last_seen_ts: None,
            }],
        );
        assert!(validate_schema(&store).unwrap().ok);
    }

    #[test]
    fn validate_temporal_flags_a_structural_edge_with_a_timestamp() {
        use crate::core::EdgeKind;
        use serde_json::json;

        let store = Store::in_memory().unwrap();
        seed(
            &store,
            &[
                crate::store::NodeRow { uid: "a".into(), kind: NodeKind::File, natural_key: "a".into(), props: json!({}) },
                crate::store::NodeRow { uid: "b".into(), kind: NodeKind::File, natural_key: "b".into(), props: json!({}) },
            ],
            &[crate::store::EdgeRow {
                src: "a".into(),
                rel: EdgeKind::Contains,
                dst: "b".into(),
                timestamp: Some("2025-01-01T00:00:00Z".into()),
                props: json!({}),
                sources: vec![],
                confidence: None,
                first_seen_ts: None,
                last_seen_ts: None,
            }],
        );

        let report = validate_temporal(&store).unwrap();
        assert!(!report.ok);
        assert!(report.violations.iter().any(|v| v.contains("CONTAINS")));
    }

    #[test]
    fn cleanup_orphans_removes_unreferenced_nodes() {
        use serde_json::json;

        let store = Store::in_memory().unwrap();
        seed(
            &store,
            &[crate::store::NodeRow {
                uid: "lonely".into(),
                kind: NodeKind::File,
                natural_key: "lonely.rs".into(),
                props: json!({}),
            }],
            &[],
        );

        assert_eq!(store.node_count(NodeKind::File).unwrap(), 1);
        let removed = cleanup_orphans(&store).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.node_count(NodeKind::File).unwrap(), 0);
    }

    #[test]
    fn stats_counts_nodes_by_kind() {
        use serde_json::json;

        let store = Store::in_memory().unwrap();
        seed(
            &store,
            &[
                crate::store::NodeRow { uid: "a".into(), kind: NodeKind::File, natural_key: "a".into(), props: json!({}) },
                crate::store::NodeRow { uid: "b".into(), kind: NodeKind::File, natural_key: "b".into(), props: json!({}) },
            ],
            &[],
        );

        let report = stats(&store).unwrap();
        assert_eq!(report.total_nodes, 2);
        assert_eq!(report.nodes_by_kind.get("file"), Some(&2));
    }

    #[test]
    fn analytics_reports_traceability_coverage() {
        use crate::core::EdgeKind;
        use serde_json::json;

        let store = Store::in_memory().unwrap();
        seed(
            &store,
            &[
                crate::store::NodeRow { uid: "req-1".into(), kind: NodeKind::Requirement, natural_key: "FR-01-01".into(), props: json!({}) },
                crate::store::NodeRow { uid: "req-2".into(), kind: NodeKind::Requirement, natural_key: "FR-01-02".into(), props: json!({}) },
                crate::store::NodeRow { uid: "sprint-1".into(), kind: NodeKind::Sprint, natural_key: "sprint-1".into(), props: json!({}) },
            ],
            &[crate::store::EdgeRow {
                src: "req-1".into(),
                rel: EdgeKind::PartOf,
                dst: "sprint-1".into(),
                timestamp: None,
                props: json!({}),
                sources: vec![],
                confidence: None,
                first_seen_ts: None,
                last_seen_ts: None,
            }],
        );

        let report = analytics(&store).unwrap();
        assert_eq!(report.requirements_without_part_of, 1);
        assert!((report.traceability_coverage_pct - 50.0).abs() < 1e-9);
    }
}


