//! Thin HTTP/RPC contract surface. Every handler is a shim over `Engine`/`QueryLayer`
//! methods; no graph or pipeline logic lives in this module.

use std::sync::Arc;

use axum::extract::Path as AxumPath;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::core::EdgeKind;
use crate::core::NodeKind;
use crate::derive::DeriveReport;
use crate::errors::EngineError;
use crate::orchestrator::BootstrapOptions;
use crate::orchestrator::CancelToken;
use crate::orchestrator::DeriveReportSummary;
use crate::orchestrator::Engine;
use crate::orchestrator::Job;
use crate::orchestrator::JobRegistry;
use crate::query::Granularity;
use crate::query::QueryLayer;

/// Everything a handler needs: one `Engine` bound to one repository, its job table, and the
/// read-side query layer sharing the same store.
pub struct AppState {
    engine: Engine,
    registry: JobRegistry,
    query: QueryLayer,
}

impl AppState {
    pub fn new(engine: Engine) -> Arc<Self> {
        let query = QueryLayer::new(engine.store().clone());
        Arc::new(AppState { engine, registry: JobRegistry::new(), query })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ingest/bootstrap", post(ingest_bootstrap))
        .route("/ingest/start", post(ingest_start))
        .route("/ingest/derive-relationships", post(ingest_derive_relationships))
        .route("/ingest/status/:job_id", get(ingest_status))
        .route("/subgraph", get(subgraph))
        .route("/commits/buckets", get(commits_buckets))
        .route("/search", get(search))
        .route("/validate/schema", get(validate_schema))
        .route("/validate/temporal", get(validate_temporal))
        .route("/validate/relationships", get(validate_relationships))
        .route("/cleanup/orphans", post(cleanup_orphans))
        .route("/stats", get(stats))
        .route("/analytics", get(analytics))
        .with_state(state)
}

/// `EngineError` rendered as `{kind, stage?, details, retryable}`, with the process exit-code
/// table's error kinds reused as the HTTP error taxonomy so CLI and HTTP report the same thing.
#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    stage: Option<&'static str>,
    details: String,
    retryable: bool,
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Configuration(_) => StatusCode::BAD_REQUEST,
            EngineError::RepositoryUnreadable(_) => StatusCode::NOT_FOUND,
            EngineError::StoreTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::JobAlreadyRunning => StatusCode::CONFLICT,
            EngineError::Cancelled => StatusCode::from_u16(499).unwrap(),
            EngineError::StorePermanent(_)
            | EngineError::Decoding { .. }
            | EngineError::Derivation { .. }
            | EngineError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            kind: self.0.kind(),
            stage: None,
            details: self.0.to_string(),
            retryable: self.0.retryable(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Deserialize)]
struct BootstrapBody {
    #[serde(flatten)]
    options: BootstrapOptions,
}

#[derive(Serialize)]
struct JobAccepted {
    job_id: Uuid,
}

/// POST `/ingest/bootstrap`: run the eight-stage pipeline synchronously and return once it's
/// done. Body carries the per-run overrides in `BootstrapOptions`.
async fn ingest_bootstrap(
    State(state): State<Arc<AppState>>,
    body: Option<Json<BootstrapBody>>,
) -> ApiResult<JobAccepted> {
    let options = body.map(|Json(b)| b.options).unwrap_or_default();
    let job_id = tokio::task::spawn_blocking(move || {
        state.engine.bootstrap(&state.registry, &CancelToken::new(), &options)
    })
    .await
    .map_err(|e| ApiError(EngineError::Other(anyhow::anyhow!(e))))??;

    Ok(Json(JobAccepted { job_id }))
}

/// POST `/ingest/start`: identical pipeline, run on a background thread; the response carries the
/// `job_id` immediately and callers poll `/ingest/status/{job_id}`.
async fn ingest_start(
    State(state): State<Arc<AppState>>,
    body: Option<Json<BootstrapBody>>,
) -> ApiResult<JobAccepted> {
    let options = body.map(|Json(b)| b.options).unwrap_or_default();

    // Allocate the job id up front so it can be returned before the pipeline runs; the
    // background thread drives it to completion and records progress via the registry, polled
    // through `/ingest/status/{job_id}`.
    let job_id = state.registry.begin(state.engine.repo_path())?;

    let spawned_state = state.clone();
    std::thread::spawn(move || {
        let cancel = CancelToken::new();
        let _ = spawned_state.engine.run_bootstrap(&spawned_state.registry, job_id, &cancel, &options);
    });

    Ok(Json(JobAccepted { job_id }))
}

#[derive(Deserialize, Default)]
struct DeriveBody {
    #[allow(dead_code)]
    since_timestamp: Option<String>,
    dry_run: Option<bool>,
    #[allow(dead_code)]
    strategies: Option<Vec<String>>,
}

#[derive(Serialize)]
struct DeriveResponse {
    run_id: String,
    report: DeriveReportSummary,
}

/// POST `/ingest/derive-relationships`: run only Stage 8 against whatever the store already
/// holds.
async fn ingest_derive_relationships(
    State(state): State<Arc<AppState>>,
    body: Option<Json<DeriveBody>>,
) -> ApiResult<DeriveResponse> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let dry_run = body.dry_run.unwrap_or(false);
    let run_id = Uuid::new_v4().to_string();

    let run_id_for_blocking = run_id.clone();
    let report: DeriveReport = tokio::task::spawn_blocking(move || {
        state.engine.derive_relationships_only(&run_id_for_blocking, dry_run)
    })
    .await
    .map_err(|e| ApiError(EngineError::Other(anyhow::anyhow!(e))))??;

    Ok(Json(DeriveResponse { run_id, report: (&report).into() }))
}

#[derive(Serialize)]
struct JobStatusBody {
    status: &'static str,
    stages_completed: Vec<String>,
    progress: Option<String>,
    duration_seconds: f64,
}

impl From<Job> for JobStatusBody {
    fn from(job: Job) -> Self {
        let status = match job.status {
            crate::orchestrator::JobStatus::Running => "running",
            crate::orchestrator::JobStatus::Done => "done",
            crate::orchestrator::JobStatus::Failed => "failed",
        };
        let end = job.finished_at.unwrap_or_else(chrono::Utc::now);
        let duration_seconds = (end - job.started_at).num_milliseconds() as f64 / 1000.0;

        JobStatusBody {
            status,
            stages_completed: job.progress.stages_completed.iter().map(|s| format!("{s:?}")).collect(),
            progress: job.progress.current_stage.map(|s| format!("{s:?}")),
            duration_seconds,
        }
    }
}

/// GET `/ingest/status/{job_id}`.
async fn ingest_status(
    State(state): State<Arc<AppState>>,
    AxumPath(job_id): AxumPath<Uuid>,
) -> Result<Json<JobStatusBody>, StatusCode> {
    state.registry.get(job_id).map(|job| Json(job.into())).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct SubgraphQuery {
    from: Option<String>,
    to: Option<String>,
    node_types: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
}

/// GET `/subgraph`.
async fn subgraph(State(state): State<Arc<AppState>>, Query(q): Query<SubgraphQuery>) -> ApiResult<crate::query::Subgraph> {
    let kinds = parse_node_kinds(q.node_types.as_deref());
    let result = state.query.subgraph(q.from.as_deref(), q.to.as_deref(), &kinds, q.limit.unwrap_or(100), q.cursor.as_deref())?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct BucketsQuery {
    granularity: Option<String>,
    from: Option<String>,
    to: Option<String>,
    max_buckets: Option<usize>,
}

/// GET `/commits/buckets`.
async fn commits_buckets(State(state): State<Arc<AppState>>, Query(q): Query<BucketsQuery>) -> ApiResult<crate::query::CommitBuckets> {
    let granularity = match q.granularity.as_deref() {
        Some("hour") => Granularity::Hour,
        Some("week") => Granularity::Week,
        _ => Granularity::Day,
    };
    let result = state.query.commits_buckets(granularity, q.from.as_deref(), q.to.as_deref(), q.max_buckets.unwrap_or(500))?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    node_type: Option<String>,
    relationship_type: Option<String>,
    limit: Option<usize>,
}

/// GET `/search`.
async fn search(State(state): State<Arc<AppState>>, Query(q): Query<SearchQuery>) -> ApiResult<Vec<crate::query::GraphNode>> {
    let node_type = q.node_type.as_deref().and_then(|s| <NodeKind as std::str::FromStr>::from_str(s).ok());
    let relationship_type = q.relationship_type.as_deref().and_then(|s| <EdgeKind as std::str::FromStr>::from_str(s).ok());
    let result = state.query.search(&q.q, node_type, relationship_type, q.limit.unwrap_or(50))?;
    Ok(Json(result))
}

/// GET `/validate/schema`.
async fn validate_schema(State(state): State<Arc<AppState>>) -> ApiResult<crate::orchestrator::ValidationReport> {
    Ok(Json(state.engine.validate_schema()?))
}

/// GET `/validate/temporal`.
async fn validate_temporal(State(state): State<Arc<AppState>>) -> ApiResult<crate::orchestrator::ValidationReport> {
    Ok(Json(state.engine.validate_temporal()?))
}

/// GET `/validate/relationships`.
async fn validate_relationships(State(state): State<Arc<AppState>>) -> ApiResult<crate::orchestrator::ValidationReport> {
    Ok(Json(state.engine.validate_relationships()?))
}

#[derive(Serialize)]
struct OrphansRemoved {
    removed: usize,
}

/// POST `/cleanup/orphans`: delete nodes with no incident edge.
async fn cleanup_orphans(State(state): State<Arc<AppState>>) -> ApiResult<OrphansRemoved> {
    let removed = state.engine.cleanup_orphans()?;
    Ok(Json(OrphansRemoved { removed }))
}

/// GET `/stats`.
async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<crate::orchestrator::Stats> {
    Ok(Json(state.engine.stats()?))
}

/// GET `/analytics`.
async fn analytics(State(state): State<Arc<AppState>>) -> ApiResult<crate::orchestrator::Analytics> {
    Ok(Json(state.engine.analytics()?))
}

fn parse_node_kinds(csv: Option<&str>) -> Vec<NodeKind> {
    csv.map(|s| s.split(',').filter_map(|k| <NodeKind as std::str::FromStr>::from_str(k.trim()).ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_node_kinds_ignores_unknown_tokens() {
        let kinds = parse_node_kinds(Some("file,bogus,chunk"));
        assert_eq!(kinds, vec![NodeKind::File, NodeKind::Chunk]);
    }

    #[test]
    fn parse_node_kinds_on_none_is_empty() {
        assert!(parse_node_kinds(None).is_empty());
    }
}


