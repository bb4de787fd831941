//! Black-box pipeline tests: build a throwaway git repository on disk, run `Engine::bootstrap`
//! against it, and assert on the invariants and end-to-end scenarios a full run must satisfy.

use std::path::Path;
use std::process::Command;

use pretty_assertions::assert_eq;

use devgraph::config::Config;
use devgraph::config::ConfigLayer;
use devgraph::core::EdgeKind;
use devgraph::core::NodeKind;
use devgraph::orchestrator::BootstrapOptions;
use devgraph::orchestrator::CancelToken;
use devgraph::orchestrator::Engine;
use devgraph::orchestrator::JobRegistry;
use devgraph::query::Granularity;
use devgraph::query::QueryLayer;

fn run(dir: &Path, args: &[&str]) {
    let status = Command::new("git").current_dir(dir).args(args).status().unwrap();
    assert!(status.success());
}

fn run_with_dates(dir: &Path, args: &[&str], date: &str) {
    let status = Command::new("git")
        .current_dir(dir)
        .env("GIT_AUTHOR_DATE", date)
        .env("GIT_COMMITTER_DATE", date)
        .args(args)
        .status()
        .unwrap();
    assert!(status.success());
}

fn init_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    run(dir.path(), &["init", "-q"]);
    run(dir.path(), &["config", "user.email", "a@b.c"]);
    run(dir.path(), &["config", "user.name", "Test"]);
    dir
}

fn engine_for(dir: &Path) -> Engine {
    let config = Config::resolve(ConfigLayer { repo_path: Some(dir.to_path_buf()), ..Default::default() }).unwrap();
    Engine::open(config).unwrap()
}

fn bootstrap(engine: &Engine) {
    let registry = JobRegistry::new();
    let cancel = CancelToken::new();
    engine.bootstrap(&registry, &cancel, &BootstrapOptions::default()).unwrap();
}

#[test]
fn evidence_accumulates_into_one_implements_edge_with_composed_confidence() {
    let dir = init_repo();
    std::fs::write(dir.path().join("search.py"), "def search():\n    pass\n").unwrap();
    run(dir.path(), &["add", "."]);
    run(dir.path(), &["commit", "-q", "-m", "Implement FR-01-02 across search.py"]);

    std::fs::write(dir.path().join("notes.md"), "# Notes\n\nFR-01-02 covers search.py end to end.\n").unwrap();
    run(dir.path(), &["add", "."]);
    run(dir.path(), &["commit", "-q", "-m", "add notes"]);

    let engine = engine_for(dir.path());
    bootstrap(&engine);

    assert_eq!(engine.store().edge_count(EdgeKind::Implements).unwrap(), 1);

    let conn = engine.store().raw_conn().unwrap();
    let (sources, confidence, timestamp): (String, f64, Option<String>) = conn
        .query_row("SELECT sources, confidence, timestamp FROM edges WHERE rel = 'IMPLEMENTS'", [], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .unwrap();
    let sources: Vec<String> = serde_json::from_str(&sources).unwrap();
    assert!(sources.contains(&"commit-message".to_string()));
    assert!(sources.contains(&"doc-mention".to_string()));
    assert!((confidence - 0.95).abs() < 1e-9);
    assert!(timestamp.is_some());
}

#[test]
fn sprint_window_includes_only_commits_inside_its_date_range() {
    let dir = init_repo();
    std::fs::create_dir_all(dir.path().join("sprint-07")).unwrap();
    std::fs::write(
        dir.path().join("sprint-07/index.md"),
        "# Sprint 07\n\n2025-06-01 to 2025-06-14\n",
    )
    .unwrap();
    run(dir.path(), &["add", "."]);
    run_with_dates(dir.path(), &["commit", "-q", "-m", "sprint 07 planning"], "2025-05-30T09:00:00");

    std::fs::write(dir.path().join("in_window.py"), "x = 1\n").unwrap();
    run(dir.path(), &["add", "."]);
    run_with_dates(dir.path(), &["commit", "-q", "-m", "work during sprint"], "2025-06-05T10:00:00");

    std::fs::write(dir.path().join("out_of_window.py"), "y = 2\n").unwrap();
    run(dir.path(), &["add", "."]);
    run_with_dates(dir.path(), &["commit", "-q", "-m", "work after sprint"], "2025-07-01T10:00:00");

    let engine = engine_for(dir.path());
    bootstrap(&engine);

    let conn = engine.store().raw_conn().unwrap();
    let included: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM edges e
             JOIN nodes s ON s.uid = e.src AND s.kind = 'sprint'
             JOIN nodes c ON c.uid = e.dst AND c.kind = 'git_commit'
             WHERE e.rel = 'INCLUDES'
               AND json_extract(c.props, '$.message') = 'work during sprint'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(included, 1);

    let excluded: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM edges e
             JOIN nodes s ON s.uid = e.src AND s.kind = 'sprint'
             JOIN nodes c ON c.uid = e.dst AND c.kind = 'git_commit'
             WHERE e.rel = 'INCLUDES'
               AND json_extract(c.props, '$.message') = 'work after sprint'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(excluded, 0);
}

#[test]
fn rename_produces_a_refactored_to_edge_and_touched_attaches_to_the_new_file() {
    let dir = init_repo();
    std::fs::write(dir.path().join("old.py"), "x = 1\ny = 2\nz = 3\n".repeat(5)).unwrap();
    run(dir.path(), &["add", "."]);
    run(dir.path(), &["commit", "-q", "-m", "add old"]);

    run(dir.path(), &["mv", "old.py", "new.py"]);
    run(dir.path(), &["commit", "-q", "-m", "rename"]);

    let engine = engine_for(dir.path());
    bootstrap(&engine);

    assert_eq!(engine.store().edge_count(EdgeKind::RefactoredTo).unwrap(), 1);

    let conn = engine.store().raw_conn().unwrap();
    let renamed_sources: String = conn
        .query_row("SELECT sources FROM edges WHERE rel = 'REFACTORED_TO'", [], |r| r.get(0))
        .unwrap();
    let renamed_sources: Vec<String> = serde_json::from_str(&renamed_sources).unwrap();
    assert_eq!(renamed_sources, vec!["git-rename".to_string()]);

    let touched_new: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM edges e JOIN nodes f ON f.uid = e.dst
             WHERE e.rel = 'TOUCHED' AND f.natural_key = 'new.py'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(touched_new, 1);
}

#[test]
fn repeated_bootstrap_over_an_unchanged_repo_is_idempotent() {
    let dir = init_repo();
    std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
    run(dir.path(), &["add", "."]);
    run(dir.path(), &["commit", "-q", "-m", "Implement FR-02-01 in a.py"]);

    let engine = engine_for(dir.path());
    bootstrap(&engine);
    let stats_first = engine.stats().unwrap();

    bootstrap(&engine);
    let stats_second = engine.stats().unwrap();

    assert_eq!(stats_first.total_nodes, stats_second.total_nodes);
    assert_eq!(stats_first.total_edges, stats_second.total_edges);
    assert_eq!(stats_first.nodes_by_kind, stats_second.nodes_by_kind);
    assert_eq!(stats_first.edges_by_kind, stats_second.edges_by_kind);
}

#[test]
fn dry_run_reports_counts_but_writes_nothing() {
    let dir = init_repo();
    std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
    run(dir.path(), &["add", "."]);
    run(dir.path(), &["commit", "-q", "-m", "Implement FR-03-01 in a.py"]);

    let engine = engine_for(dir.path());
    let registry = JobRegistry::new();
    let cancel = CancelToken::new();
    let options = BootstrapOptions { derive_relationships: Some(false), ..Default::default() };
    engine.bootstrap(&registry, &cancel, &options).unwrap();
    assert_eq!(engine.store().edge_count(EdgeKind::Implements).unwrap(), 0);

    let report = engine.derive_relationships_only("dry-run-1", true).unwrap();
    assert!(report.counts.implements > 0);
    assert_eq!(engine.store().edge_count(EdgeKind::Implements).unwrap(), 0);
}

#[test]
fn empty_repository_bootstraps_to_all_zero_counts() {
    let dir = init_repo();

    let engine = engine_for(dir.path());
    bootstrap(&engine);

    let stats = engine.stats().unwrap();
    assert_eq!(stats.total_nodes, 0);
    assert_eq!(stats.total_edges, 0);
}

#[test]
fn duplicate_ingestion_of_the_same_commit_is_a_no_op_at_the_edge_level() {
    let dir = init_repo();
    std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
    run(dir.path(), &["add", "."]);
    run(dir.path(), &["commit", "-q", "-m", "add a"]);

    let engine = engine_for(dir.path());
    bootstrap(&engine);
    assert_eq!(engine.store().edge_count(EdgeKind::Touched).unwrap(), 1);

    // same commit hash, nothing new on disk: a second bootstrap must not duplicate the edge.
    bootstrap(&engine);
    assert_eq!(engine.store().edge_count(EdgeKind::Touched).unwrap(), 1);
}

#[test]
fn rename_chain_across_three_commits_produces_two_refactored_to_edges() {
    let dir = init_repo();
    let body = "x = 1\ny = 2\nz = 3\n".repeat(5);
    std::fs::write(dir.path().join("a.py"), &body).unwrap();
    run(dir.path(), &["add", "."]);
    run(dir.path(), &["commit", "-q", "-m", "add a"]);

    run(dir.path(), &["mv", "a.py", "b.py"]);
    run(dir.path(), &["commit", "-q", "-m", "rename a to b"]);

    run(dir.path(), &["mv", "b.py", "c.py"]);
    run(dir.path(), &["commit", "-q", "-m", "rename b to c"]);

    let engine = engine_for(dir.path());
    bootstrap(&engine);

    assert_eq!(engine.store().edge_count(EdgeKind::RefactoredTo).unwrap(), 2);

    let conn = engine.store().raw_conn().unwrap();
    let touched_c: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM edges e JOIN nodes f ON f.uid = e.dst
             WHERE e.rel = 'TOUCHED' AND f.natural_key = 'c.py'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(touched_c, 1);
}

#[test]
fn windowed_subgraph_query_returns_promptly_against_a_small_repo() {
    let dir = init_repo();
    for i in 0..20 {
        std::fs::write(dir.path().join(format!("file_{i}.py")), format!("x = {i}\n")).unwrap();
        run(dir.path(), &["add", "."]);
        run_with_dates(
            dir.path(),
            &["commit", "-q", "-m", &format!("commit {i}")],
            &format!("2025-01-{:02}T09:00:00", (i % 28) + 1),
        );
    }

    let engine = engine_for(dir.path());
    bootstrap(&engine);

    let layer = QueryLayer::new(engine.store().clone());
    let start = std::time::Instant::now();
    let result = layer
        .subgraph(Some("2025-01-01T00:00:00"), Some("2025-01-31T23:59:59"), &[NodeKind::File], 2000, None)
        .unwrap();
    assert!(start.elapsed().as_millis() < 2000);
    assert!(!result.nodes.is_empty());

    let buckets = layer.commits_buckets(Granularity::Day, None, None, 365).unwrap();
    assert!(!buckets.buckets.is_empty());
}
