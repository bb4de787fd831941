//! Relationship Deriver: evidence-accumulating inference over the graph the
//! earlier stages wrote. Every derived edge is produced by one of a small, closed set of
//! evidence sources (the `Evidence` enum below), a small closed-tag enum in the same spirit as
//! `EdgeKind`/`NodeKind` in `core.rs`, with per-variant, not per-call, behaviour. Families run
//! in a fixed order — `IMPLEMENTS` → `EVOLVES_FROM` → `DEPENDS_ON` → mention edges →
//! `RELATES_TO` → `CO_OCCURS_WITH` — and each reads and advances its own watermark so a second
//! run over unchanged history is a no-op.

use std::collections::HashMap;
use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde_json::json;

use crate::core::EdgeKind;
use crate::core::NodeKind;
use crate::core::Uid;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::store::EdgeRow;
use crate::store::NodeRow;
use crate::store::Store;

lazy_static! {
    static ref REQUIREMENT_ID: Regex = Regex::new(r"FR-\d+-\d+").unwrap();
    static ref EVOLUTION_PATTERN: Regex =
        Regex::new(r"(?i)(?:replaces|supersedes|evolves from)\s+(FR-\d+-\d+)").unwrap();
}

/// The fixed, closed set of evidence a derived edge can be backed by. Each variant's confidence
/// is the number the family descriptions give for its "canonical" use (`IMPLEMENTS`'s
/// commit-message match, `DEPENDS_ON`'s import-graph overlap, and so on); a handful of call
/// sites below that reuse the same kind of evidence at a different strength (the `EVOLVES_FROM`
/// doc-evolution rule, quoted at `0.6` rather than `DocMention`'s `0.5`) pass a literal instead of
/// `Evidence::confidence()`, noted at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    CommitMessage,
    DocMention,
    CodeComment,
    SprintWindow,
    ImportGraph,
    GitRename,
}

impl Evidence {
    pub const fn confidence(self) -> f64 {
        match self {
            Evidence::CommitMessage => 0.9,
            Evidence::DocMention => 0.5,
            Evidence::CodeComment => 0.8,
            Evidence::SprintWindow => 0.3,
            Evidence::ImportGraph => 0.8,
            Evidence::GitRename => 0.9,
        }
    }

    pub const fn source_tag(self) -> &'static str {
        match self {
            Evidence::CommitMessage => "commit-message",
            Evidence::DocMention => "doc-mention",
            Evidence::CodeComment => "code-comment",
            Evidence::SprintWindow => "sprint-window",
            Evidence::ImportGraph => "import-graph",
            Evidence::GitRename => "git-rename",
        }
    }
}

/// Complementary-probability confidence composition: `1 - (1-prev)·(1-c)`. `Store::upsert_edge`
/// applies this same rule internally; it's exposed here too as a pure function so it can be unit
/// tested in isolation from SQLite.
pub fn compose_confidence(prev: f64, c: f64) -> f64 {
    1.0 - (1.0 - prev) * (1.0 - c)
}

#[derive(Debug, Default, Clone)]
pub struct FamilyCounts {
    pub implements: usize,
    pub evolves_from: usize,
    pub depends_on: usize,
    pub mentions: usize,
    pub relates_to: usize,
    pub co_occurs_with: usize,
}

#[derive(Debug, Default, Clone)]
pub struct DeriveReport {
    pub counts: FamilyCounts,
    pub confidence_low: usize,
    pub confidence_medium: usize,
    pub confidence_high: usize,
    pub elapsed_ms: u128,
}

/// Run every derivation family in the fixed order. `dry_run=true` wraps
/// the whole pass in one rolled-back transaction so counts are still accurate but nothing is
/// persisted.
pub fn derive_relationships(store: &Store, run_id: &str, dry_run: bool) -> EngineResult<DeriveReport> {
    let start = std::time::Instant::now();
    // A single connection for the entire pass: every family reads its watermark and writes its
    // edges against this one connection, so `dry_run`'s rollback genuinely covers every write
    // instead of racing a second pooled connection for the same writes.
    let conn = store.raw_conn()?;

    if dry_run {
        conn.execute_batch("BEGIN;").map_err(|e| EngineError::StorePermanent(e.into()))?;
    }

    let mut report = DeriveReport::default();

    report.counts.implements = derive_implements(&conn, run_id)?;
    report.counts.evolves_from = derive_evolves_from(&conn, run_id)?;
    report.counts.depends_on = derive_depends_on(&conn, run_id)?;
    report.counts.mentions = derive_mentions(&conn, run_id)?;
    report.counts.relates_to = derive_relates_to(&conn, run_id)?;
    report.counts.co_occurs_with = derive_co_occurs_with(&conn)?;

    let (low, medium, high) = confidence_histogram(&conn)?;
    report.confidence_low = low;
    report.confidence_medium = medium;
    report.confidence_high = high;

    if dry_run {
        conn.execute_batch("ROLLBACK;").map_err(|e| EngineError::StorePermanent(e.into()))?;
    }

    report.elapsed_ms = start.elapsed().as_millis();
    Ok(report)
}

fn requirement_node(conn: &Connection, id: &str) -> EngineResult<Uid> {
    let uid = Uid::of(NodeKind::Requirement, id);
    crate::store::upsert_nodes_conn(
        conn,
        &[NodeRow {
            uid: uid.to_string(),
            kind: NodeKind::Requirement,
            natural_key: id.to_string(),
            props: json!({ "id": id }),
        }],
    )?;
    Ok(uid)
}

fn evidence_edge(
    conn: &Connection,
    src: Uid,
    rel: EdgeKind,
    dst: Uid,
    evidence: Evidence,
    confidence_override: Option<f64>,
    ts: Option<&str>,
) -> EngineResult<()> {
    crate::store::upsert_edge_conn(
        conn,
        &EdgeRow {
            src: src.to_string(),
            rel,
            dst: dst.to_string(),
            timestamp: ts.map(String::from),
            props: json!({}),
            sources: vec![evidence.source_tag().to_string()],
            confidence: Some(confidence_override.unwrap_or_else(|| evidence.confidence())),
            first_seen_ts: None,
            last_seen_ts: None,
        },
        ts,
    )
}

/// Timestamp to anchor a doc-mention/code-comment `IMPLEMENTS` edge on: reuse an
/// already-derived edge's timestamp for the same requirement/file pair if one exists (so the
/// new evidence composes onto it), otherwise fall back to the file's most recent `TOUCHED`
/// timestamp. Returns `None` for a file with no commit history yet, in which case the caller
/// skips the edge rather than writing a structural edge with no timestamp.
fn implements_anchor_ts(conn: &Connection, req_uid: Uid, file_uid: Uid) -> EngineResult<Option<String>> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT timestamp FROM edges WHERE src = ?1 AND rel = 'IMPLEMENTS' AND dst = ?2 AND timestamp IS NOT NULL LIMIT 1",
            params![req_uid.to_string(), file_uid.to_string()],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    if existing.is_some() {
        return Ok(existing);
    }

    conn.query_row(
        "SELECT MAX(timestamp) FROM edges WHERE rel = 'TOUCHED' AND dst = ?1",
        params![file_uid.to_string()],
        |r| r.get(0),
    )
    .map_err(|e| EngineError::StorePermanent(e.into()))
}

fn read_watermark(conn: &Connection, family: &str) -> EngineResult<Option<String>> {
    conn.query_row("SELECT last_ts FROM watermarks WHERE family = ?1", params![family], |r| r.get(0))
        .optional()
        .map_err(|e| EngineError::StorePermanent(e.into()))
        .map(Option::flatten)
}

fn write_watermark(conn: &Connection, family: &str, last_ts: &str, run_id: &str) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO watermarks (family, last_ts, last_run_id) VALUES (?1, ?2, ?3)
         ON CONFLICT(family) DO UPDATE SET last_ts = excluded.last_ts, last_run_id = excluded.last_run_id",
        params![family, last_ts, run_id],
    )
    .map_err(|e| EngineError::StorePermanent(e.into()))?;
    Ok(())
}

/// `IMPLEMENTS` (Requirement → File), commit-message, doc-mention, code-comment and
/// sprint-window rules.
fn derive_implements(conn: &Connection, run_id: &str) -> EngineResult<usize> {
    let since = read_watermark(conn, "implements")?;
    let mut count = 0usize;
    let mut newest_ts: Option<String> = since.clone();

    let mut stmt = conn
        .prepare(
            "SELECT uid, json_extract(props,'$.hash'), json_extract(props,'$.message'), json_extract(props,'$.timestamp')
             FROM nodes WHERE kind = 'git_commit' AND (?1 IS NULL OR json_extract(props,'$.timestamp') > ?1)",
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    let commits: Vec<(String, String, String, String)> = stmt
        .query_map(params![since], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    for (commit_uid, _hash, message, ts) in &commits {
        let ids: HashSet<&str> = REQUIREMENT_ID.find_iter(message).map(|m| m.as_str()).collect();
        if ids.is_empty() {
            continue;
        }

        let mut touched_stmt = conn
            .prepare("SELECT dst FROM edges WHERE src = ?1 AND rel = 'TOUCHED'")
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        let touched: Vec<String> = touched_stmt
            .query_map(params![commit_uid], |r| r.get(0))
            .map_err(|e| EngineError::StorePermanent(e.into()))?
            .collect::<Result<_, _>>()
            .map_err(|e| EngineError::StorePermanent(e.into()))?;

        for id in ids {
            let req_uid = requirement_node(conn, id)?;
            for file_uid in &touched {
                let file_uid = parse_uid(file_uid)?;
                evidence_edge(conn, req_uid, EdgeKind::Implements, file_uid, Evidence::CommitMessage, None, Some(ts))?;
                count += 1;
            }
        }

        if newest_ts.as_deref().map(|n| ts.as_str() > n).unwrap_or(true) {
            newest_ts = Some(ts.clone());
        }
    }

    // Doc-mention and code-comment rules: scan chunk text for requirement ids, and for any file
    // path substring also present in the same chunk, treat the chunk as evidence the requirement
    // touches that file.
    let mut chunk_stmt = conn
        .prepare("SELECT json_extract(props,'$.text'), json_extract(props,'$.path') FROM nodes WHERE kind = 'chunk'")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let chunks: Vec<(Option<String>, Option<String>)> = chunk_stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    let mut file_stmt = conn
        .prepare("SELECT uid, json_extract(props,'$.path'), json_extract(props,'$.lang') FROM nodes WHERE kind = 'file'")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let files: Vec<(String, String, Option<String>)> = file_stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    for (text, chunk_path) in chunks.iter().flatten_text() {
        let ids: Vec<&str> = REQUIREMENT_ID.find_iter(text).map(|m| m.as_str()).collect();
        if ids.is_empty() {
            continue;
        }

        let is_code_chunk = chunk_path
            .as_deref()
            .map(|p| crate::languages::Lang::of(p).map(crate::languages::Lang::is_code).unwrap_or(false))
            .unwrap_or(false);

        for (file_uid, file_path, _lang) in &files {
            if !text.contains(file_path.as_str()) {
                continue;
            }

            for id in &ids {
                let req_uid = requirement_node(conn, id)?;
                let file_uid = parse_uid(file_uid)?;
                let evidence = if is_code_chunk { Evidence::CodeComment } else { Evidence::DocMention };
                // IMPLEMENTS is a temporal edge kind; anchor it on the file's most recent
                // TOUCHED timestamp (or an already-derived IMPLEMENTS edge's timestamp, so a
                // later doc/comment pass composes onto the commit-message edge instead of
                // opening a second, untimestamped row for the same requirement/file pair).
                let ts = implements_anchor_ts(conn, req_uid, file_uid)?;
                if let Some(ts) = ts.as_deref() {
                    evidence_edge(conn, req_uid, EdgeKind::Implements, file_uid, evidence, None, Some(ts))?;
                    count += 1;
                }
            }
        }
    }

    if let Some(ts) = newest_ts {
        write_watermark(conn, "implements", &ts, run_id)?;
    }

    Ok(count)
}

fn derive_evolves_from(conn: &Connection, run_id: &str) -> EngineResult<usize> {
    let since = read_watermark(conn, "evolves_from")?;
    let mut count = 0usize;
    let mut newest_ts = since.clone();

    let mut stmt = conn
        .prepare(
            "SELECT json_extract(props,'$.message'), json_extract(props,'$.timestamp')
             FROM nodes WHERE kind = 'git_commit' AND (?1 IS NULL OR json_extract(props,'$.timestamp') > ?1)",
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let commits: Vec<(String, String)> = stmt
        .query_map(params![since], |r| Ok((r.get(0)?, r.get(1)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    for (message, ts) in &commits {
        if let Some(caps) = EVOLUTION_PATTERN.captures(message) {
            let old_id = caps[1].to_string();
            let new_id = REQUIREMENT_ID
                .find_iter(message)
                .map(|m| m.as_str().to_string())
                .find(|id| id != &old_id);

            if let Some(new_id) = new_id {
                let old_uid = requirement_node(conn, &old_id)?;
                let new_uid = requirement_node(conn, &new_id)?;
                evidence_edge(conn, new_uid, EdgeKind::EvolvesFrom, old_uid, Evidence::CommitMessage, None, Some(ts))?;
                count += 1;
            }
        }

        if newest_ts.as_deref().map(|n| ts.as_str() > n).unwrap_or(true) {
            newest_ts = Some(ts.clone());
        }
    }

    let mut chunk_stmt = conn
        .prepare("SELECT json_extract(props,'$.text') FROM nodes WHERE kind = 'chunk'")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let chunks: Vec<Option<String>> = chunk_stmt
        .query_map([], |r| r.get(0))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    for text in chunks.into_iter().flatten() {
        let ids: Vec<&str> = REQUIREMENT_ID.find_iter(&text).map(|m| m.as_str()).collect();
        if ids.len() < 2 {
            continue;
        }
        // First mention is treated as the earlier requirement, second as its evolution, absent
        // per-id first-seen bookkeeping at the document level.
        let old_uid = requirement_node(conn, ids[0])?;
        let new_uid = requirement_node(conn, ids[1])?;
        // 0.6 here, not `Evidence::DocMention`'s 0.5: this rule's own confidence figure differs
        // from the IMPLEMENTS family's doc-mention rule even though both read a document mention.
        evidence_edge(conn, new_uid, EdgeKind::EvolvesFrom, old_uid, Evidence::DocMention, Some(0.6), None)?;
        count += 1;
    }

    if let Some(ts) = newest_ts {
        write_watermark(conn, "evolves_from", &ts, run_id)?;
    }

    Ok(count)
}

/// `DEPENDS_ON` (Requirement → Requirement) via import-graph overlap.
fn derive_depends_on(conn: &Connection, run_id: &str) -> EngineResult<usize> {
    let mut count = 0usize;

    let mut req_stmt = conn
        .prepare("SELECT uid FROM nodes WHERE kind = 'requirement'")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let requirements: Vec<String> = req_stmt
        .query_map([], |r| r.get(0))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    let implemented_files = |conn: &Connection, req_uid: &str| -> EngineResult<Vec<String>> {
        let mut stmt = conn
            .prepare("SELECT dst FROM edges WHERE src = ?1 AND rel = 'IMPLEMENTS'")
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        stmt.query_map(params![req_uid], |r| r.get(0))
            .map_err(|e| EngineError::StorePermanent(e.into()))?
            .collect::<Result<_, _>>()
            .map_err(|e| EngineError::StorePermanent(e.into()))
    };

    for r1 in &requirements {
        let files_1 = implemented_files(conn, r1)?;
        if files_1.is_empty() {
            continue;
        }

        for r2 in &requirements {
            if r1 == r2 {
                continue;
            }
            let files_2 = implemented_files(conn, r2)?;
            if files_2.is_empty() {
                continue;
            }

            let files_2_set: HashSet<&str> = files_2.iter().map(String::as_str).collect();
            let mut overlap_count = 0usize;
            for f1 in &files_1 {
                let mut stmt = conn
                    .prepare("SELECT dst FROM edges WHERE src = ?1 AND rel = 'IMPORTS'")
                    .map_err(|e| EngineError::StorePermanent(e.into()))?;
                let imports: Vec<String> = stmt
                    .query_map(params![f1], |r| r.get(0))
                    .map_err(|e| EngineError::StorePermanent(e.into()))?
                    .collect::<Result<_, _>>()
                    .map_err(|e| EngineError::StorePermanent(e.into()))?;
                overlap_count += imports.iter().filter(|i| files_2_set.contains(i.as_str())).count();
            }

            let threshold = (2usize).max((0.3 * files_1.len() as f64).ceil() as usize);
            if overlap_count >= threshold {
                let r1_uid = parse_uid(r1)?;
                let r2_uid = parse_uid(r2)?;
                evidence_edge(conn, r1_uid, EdgeKind::DependsOn, r2_uid, Evidence::ImportGraph, None, None)?;
                count += 1;
            }
        }
    }

    write_watermark(conn, "depends_on", &chrono::Utc::now().to_rfc3339(), run_id)?;
    Ok(count)
}

/// Mention edges (`MENTIONS_SYMBOL`/`MENTIONS_FILE`/`MENTIONS_COMMIT`/`MENTIONS_LIBRARY`), driven
/// by the `chunk_fulltext` index.
fn derive_mentions(conn: &Connection, run_id: &str) -> EngineResult<usize> {
    let mut count = 0usize;

    let mut chunk_stmt = conn
        .prepare("SELECT uid, content FROM chunk_fulltext")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let chunk_texts: Vec<(String, String)> = chunk_stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    for (target_kind, target_rel, name_expr) in [
        ("symbol", EdgeKind::MentionsSymbol, "$.name"),
        ("file", EdgeKind::MentionsFile, "$.path"),
        ("library", EdgeKind::MentionsLibrary, "$.name"),
    ] {
        let mut target_stmt = conn
            .prepare(&format!("SELECT uid, json_extract(props, '{name_expr}') FROM nodes WHERE kind = ?1"))
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        let targets: Vec<(String, Option<String>)> = target_stmt
            .query_map(params![target_kind], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(|e| EngineError::StorePermanent(e.into()))?
            .collect::<Result<_, _>>()
            .map_err(|e| EngineError::StorePermanent(e.into()))?;

        for (target_uid, name) in targets {
            let Some(name) = name.filter(|n| n.len() >= 3) else { continue };
            let short = basename(&name);

            for (chunk_uid, text) in &chunk_texts {
                let chunk_uid = parse_uid(chunk_uid)?;
                let target_uid = parse_uid(&target_uid)?;

                if text.contains(&name) {
                    evidence_edge(conn, chunk_uid, target_rel, target_uid, Evidence::CommitMessage, Some(0.7), None)?;
                    count += 1;
                } else if short.len() >= 3 && text.contains(short) {
                    evidence_edge(conn, chunk_uid, target_rel, target_uid, Evidence::CommitMessage, Some(0.4), None)?;
                    count += 1;
                }
            }
        }
    }

    // MENTIONS_COMMIT: chunk text contains a commit's full or short hash.
    let mut commit_stmt = conn
        .prepare("SELECT uid, json_extract(props,'$.hash') FROM nodes WHERE kind = 'git_commit'")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let commits: Vec<(String, String)> = commit_stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    for (commit_uid, hash) in commits {
        let short = &hash[..hash.len().min(7)];
        for (chunk_uid, text) in &chunk_texts {
            let chunk_uid = parse_uid(chunk_uid)?;
            let commit_uid = parse_uid(&commit_uid)?;

            if text.contains(&hash) {
                evidence_edge(conn, chunk_uid, EdgeKind::MentionsCommit, commit_uid, Evidence::CommitMessage, Some(0.7), None)?;
                count += 1;
            } else if text.contains(short) {
                evidence_edge(conn, chunk_uid, EdgeKind::MentionsCommit, commit_uid, Evidence::CommitMessage, Some(0.4), None)?;
                count += 1;
            }
        }
    }

    write_watermark(conn, "mentions", &chrono::Utc::now().to_rfc3339(), run_id)?;
    Ok(count)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `RELATES_TO` (Chunk → File) when a chunk mentions a library a file also uses.
fn derive_relates_to(conn: &Connection, run_id: &str) -> EngineResult<usize> {
    let mut count = 0usize;

    let mut stmt = conn
        .prepare(
            "SELECT m.src, u.dst FROM edges m
             JOIN edges u ON u.dst = m.dst AND u.rel = 'USES_LIBRARY'
             WHERE m.rel = 'MENTIONS_LIBRARY'",
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    let pairs: Vec<(String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    for (chunk_uid, file_uid) in pairs {
        let chunk_uid = parse_uid(&chunk_uid)?;
        let file_uid = parse_uid(&file_uid)?;
        evidence_edge(conn, chunk_uid, EdgeKind::RelatesTo, file_uid, Evidence::DocMention, Some(0.4), None)?;
        count += 1;
    }

    write_watermark(conn, "relates_to", &chrono::Utc::now().to_rfc3339(), run_id)?;
    Ok(count)
}

/// `CO_OCCURS_WITH` (File → File), recomputed directly as a pairwise shared-commit count rather
/// than composed evidence-by-evidence: the edge's confidence is `min(1, count/10)`
/// of the current total, so it's overwritten, not composed, on each run.
fn derive_co_occurs_with(conn: &Connection) -> EngineResult<usize> {
    let mut stmt = conn
        .prepare("SELECT src, dst FROM edges WHERE rel = 'TOUCHED'")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let touched: Vec<(String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    let mut files_by_commit: HashMap<&str, Vec<&str>> = HashMap::new();
    for (commit, file) in &touched {
        files_by_commit.entry(commit.as_str()).or_default().push(file.as_str());
    }

    let mut pair_counts: HashMap<(String, String), usize> = HashMap::new();
    for files in files_by_commit.values() {
        let mut sorted = files.clone();
        sorted.sort_unstable();
        sorted.dedup();
        for i in 0..sorted.len() {
            for j in (i + 1)..sorted.len() {
                *pair_counts.entry((sorted[i].to_string(), sorted[j].to_string())).or_insert(0) += 1;
            }
        }
    }

    let mut count = 0usize;
    for ((a, b), shared) in &pair_counts {
        let confidence = (*shared as f64 / 10.0).min(1.0);
        for (src, dst) in [(a, b), (b, a)] {
            conn.execute(
                "INSERT INTO edges (src, rel, dst, timestamp, props, sources, confidence, first_seen_ts, last_seen_ts)
                 VALUES (?1, 'CO_OCCURS_WITH', ?2, NULL, ?3, ?4, ?5, NULL, NULL)
                 ON CONFLICT(src, rel, dst, timestamp) DO UPDATE SET
                   confidence = excluded.confidence, props = excluded.props",
                params![src, dst, json!({ "shared_commits": shared }).to_string(), json!(["co-occurrence"]).to_string(), confidence],
            )
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        }
        count += 1;
    }

    Ok(count)
}

fn confidence_histogram(conn: &Connection) -> EngineResult<(usize, usize, usize)> {
    let mut stmt = conn
        .prepare("SELECT confidence FROM edges WHERE confidence IS NOT NULL")
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    let values: Vec<f64> = stmt
        .query_map([], |r| r.get(0))
        .map_err(|e| EngineError::StorePermanent(e.into()))?
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    let low = values.iter().filter(|&&c| c < 0.3).count();
    let medium = values.iter().filter(|&&c| (0.3..0.7).contains(&c)).count();
    let high = values.iter().filter(|&&c| c >= 0.7).count();
    Ok((low, medium, high))
}

fn parse_uid(hex: &str) -> EngineResult<Uid> {
    let bytes = hex::decode(hex).map_err(|e| EngineError::Other(e.into()))?;
    let arr: [u8; 20] = bytes.try_into().map_err(|_| EngineError::Other(anyhow::anyhow!("malformed uid")))?;
    Ok(Uid(arr))
}

trait FlattenText {
    fn flatten_text(self) -> Vec<(String, Option<String>)>;
}

impl FlattenText for &Vec<(Option<String>, Option<String>)> {
    fn flatten_text(self) -> Vec<(String, Option<String>)> {
        self.iter().filter_map(|(t, p)| t.clone().map(|t| (t, p.clone()))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_confidence_with_complementary_probability_rule() {
        let composed = compose_confidence(0.9, 0.5);
        assert!((composed - 0.95).abs() < 1e-9);
    }

    #[test]
    fn evidence_confidences_match_family_descriptions() {
        assert_eq!(Evidence::CommitMessage.confidence(), 0.9);
        assert_eq!(Evidence::DocMention.confidence(), 0.5);
        assert_eq!(Evidence::CodeComment.confidence(), 0.8);
        assert_eq!(Evidence::SprintWindow.confidence(), 0.3);
        assert_eq!(Evidence::ImportGraph.confidence(), 0.8);
    }

    #[test]
    fn derives_implements_edge_from_commit_message_and_touched_file() {
        let store = Store::in_memory().unwrap();
        let file_uid = Uid::of(NodeKind::File, "search.py");
        store
            .upsert_nodes(&[NodeRow {
                uid: file_uid.to_string(),
                kind: NodeKind::File,
                natural_key: "search.py".into(),
                props: json!({ "path": "search.py" }),
            }])
            .unwrap();

        let commit_uid = Uid::of(NodeKind::GitCommit, "abc123");
        store
            .upsert_nodes(&[NodeRow {
                uid: commit_uid.to_string(),
                kind: NodeKind::GitCommit,
                natural_key: "abc123".into(),
                props: json!({
                    "hash": "abc123",
                    "message": "Implement FR-01-02 across search.py",
                    "timestamp": "2025-01-01T00:00:00+00:00",
                }),
            }])
            .unwrap();

        store
            .upsert_edge(
                &EdgeRow {
                    src: commit_uid.to_string(),
                    rel: EdgeKind::Touched,
                    dst: file_uid.to_string(),
                    timestamp: Some("2025-01-01T00:00:00+00:00".into()),
                    props: json!({}),
                    sources: Vec::new(),
                    confidence: None,
                    first_seen_ts: None,
                    last_seen_ts: None,
                },
                Some("2025-01-01T00:00:00+00:00"),
            )
            .unwrap();

        let report = derive_relationships(&store, "run-1", false).unwrap();
        assert_eq!(report.counts.implements, 1);
        assert_eq!(store.edge_count(EdgeKind::Implements).unwrap(), 1);
    }

    #[test]
    fn dry_run_leaves_graph_unmodified() {
        let store = Store::in_memory().unwrap();
        let report = derive_relationships(&store, "run-1", true).unwrap();
        assert_eq!(report.counts.implements, 0);
        assert_eq!(store.edge_count(EdgeKind::Implements).unwrap(), 0);
    }

    #[test]
    fn doc_mention_implements_edge_composes_onto_commit_message_edge_with_a_timestamp() {
        let store = Store::in_memory().unwrap();
        let file_uid = Uid::of(NodeKind::File, "search.py");
        store
            .upsert_nodes(&[NodeRow {
                uid: file_uid.to_string(),
                kind: NodeKind::File,
                natural_key: "search.py".into(),
                props: json!({ "path": "search.py" }),
            }])
            .unwrap();

        let commit_uid = Uid::of(NodeKind::GitCommit, "abc123");
        store
            .upsert_nodes(&[NodeRow {
                uid: commit_uid.to_string(),
                kind: NodeKind::GitCommit,
                natural_key: "abc123".into(),
                props: json!({
                    "hash": "abc123",
                    "message": "Implement FR-01-02 across search.py",
                    "timestamp": "2025-01-01T00:00:00+00:00",
                }),
            }])
            .unwrap();

        store
            .upsert_edge(
                &EdgeRow {
                    src: commit_uid.to_string(),
                    rel: EdgeKind::Touched,
                    dst: file_uid.to_string(),
                    timestamp: Some("2025-01-01T00:00:00+00:00".into()),
                    props: json!({}),
                    sources: Vec::new(),
                    confidence: None,
                    first_seen_ts: None,
                    last_seen_ts: None,
                },
                Some("2025-01-01T00:00:00+00:00"),
            )
            .unwrap();

        let chunk_uid = Uid::of(NodeKind::Chunk, "search.py#0");
        store
            .upsert_nodes(&[NodeRow {
                uid: chunk_uid.to_string(),
                kind: NodeKind::Chunk,
                natural_key: "search.py#0".into(),
                props: json!({ "path": "search.py", "text": "# implements FR-01-02 via search.py\n" }),
            }])
            .unwrap();

        let report = derive_relationships(&store, "run-1", false).unwrap();
        assert_eq!(report.counts.implements, 1);
        assert_eq!(store.edge_count(EdgeKind::Implements).unwrap(), 1);

        let conn = store.raw_conn().unwrap();
        let (timestamp, confidence): (Option<String>, Option<f64>) = conn
            .query_row("SELECT timestamp, confidence FROM edges WHERE rel = 'IMPLEMENTS'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(timestamp.as_deref(), Some("2025-01-01T00:00:00+00:00"));
        assert!((confidence.unwrap() - 0.95).abs() < 1e-9);
    }
}


