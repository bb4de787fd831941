//! Temporal Engine: walks commit history oldest-first, creating one `GitCommit` node and
//! `TOUCHED` edges per touched file, plus `REFACTORED_TO` edges on renames/copies. Commits are
//! chunked across `max_workers` raw `std::thread::spawn` threads sharing a cloned `Store`
//! (backed by the `r2d2` pool, so concurrent checkouts are safe) and an `indicatif` progress bar.

use std::collections::HashMap;
use std::thread;

use indicatif::MultiProgress;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use itertools::Itertools;
use serde_json::json;

use crate::core::EdgeKind;
use crate::core::NodeKind;
use crate::core::Uid;
use crate::derive::Evidence;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::git_history::GitHistoryService;
use crate::store::EdgeRow;
use crate::store::NodeRow;
use crate::store::Store;

/// Ingest every commit in `[since, watermark]` exclusive of already-processed history, emitting
/// `GitCommit` nodes and `TOUCHED`/`REFACTORED_TO` edges. Returns the timestamp of the newest
/// commit processed, for the caller to advance the `history` watermark.
pub fn ingest_history(
    store: &Store,
    git: &GitHistoryService,
    file_uids: &HashMap<String, Uid>,
    commit_limit: usize,
    max_workers: usize,
    progress: &MultiProgress,
) -> EngineResult<Option<String>> {
    let since = store.watermark("history")?.and_then(|ts| chrono::DateTime::parse_from_rfc3339(&ts).ok()).map(|dt| dt.with_timezone(&chrono::Utc));

    let commits = git.list_commits(since, None, Some(commit_limit))?;
    if commits.is_empty() {
        return Ok(None);
    }

    let bar = progress.add(ProgressBar::new(commits.len() as u64)).with_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} commits {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let num_per_thread = num_per_thread(max_workers.max(1), commits.len());
    let mut handles = Vec::new();

    for chunk in &commits.into_iter().chunks(num_per_thread) {
        let chunk = chunk.collect::<Vec<_>>();
        let git = git.clone();
        let store = store.clone();
        let file_uids = file_uids.clone();
        let bar = bar.clone();

        handles.push(thread::spawn(move || -> EngineResult<()> {
            for commit in &chunk {
                bar.set_message(commit.hash[..7.min(commit.hash.len())].to_string());
                ingest_one_commit(&store, &git, commit, &file_uids)?;
                bar.inc(1);
            }
            Ok(())
        }));
    }

    let mut newest: Option<String> = None;
    for handle in handles {
        handle.join().map_err(|_| EngineError::Other(anyhow::anyhow!("worker thread panicked")))??;
    }

    bar.finish_and_clear();
    progress.remove(&bar);

    // recompute newest from the store rather than from handles (threads interleave commits, so
    // the last one joined is not necessarily the most recent by timestamp).
    let conn = store.raw_conn()?;
    newest = conn
        .query_row("SELECT MAX(json_extract(props, '$.timestamp')) FROM nodes WHERE kind = 'git_commit'", [], |r| r.get(0))
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    Ok(newest)
}

fn ingest_one_commit(
    store: &Store,
    git: &GitHistoryService,
    commit: &crate::git_history::CommitMeta,
    file_uids: &HashMap<String, Uid>,
) -> EngineResult<()> {
    let commit_uid = Uid::of(NodeKind::GitCommit, &commit.hash);
    let ts = commit.timestamp.to_rfc3339();

    store.upsert_nodes(&[NodeRow {
        uid: commit_uid.to_string(),
        kind: NodeKind::GitCommit,
        natural_key: commit.hash.clone(),
        props: json!({
            "hash": commit.hash,
            "message": commit.message,
            "author": commit.author,
            "author_email": commit.author_email,
            "timestamp": ts,
            "sequence": commit.sequence,
        }),
    }])?;

    {
        let conn = store.raw_conn()?;
        conn.execute(
            "INSERT INTO commit_fulltext (uid, message) VALUES (?1, ?2)",
            rusqlite::params![commit_uid.to_string(), commit.message],
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    }

    let deltas = git.file_changes(&commit.hash)?;

    for delta in &deltas {
        let file_uid = resolve_file_uid(store, file_uids, &delta.path)?;

        store.upsert_edge(
            &EdgeRow {
                src: commit_uid.to_string(),
                rel: EdgeKind::Touched,
                dst: file_uid.to_string(),
                timestamp: Some(ts.clone()),
                props: json!({
                    "change_type": delta.change_type.as_letter(),
                    "additions": delta.additions,
                    "deletions": delta.deletions,
                }),
                sources: Vec::new(),
                confidence: None,
                first_seen_ts: None,
                last_seen_ts: None,
            },
            Some(&ts),
        )?;

        if let Some(prev_path) = &delta.prev_path {
            let prev_uid = resolve_file_uid(store, file_uids, prev_path)?;
            store.upsert_edge(
                &EdgeRow {
                    src: prev_uid.to_string(),
                    rel: EdgeKind::RefactoredTo,
                    dst: file_uid.to_string(),
                    timestamp: Some(ts.clone()),
                    props: json!({ "commit": commit.hash, "change_type": delta.change_type.as_letter() }),
                    sources: vec![Evidence::GitRename.source_tag().to_string()],
                    confidence: Some(Evidence::GitRename.confidence()),
                    first_seen_ts: Some(ts.clone()),
                    last_seen_ts: Some(ts.clone()),
                },
                Some(&ts),
            )?;
        }
    }

    Ok(())
}

/// File uid for `path`, from the current-tree discovery map when present, otherwise a minimal
/// `File` node is upserted on the fly. A renamed-away or deleted path has no entry in
/// `file_uids` (built from the working tree at bootstrap time) but still needs a node for
/// `TOUCHED`/`REFACTORED_TO` edges to attach to.
fn resolve_file_uid(store: &Store, file_uids: &HashMap<String, Uid>, path: &str) -> EngineResult<Uid> {
    if let Some(&uid) = file_uids.get(path) {
        return Ok(uid);
    }

    let uid = Uid::of(NodeKind::File, path);
    store.upsert_nodes(&[NodeRow {
        uid: uid.to_string(),
        kind: NodeKind::File,
        natural_key: path.to_string(),
        props: json!({ "path": path, "extension": null, "lang": null }),
    }])?;
    Ok(uid)
}

fn num_per_thread(num_threads: usize, total: usize) -> usize {
    (total + num_threads - 1) / num_threads.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_per_thread_partitions_without_remainder_loss() {
        assert_eq!(num_per_thread(4, 10), 3);
        assert_eq!(num_per_thread(1, 10), 10);
        assert_eq!(num_per_thread(10, 1), 1);
    }
}


