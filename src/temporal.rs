//! Temporal Engine: walks commit history oldest-first, creating one `GitCommit` node and
//! `TOUCHED` edges per touched file, plus `REFACTORED_TO` edges on renames/copies. Commits are
//! chunked across `max_workers` raw `std::thread::spawn` CPU workers (chunk-and-join, each
//! processing a contiguous slice of commits) that read commit diffs and build the rows to
//! write; the rows are handed off through a bounded `crossbeam-channel` to a separate pool of
//! writer threads that own the actual `Store` I/O, so a slow write exerts backpressure on the
//! CPU pool instead of letting unwritten rows pile up in memory.

use std::collections::HashMap;
use std::thread;

use crossbeam_channel::bounded;
use crossbeam_channel::Receiver;
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
use crate::git_history::CommitMeta;
use crate::git_history::GitHistoryService;
use crate::store::EdgeRow;
use crate::store::NodeRow;
use crate::store::Store;

/// Everything a writer thread needs to persist one commit, computed entirely off-store by a CPU
/// worker so the writer pool never blocks on git plumbing.
struct CommitWrite {
    commit_uid: String,
    message: String,
    timestamp: String,
    commit_node: NodeRow,
    extra_file_nodes: Vec<NodeRow>,
    touched: Vec<EdgeRow>,
    renames: Vec<EdgeRow>,
}

enum WriteJob {
    Commit(CommitWrite),
}

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

    let workers = max_workers.max(1);
    let batch_size = num_per_thread(workers, commits.len());
    // Fixed at a small multiple of the worker count, not `batch_size`: `batch_size` grows with
    // the total commit count, which would let the CPU pool queue an entire large history's worth
    // of `CommitWrite`s before a writer ever drains one, defeating the backpressure this split
    // is for.
    let (tx, rx) = bounded::<WriteJob>(workers * 4);

    let mut writer_handles = Vec::new();
    for _ in 0..workers {
        let store = store.clone();
        let rx: Receiver<WriteJob> = rx.clone();
        let bar = bar.clone();

        writer_handles.push(thread::spawn(move || -> EngineResult<()> {
            for job in rx {
                match job {
                    WriteJob::Commit(write) => apply_commit_write(&store, write)?,
                }
                bar.inc(1);
            }
            Ok(())
        }));
    }
    drop(rx);

    let mut cpu_handles = Vec::new();
    for chunk in &commits.into_iter().chunks(batch_size) {
        let chunk = chunk.collect::<Vec<_>>();
        let git = git.clone();
        let file_uids = file_uids.clone();
        let tx = tx.clone();
        let bar = bar.clone();

        cpu_handles.push(thread::spawn(move || -> EngineResult<()> {
            for commit in &chunk {
                bar.set_message(commit.hash[..7.min(commit.hash.len())].to_string());
                let write = compute_commit_write(&git, commit, &file_uids)?;
                // Blocks once the channel is at capacity, throttling the CPU pool to the
                // writer pool's actual throughput.
                tx.send(WriteJob::Commit(write)).map_err(|_| EngineError::Other(anyhow::anyhow!("writer pool exited early")))?;
            }
            Ok(())
        }));
    }
    drop(tx);

    for handle in cpu_handles {
        handle.join().map_err(|_| EngineError::Other(anyhow::anyhow!("worker thread panicked")))??;
    }
    for handle in writer_handles {
        handle.join().map_err(|_| EngineError::Other(anyhow::anyhow!("writer thread panicked")))??;
    }

    bar.finish_and_clear();
    progress.remove(&bar);

    // recompute newest from the store rather than from handles (threads interleave commits, so
    // the last one joined is not necessarily the most recent by timestamp).
    let conn = store.raw_conn()?;
    let newest: Option<String> = conn
        .query_row("SELECT MAX(json_extract(props, '$.timestamp')) FROM nodes WHERE kind = 'git_commit'", [], |r| r.get(0))
        .map_err(|e| EngineError::StorePermanent(e.into()))?;

    Ok(newest)
}

/// Reads the commit's diff and builds every row its write needs. No store access: resolving a
/// path with no entry in `file_uids` (a renamed-away or deleted file) synthesises the uid by hash
/// alone and queues a minimal `File` node for the writer to upsert, rather than writing it here.
fn compute_commit_write(git: &GitHistoryService, commit: &CommitMeta, file_uids: &HashMap<String, Uid>) -> EngineResult<CommitWrite> {
    let commit_uid = Uid::of(NodeKind::GitCommit, &commit.hash);
    let ts = commit.timestamp.to_rfc3339();

    let commit_node = NodeRow {
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
    };

    let mut extra_file_nodes = Vec::new();
    let mut resolve = |path: &str| -> Uid {
        if let Some(&uid) = file_uids.get(path) {
            return uid;
        }
        let uid = Uid::of(NodeKind::File, path);
        extra_file_nodes.push(NodeRow {
            uid: uid.to_string(),
            kind: NodeKind::File,
            natural_key: path.to_string(),
            props: json!({ "path": path, "extension": null, "lang": null }),
        });
        uid
    };

    let deltas = git.file_changes(&commit.hash)?;
    let mut touched = Vec::new();
    let mut renames = Vec::new();

    for delta in &deltas {
        let file_uid = resolve(&delta.path);

        touched.push(EdgeRow {
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
        });

        if let Some(prev_path) = &delta.prev_path {
            let prev_uid = resolve(prev_path);
            renames.push(EdgeRow {
                src: prev_uid.to_string(),
                rel: EdgeKind::RefactoredTo,
                dst: file_uid.to_string(),
                timestamp: Some(ts.clone()),
                props: json!({ "commit": commit.hash, "change_type": delta.change_type.as_letter() }),
                sources: vec![Evidence::GitRename.source_tag().to_string()],
                confidence: Some(Evidence::GitRename.confidence()),
                first_seen_ts: Some(ts.clone()),
                last_seen_ts: Some(ts.clone()),
            });
        }
    }

    Ok(CommitWrite { commit_uid: commit_uid.to_string(), message: commit.message.clone(), timestamp: ts, commit_node, extra_file_nodes, touched, renames })
}

fn apply_commit_write(store: &Store, write: CommitWrite) -> EngineResult<()> {
    store.upsert_nodes(&[write.commit_node])?;
    if !write.extra_file_nodes.is_empty() {
        store.upsert_nodes(&write.extra_file_nodes)?;
    }

    {
        let conn = store.raw_conn()?;
        // `commit_fulltext` is a plain (not external-content) fts5 table with no uniqueness
        // constraint on `uid`, so a retried write (e.g. a bootstrap restarted after a writer
        // thread panic, before the `history` watermark advances) would otherwise insert a
        // duplicate row for the same commit on every retry. Delete-then-insert keeps one row
        // per commit regardless of how many times this runs.
        conn.execute("DELETE FROM commit_fulltext WHERE uid = ?1", rusqlite::params![write.commit_uid])
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        conn.execute(
            "INSERT INTO commit_fulltext (uid, message) VALUES (?1, ?2)",
            rusqlite::params![write.commit_uid, write.message],
        )
        .map_err(|e| EngineError::StorePermanent(e.into()))?;
    }

    for edge in &write.touched {
        store.upsert_edge(edge, Some(&write.timestamp))?;
    }
    for edge in &write.renames {
        store.upsert_edge(edge, Some(&write.timestamp))?;
    }

    Ok(())
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
