//! Git History Service: an `Arc<Mutex<git2::Repository>>` wrapper (libgit2 read operations are
//! not guaranteed thread-safe, so a `Mutex` is used rather than an `RwLock`), with rename/copy
//! detection enabled via `git2::DiffFindOptions`.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use git2::Repository;
use git2::Sort;

use crate::core::normalize_path;
use crate::core::ChangeType;
use crate::errors::EngineError;
use crate::errors::EngineResult;

#[derive(Debug, Clone)]
pub struct CommitMeta {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub timestamp: DateTime<Utc>,
    pub branch: Option<String>,
    pub sequence: usize,
}

#[derive(Debug, Clone)]
pub struct FileDelta {
    pub path: String,
    pub prev_path: Option<String>,
    pub change_type: ChangeType,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone)]
pub struct BlameLine {
    pub line: usize,
    pub commit_hash: String,
    pub author: String,
}

#[derive(Clone)]
pub struct GitHistoryService {
    repo: Arc<Mutex<Repository>>,
}

impl GitHistoryService {
    pub fn open(repo_path: &std::path::Path) -> EngineResult<Self> {
        let repo = Repository::open(repo_path)
            .map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;

        if repo.is_shallow() {
            return Err(EngineError::RepositoryUnreadable(anyhow::anyhow!(
                "shallow clones are not supported; fetch full history"
            )));
        }

        Ok(Self { repo: Arc::new(Mutex::new(repo)) })
    }

    /// Lazy, restartable, oldest-first commit stream.
    pub fn list_commits(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> EngineResult<Vec<CommitMeta>> {
        let repo = self.repo.lock().unwrap();
        let mut walk = repo.revwalk().map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;
        walk.push_head().map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;
        walk.set_sorting(Sort::TIME).map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;

        let mut metas = Vec::new();

        for oid in walk {
            let oid = oid.map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;
            let commit = repo.find_commit(oid).map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;
            let ts = git_time_to_utc(commit.time().seconds());

            if let Some(since) = since {
                if ts < since {
                    continue;
                }
            }
            if let Some(until) = until {
                if ts > until {
                    continue;
                }
            }

            metas.push(CommitMeta {
                hash: oid.to_string(),
                message: commit.message().unwrap_or_default().to_string(),
                author: commit.author().name().unwrap_or_default().to_string(),
                author_email: commit.author().email().unwrap_or_default().to_string(),
                timestamp: ts,
                branch: None,
                sequence: 0,
            });
        }

        // revwalk with Sort::TIME is newest-first; reverse for the oldest-first contract and
        // assign the tie-break sequence from iteration order.
        metas.reverse();
        for (i, meta) in metas.iter_mut().enumerate() {
            meta.sequence = i;
        }

        if let Some(limit) = limit {
            metas.truncate(limit);
        }

        Ok(metas)
    }

    /// File deltas for one commit, with rename/copy detection enabled: `prev_path` is set
    /// when `change_type` is `R` or `C`.
    pub fn file_changes(&self, commit_hash: &str) -> EngineResult<Vec<FileDelta>> {
        let repo = self.repo.lock().unwrap();
        let oid = git2::Oid::from_str(commit_hash)
            .map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;
        let commit = repo.find_commit(oid).map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;
        let new_tree = commit.tree().map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;
        let parents: Vec<_> = commit.parents().collect();

        let mut diff_opts = git2::DiffOptions::new();
        diff_opts.ignore_filemode(true);

        let mut diff = match parents.len() {
            0 => repo.diff_tree_to_tree(None, Some(&new_tree), Some(&mut diff_opts)),
            1 => {
                let old_tree = parents[0].tree().map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;
                repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut diff_opts))
            }
            // merge commits: no per-parent delta attribution attempted, returns no diffs.
            _ => return Ok(Vec::new()),
        }
        .map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;

        let mut find_opts = git2::DiffFindOptions::new();
        find_opts.renames(true).copies(true).rename_threshold(50);
        diff.find_similar(Some(&mut find_opts))
            .map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;

        let mut deltas = Vec::new();

        for delta in diff.deltas() {
            let new_path = delta.new_file().path().map(normalize_path);
            let old_path = delta.old_file().path().map(normalize_path);

            let (path, prev_path, change_type) = match delta.status() {
                git2::Delta::Added => (new_path.unwrap(), None, ChangeType::Added),
                git2::Delta::Deleted => (old_path.unwrap(), None, ChangeType::Deleted),
                git2::Delta::Modified | git2::Delta::Typechange => {
                    (new_path.unwrap(), None, ChangeType::Modified)
                }
                git2::Delta::Renamed => (new_path.unwrap(), old_path, ChangeType::Renamed),
                git2::Delta::Copied => (new_path.unwrap(), old_path, ChangeType::Copied),
                _ => continue,
            };

            let (additions, deletions) = line_stats(&repo, &commit, &parents, delta.new_file().path());

            deltas.push(FileDelta { path, prev_path, change_type, additions, deletions });
        }

        deltas.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(deltas)
    }

    pub fn blame(&self, path: &str, at_commit: &str) -> EngineResult<Vec<BlameLine>> {
        let repo = self.repo.lock().unwrap();
        let oid = git2::Oid::from_str(at_commit)
            .map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;

        let mut opts = git2::BlameOptions::new();
        opts.newest_commit(oid);

        let blame = repo
            .blame_file(std::path::Path::new(path), Some(&mut opts))
            .map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;

        let mut lines = Vec::new();

        for hunk in blame.iter() {
            let commit = repo
                .find_commit(hunk.final_commit_id())
                .map_err(|e| EngineError::RepositoryUnreadable(e.into()))?;
            let author = commit.author().name().unwrap_or_default().to_string();

            for i in 0..hunk.lines_in_hunk() {
                lines.push(BlameLine {
                    line: hunk.final_start_line() + i,
                    commit_hash: hunk.final_commit_id().to_string(),
                    author: author.clone(),
                });
            }
        }

        Ok(lines)
    }
}

fn git_time_to_utc(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now)
}

fn line_stats(
    repo: &Repository,
    commit: &git2::Commit,
    parents: &[git2::Commit],
    path: Option<&std::path::Path>,
) -> (u32, u32) {
    let Some(path) = path else { return (0, 0) };

    let mut opts = git2::DiffOptions::new();
    opts.pathspec(path);
    opts.context_lines(0);

    let new_tree = match commit.tree() {
        Ok(t) => t,
        Err(_) => return (0, 0),
    };

    let diff = match parents.first() {
        Some(parent) => {
            let old_tree = match parent.tree() {
                Ok(t) => t,
                Err(_) => return (0, 0),
            };
            repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))
        }
        None => repo.diff_tree_to_tree(None, Some(&new_tree), Some(&mut opts)),
    };

    match diff.and_then(|d| d.stats()) {
        Ok(stats) => (stats.insertions() as u32, stats.deletions() as u32),
        Err(_) => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn run(dir: &std::path::Path, args: &[&str]) {
        let status = Command::new("git").current_dir(dir).args(args).status().unwrap();
        assert!(status.success());
    }

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &["init", "-q"]);
        run(dir.path(), &["config", "user.email", "a@b.c"]);
        run(dir.path(), &["config", "user.name", "Test"]);
        dir
    }

    #[test]
    fn single_commit_yields_one_added_file() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-q", "-m", "first"]);

        let svc = GitHistoryService::open(dir.path()).unwrap();
        let commits = svc.list_commits(None, None, None).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].sequence, 0);

        let deltas = svc.file_changes(&commits[0].hash).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].change_type, ChangeType::Added);
        assert_eq!(deltas[0].path, "a.txt");
    }

    #[test]
    fn rename_is_detected_with_prev_path() {
        let dir = init_repo();
        std::fs::write(dir.path().join("old.py"), "x = 1\ny = 2\nz = 3\n".repeat(5)).unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-q", "-m", "add old"]);

        std::fs::rename(dir.path().join("old.py"), dir.path().join("new.py")).unwrap();
        run(dir.path(), &["add", "-A"]);
        run(dir.path(), &["commit", "-q", "-m", "rename"]);

        let svc = GitHistoryService::open(dir.path()).unwrap();
        let commits = svc.list_commits(None, None, None).unwrap();
        let rename_commit = &commits[1];

        let deltas = svc.file_changes(&rename_commit.hash).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].change_type, ChangeType::Renamed);
        assert_eq!(deltas[0].path, "new.py");
        assert_eq!(deltas[0].prev_path.as_deref(), Some("old.py"));
    }
}


