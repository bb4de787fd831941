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
use crate::derive;
use crate::derive::Evidence;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::store::EdgeRow;
use crate::store::NodeRow;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct SprintWindow {
    pub path: String,
    pub name: String,
    pub number: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Matches folder names like `sprint-07`, `2025-03-sprint-12`, or a bare `07-Planning` under a
/// sprints root; the date range comes from an `index.md` heading of the form `2025-03-01 to
/// 2025-03-14`, falling back to the folder's own `YYYY-MM-DD_YYYY-MM-DD` naming if present.
fn date_range_pattern() -> Regex {
    Regex::new(r"(\d{4}-\d{2}-\d{2})\s*(?:to|\.\.|-)\s*(\d{4}-\d{2}-\d{2})").unwrap()
}

/// Pulls the sprint's number out of its folder name: the digits following "sprint" take priority
/// (`2025-03-sprint-12` → `"12"`, not the leading year), falling back to the first digit run for
/// a bare `07-Planning` style folder, and to the full folder name when no digits are present at
/// all, so an unconventionally named sprint folder still gets a stable (if less useful) natural
/// key rather than being dropped.
fn sprint_number(name: &str) -> String {
    if let Some(caps) = Regex::new(r"(?i)sprint[-_ ]*(\d+)").unwrap().captures(name) {
        return caps[1].to_string();
    }
    Regex::new(r"(\d+)").unwrap().find(name).map(|m| m.as_str().to_string()).unwrap_or_else(|| name.to_string())
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

        let number = sprint_number(&name);
        sprints.push(SprintWindow { path: dir.clone(), name, number, start, end });
    }

    Ok(sprints)
}

/// Emit `Sprint` nodes and their `INCLUDES`/`INVOLVES_FILE`/`CONTAINS_DOC`/`PART_OF` edges.
/// `commits` provides each git commit's uid/timestamp/touched-file uids so files touched inside
/// the sprint's window can be linked even when they live outside the sprint's own folder.
pub fn ingest_sprints(
    store: &Store,
    sprints: &[SprintWindow],
    doc_uids_by_path: &HashMap<String, Uid>,
    commits: &[(Uid, chrono::DateTime<chrono::Utc>, Vec<Uid>)],
) -> EngineResult<()> {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    for sprint in sprints {
        let sprint_uid = Uid::of(NodeKind::Sprint, &sprint.number);
        nodes.push(NodeRow {
            uid: sprint_uid.to_string(),
            kind: NodeKind::Sprint,
            natural_key: sprint.number.clone(),
            props: json!({
                "number": sprint.number,
                "path": sprint.path,
                "name": sprint.name,
                "start": sprint.start.to_string(),
                "end": sprint.end.to_string(),
            }),
        });

        let mut sprint_doc_paths = Vec::new();
        for (doc_path, doc_uid) in doc_uids_by_path {
            if doc_path.starts_with(&format!("{}/", sprint.path)) || doc_path == &sprint.path {
                edges.push(plain_edge(sprint_uid, EdgeKind::ContainsDoc, *doc_uid));
                sprint_doc_paths.push(doc_path.as_str());
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

        for id in requirement_ids_under(store, &sprint_doc_paths)? {
            let req_uid = derive::requirement_uid(store, &id)?;
            edges.push(EdgeRow {
                src: req_uid.to_string(),
                rel: EdgeKind::PartOf,
                dst: sprint_uid.to_string(),
                timestamp: None,
                props: json!({}),
                sources: vec![Evidence::SprintWindow.source_tag().to_string()],
                confidence: Some(Evidence::SprintWindow.confidence()),
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

/// Requirement ids (deduplicated) mentioned in any chunk belonging to one of `doc_paths`.
fn requirement_ids_under(store: &Store, doc_paths: &[&str]) -> EngineResult<Vec<String>> {
    let conn = store.raw_conn()?;
    let mut ids: Vec<String> = Vec::new();

    for doc_path in doc_paths {
        let mut stmt = conn
            .prepare("SELECT json_extract(props,'$.text') FROM nodes WHERE kind = 'chunk' AND json_extract(props,'$.path') = ?1")
            .map_err(|e| EngineError::StorePermanent(e.into()))?;
        let texts: Vec<Option<String>> = stmt
            .query_map(rusqlite::params![doc_path], |r| r.get(0))
            .map_err(|e| EngineError::StorePermanent(e.into()))?
            .collect::<Result<_, _>>()
            .map_err(|e| EngineError::StorePermanent(e.into()))?;

        for text in texts.into_iter().flatten() {
            for id in derive::requirement_ids_in(&text) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
    }

    Ok(ids)
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

    #[test]
    fn sprint_number_is_parsed_from_the_folder_name() {
        assert_eq!(sprint_number("sprint-07"), "07");
        assert_eq!(sprint_number("2025-03-sprint-12"), "12");
        assert_eq!(sprint_number("07-Planning"), "07");
        assert_eq!(sprint_number("Planning"), "Planning");
    }

    #[test]
    fn sprint_node_uses_its_number_as_natural_key() {
        let store = Store::in_memory().unwrap();
        let sprint = SprintWindow {
            path: "sprints/sprint-07".into(),
            name: "sprint-07".into(),
            number: "07".into(),
            start: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 6, 14).unwrap(),
        };

        ingest_sprints(&store, &[sprint], &HashMap::new(), &[]).unwrap();

        let conn = store.raw_conn().unwrap();
        let natural_key: String = conn
            .query_row("SELECT natural_key FROM nodes WHERE kind = 'sprint'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(natural_key, "07");
    }

    #[test]
    fn requirement_mentioned_in_a_sprint_document_gets_a_part_of_edge() {
        let store = Store::in_memory().unwrap();
        crate::chunking::chunk_markdown(&store, "sprints/sprint-07/index.md", "# Sprint 07\n\nCovers FR-02-01.\n").unwrap();

        let doc_uid = Uid::of(NodeKind::Document, "sprints/sprint-07/index.md");
        let mut doc_uids_by_path = HashMap::new();
        doc_uids_by_path.insert("sprints/sprint-07/index.md".to_string(), doc_uid);

        let sprint = SprintWindow {
            path: "sprints/sprint-07".into(),
            name: "sprint-07".into(),
            number: "07".into(),
            start: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 6, 14).unwrap(),
        };

        ingest_sprints(&store, &[sprint], &doc_uids_by_path, &[]).unwrap();

        let conn = store.raw_conn().unwrap();
        let (sources, confidence): (String, f64) = conn
            .query_row(
                "SELECT sources, confidence FROM edges
                 WHERE rel = 'PART_OF' AND src IN (SELECT uid FROM nodes WHERE kind = 'requirement')",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        let sources: Vec<String> = serde_json::from_str(&sources).unwrap();
        assert_eq!(sources, vec!["sprint-window".to_string()]);
        assert!((confidence - 0.3).abs() < 1e-9);
    }
}
