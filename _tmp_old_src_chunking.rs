//! Chunk Ingester: Directory/File node emission from a filesystem discovery,
//! Markdown heading-based Document/Chunk decomposition via `pulldown-cmark`, and fixed-window
//! chunking for source files pending symbol-aware refinement in `symbols.rs`. Node/edge writes
//! are batched per directory level rather than issuing one transaction per row.

use std::collections::HashMap;

use pulldown_cmark::Event;
use pulldown_cmark::Parser;
use pulldown_cmark::Tag;
use pulldown_cmark::TagEnd;
use serde_json::json;

use crate::core::normalize_path;
use crate::core::NodeKind;
use crate::core::Uid;
use crate::errors::EngineResult;
use crate::sparse_vec::SparseVec;
use crate::store::EdgeRow;
use crate::store::NodeRow;
use crate::store::Store;
use crate::walk::Classification;
use crate::walk::DiscoveryResult;

/// Source lines per chunk when a file has no heading/symbol structure to chunk by.
const SOURCE_CHUNK_WINDOW: usize = 80;

/// Maps line numbers in one file back to the `Chunk` that covers them, so later stages (symbol
/// extraction, blame-based evidence) can attach evidence to the right chunk without re-deriving
/// chunk boundaries. Built on `sparse_vec::SparseVec`'s interval map.
pub struct FileChunkIndex {
    pub file_path: String,
    pub line_to_chunk: SparseVec<ChunkRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRef(pub Uid);

/// Write `Directory`/`File` nodes and their `CONTAINS` edges for one discovery pass. Returns the `File` uid for every discovered file, keyed by repo-relative
/// path, so downstream stages can address files by path without re-hashing.
pub fn ingest_tree(store: &Store, discovery: &DiscoveryResult) -> EngineResult<HashMap<String, Uid>> {
    let mut dir_uids = HashMap::new();
    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    for dir in &discovery.dirs {
        let uid = Uid::of(NodeKind::Directory, &dir.path);
        dir_uids.insert(dir.path.clone(), uid);
        nodes.push(NodeRow {
            uid: uid.to_string(),
            kind: NodeKind::Directory,
            natural_key: dir.path.clone(),
            props: json!({ "path": dir.path, "depth": dir.depth }),
        });

        if let Some((parent, _)) = dir.path.rsplit_once('/') {
            if let Some(parent_uid) = dir_uids.get(parent) {
                edges.push(containment_edge(*parent_uid, uid));
            }
        }
    }

    let mut file_uids = HashMap::new();

    for file in &discovery.files {
        let uid = Uid::of(NodeKind::File, &file.path);
        file_uids.insert(file.path.clone(), uid);

        let lang = match &file.classification {
            Classification::Code(lang) => Some(lang.to_string()),
            Classification::Doc => Some("markdown".to_string()),
            Classification::Other => None,
        };

        nodes.push(NodeRow {
            uid: uid.to_string(),
            kind: NodeKind::File,
            natural_key: file.path.clone(),
            props: json!({ "path": file.path, "extension": file.extension, "lang": lang }),
        });

        if let Some(parent_uid) = file.parent_dir.as_ref().and_then(|p| dir_uids.get(p)) {
            edges.push(containment_edge(*parent_uid, uid));
        }
    }

    store.upsert_nodes(&nodes)?;
    for edge in &edges {
        store.upsert_edge(edge, None)?;
    }

    Ok(file_uids)
}

fn containment_edge(parent: Uid, child: Uid) -> EdgeRow {
    EdgeRow {
        src: parent.to_string(),
        rel: crate::core::EdgeKind::Contains,
        dst: child.to_string(),
        timestamp: None,
        props: json!({}),
        sources: Vec::new(),
        confidence: None,
        first_seen_ts: None,
        last_seen_ts: None,
    }
}

/// Chunk a Markdown file by heading: one `Document` node for the file, one `Chunk`
/// per heading section, `CONTAINS_CHUNK`/`PART_OF` edges linking document to chunk.
pub fn chunk_markdown(store: &Store, path: &str, text: &str) -> EngineResult<FileChunkIndex> {
    let doc_uid = Uid::of(NodeKind::Document, path);
    let mut nodes = vec![NodeRow {
        uid: doc_uid.to_string(),
        kind: NodeKind::Document,
        natural_key: path.to_string(),
        props: json!({ "path": path }),
    }];
    let mut edges = Vec::new();
    let mut index = SparseVec::with_capacity(8);

    let sections = split_by_heading(text);

    for (ordinal, section) in sections.iter().enumerate() {
        let chunk_key = format!("{path}#{ordinal}");
        let chunk_uid = Uid::of(NodeKind::Chunk, &chunk_key);

        nodes.push(NodeRow {
            uid: chunk_uid.to_string(),
            kind: NodeKind::Chunk,
            natural_key: chunk_key,
            props: json!({
                "path": path,
                "ordinal": ordinal,
                "heading": section.heading,
                "start_line": section.start_line,
                "end_line": section.end_line,
                "text": section.text,
            }),
        });

        edges.push(EdgeRow {
            src: doc_uid.to_string(),
            rel: crate::core::EdgeKind::ContainsChunk,
            dst: chunk_uid.to_string(),
            timestamp: None,
            props: json!({}),
            sources: Vec::new(),
            confidence: None,
            first_seen_ts: None,
            last_seen_ts: None,
        });
        edges.push(EdgeRow {
            src: chunk_uid.to_string(),
            rel: crate::core::EdgeKind::PartOf,
            dst: doc_uid.to_string(),
            timestamp: None,
            props: json!({}),
            sources: Vec::new(),
            confidence: None,
            first_seen_ts: None,
            last_seen_ts: None,
        });

        if section.end_line >= section.start_line {
            index.insert_many(section.start_line, section.end_line, ChunkRef(chunk_uid));
        }
    }

    store.upsert_nodes(&nodes)?;
    for edge in &edges {
        store.upsert_edge(edge, None)?;
    }

    Ok(FileChunkIndex { file_path: path.to_string(), line_to_chunk: index })
}

/// Chunk a source file into fixed-size line windows. Symbol-aware re-chunking (one
/// chunk per function/class) happens in `symbols.rs`; this establishes the fallback chunk grid
/// every file gets regardless of whether a symbol extractor recognises its language.
pub fn chunk_source(store: &Store, path: &str, text: &str) -> EngineResult<FileChunkIndex> {
    let lines: Vec<&str> = text.lines().collect();
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let mut index = SparseVec::with_capacity(lines.len() / SOURCE_CHUNK_WINDOW + 1);

    let file_uid = Uid::of(NodeKind::File, path);

    let mut ordinal = 0;
    let mut start = 0;
    while start < lines.len() {
        let end = (start + SOURCE_CHUNK_WINDOW).min(lines.len());
        let chunk_key = format!("{path}#{ordinal}");
        let chunk_uid = Uid::of(NodeKind::Chunk, &chunk_key);
        let body = lines[start..end].join("\n");

        nodes.push(NodeRow {
            uid: chunk_uid.to_string(),
            kind: NodeKind::Chunk,
            natural_key: chunk_key,
            props: json!({
                "path": path,
                "ordinal": ordinal,
                "start_line": start + 1,
                "end_line": end,
                "text": body,
            }),
        });

        edges.push(EdgeRow {
            src: file_uid.to_string(),
            rel: crate::core::EdgeKind::ContainsChunk,
            dst: chunk_uid.to_string(),
            timestamp: None,
            props: json!({}),
            sources: Vec::new(),
            confidence: None,
            first_seen_ts: None,
            last_seen_ts: None,
        });
        edges.push(EdgeRow {
            src: chunk_uid.to_string(),
            rel: crate::core::EdgeKind::PartOf,
            dst: file_uid.to_string(),
            timestamp: None,
            props: json!({}),
            sources: Vec::new(),
            confidence: None,
            first_seen_ts: None,
            last_seen_ts: None,
        });

        if end >= start + 1 {
            index.insert_many(start + 1, end, ChunkRef(chunk_uid));
        }

        ordinal += 1;
        start = end;
    }

    store.upsert_nodes(&nodes)?;
    for edge in &edges {
        store.upsert_edge(edge, None)?;
    }

    Ok(FileChunkIndex { file_path: path.to_string(), line_to_chunk: index })
}

struct HeadingSection {
    heading: Option<String>,
    start_line: usize,
    end_line: usize,
    text: String,
}

/// Split Markdown text into sections at each top-level-or-deeper heading, tracking 1-based line
/// numbers so chunk boundaries agree with `git blame` line numbers for later evidence lookups.
fn split_by_heading(text: &str) -> Vec<HeadingSection> {
    let mut sections = Vec::new();
    let mut current_heading: Option<String> = None;
    let mut current_start_line = 1usize;
    let mut buf = String::new();
    let mut in_heading = false;
    let mut heading_text = String::new();

    let line_offsets: Vec<usize> = text.match_indices('\n').map(|(i, _)| i).collect();
    let line_of = |offset: usize| -> usize { line_offsets.iter().filter(|&&o| o < offset).count() + 1 };

    let parser = Parser::new(text).into_offset_iter();

    let mut last_flushed_at = 0usize;

    for (event, range) in parser {
        match event {
            Event::Start(Tag::Heading { .. }) => {
                if !buf.trim().is_empty() || current_heading.is_some() {
                    let end_line = line_of(range.start).saturating_sub(1).max(current_start_line);
                    sections.push(HeadingSection {
                        heading: current_heading.clone(),
                        start_line: current_start_line,
                        end_line,
                        text: std::mem::take(&mut buf),
                    });
                    last_flushed_at = range.start;
                }
                current_start_line = line_of(range.start);
                in_heading = true;
                heading_text.clear();
            }
            Event::End(TagEnd::Heading(_)) => {
                current_heading = Some(heading_text.trim().to_string());
                in_heading = false;
            }
            Event::Text(t) | Event::Code(t) => {
                if in_heading {
                    heading_text.push_str(&t);
                } else {
                    buf.push_str(&t);
                    buf.push(' ');
                }
            }
            _ => {}
        }
        let _ = last_flushed_at;
    }

    let end_line = line_of(text.len()).max(current_start_line);
    sections.push(HeadingSection {
        heading: current_heading,
        start_line: current_start_line,
        end_line,
        text: buf,
    });

    if sections.is_empty() {
        sections.push(HeadingSection { heading: None, start_line: 1, end_line: 1, text: text.to_string() });
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_markdown_by_heading() {
        let text = "intro text\n\n# First\nbody one\n\n# Second\nbody two\n";
        let sections = split_by_heading(text);
        assert!(sections.len() >= 2);
        assert!(sections.iter().any(|s| s.heading.as_deref() == Some("First")));
        assert!(sections.iter().any(|s| s.heading.as_deref() == Some("Second")));
    }

    #[test]
    fn chunk_markdown_creates_document_and_chunks() {
        let store = Store::in_memory().unwrap();
        let text = "# Title\nhello\n\n# Next\nworld\n";
        let index = chunk_markdown(&store, "docs/readme.md", text).unwrap();
        assert_eq!(index.file_path, "docs/readme.md");
        assert_eq!(store.node_count(NodeKind::Document).unwrap(), 1);
        assert!(store.node_count(NodeKind::Chunk).unwrap() >= 1);
    }

    #[test]
    fn chunk_source_windows_large_files() {
        let store = Store::in_memory().unwrap();
        let text = (0..200).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let index = chunk_source(&store, "src/big.py", &text).unwrap();
        assert!(store.node_count(NodeKind::Chunk).unwrap() >= 2);
        assert!(index.line_to_chunk.get(1).is_some());
        assert!(index.line_to_chunk.get(150).is_some());
    }
}


