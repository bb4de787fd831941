//! Streaming filesystem discovery and file classification: plain `walkdir::WalkDir` (no
//! `.gitignore` awareness) paired with a `Pathspec` wrapper around `git2::Pathspec` for
//! `exclude_patterns` matching.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::core::normalize_path;
use crate::languages::Lang;

/// A wrapper around [git2::Pathspec] with the trait impls it's missing.
pub struct Pathspec {
    patterns: Vec<String>,
    inner: git2::Pathspec,
}

impl Pathspec {
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(patterns: I) -> Self {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let inner = git2::Pathspec::new(&patterns).expect("invalid pathspec pattern");
        Self { patterns, inner }
    }

    pub fn matches<P: AsRef<Path>>(&self, path: P) -> bool {
        self.inner.matches_path(path.as_ref(), git2::PathspecFlags::IGNORE_CASE)
    }
}

impl fmt::Debug for Pathspec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pathspec").field(&self.patterns).finish()
    }
}

impl Clone for Pathspec {
    fn clone(&self) -> Self {
        Self::new(self.patterns.clone())
    }
}

unsafe impl Send for Pathspec {}
unsafe impl Sync for Pathspec {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Code(Lang),
    Doc,
    Other,
    Binary,
}

#[derive(Debug, Clone)]
pub struct DiscoveredDir {
    pub path: String,
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: String,
    pub parent_dir: Option<String>,
    pub extension: Option<String>,
    pub classification: Classification,
    pub absolute_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub dirs: Vec<DiscoveredDir>,
    pub files: Vec<DiscoveredFile>,
}

/// Always-excluded infrastructure regardless of user `exclude_patterns`.
const BUILTIN_EXCLUDES: &[&str] = &[
    ".git/**",
    ".git",
    ".devgraph/**",
    ".devgraph",
];

/// A file found during the traversal, pending classification.
struct FileCandidate {
    normalized: String,
    parent_dir: Option<String>,
    extension: Option<String>,
    absolute_path: PathBuf,
}

/// Single filesystem traversal under `root`, dropping excluded entries before descending so
/// memory is bounded by directory depth x fan-out. Classification (an extension lookup, plus a
/// content sniff that reads the file for entries extension alone can't place) is independent per
/// file, so it runs as a `rayon` data-parallel pass over the candidates the traversal collects,
/// rather than inline in the single-threaded walk.
pub fn discover(root: &Path, subpath: Option<&str>, exclude_patterns: &[String]) -> anyhow::Result<DiscoveryResult> {
    let mut patterns: Vec<String> = BUILTIN_EXCLUDES.iter().map(|s| s.to_string()).collect();
    patterns.extend(exclude_patterns.iter().cloned());
    let excludes = Pathspec::new(patterns);

    let walk_root = match subpath {
        Some(sub) => root.join(sub),
        None => root.to_path_buf(),
    };

    let mut dirs = Vec::new();
    let mut candidates = Vec::new();

    let walker = WalkDir::new(&walk_root).follow_links(false).into_iter().filter_entry(|entry| {
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => return true,
        };
        if rel.as_os_str().is_empty() {
            return true;
        }
        !excludes.matches(rel)
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("failed to read directory entry: {err}. skipping");
                continue;
            }
        };

        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let normalized = normalize_path(rel);

        if entry.file_type().is_dir() {
            let depth = normalized.matches('/').count() + 1;
            dirs.push(DiscoveredDir { path: normalized, depth });
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        let extension = rel.extension().map(|e| e.to_string_lossy().to_lowercase());
        let parent_dir = rel.parent().map(normalize_path).filter(|p| !p.is_empty());

        candidates.push(FileCandidate { normalized, parent_dir, extension, absolute_path: entry.path().to_path_buf() });
    }

    use rayon::prelude::*;
    let files: Vec<DiscoveredFile> = candidates
        .into_par_iter()
        .map(|candidate| {
            let classification = classify(&candidate.normalized, &candidate.absolute_path);
            DiscoveredFile {
                path: candidate.normalized,
                parent_dir: candidate.parent_dir,
                extension: candidate.extension,
                classification,
                absolute_path: candidate.absolute_path,
            }
        })
        .collect();

    Ok(DiscoveryResult { dirs, files })
}

/// Classify a file as code/doc/other by extension, with a small content sniff for files whose
/// extension gives no answer: a BOM or successfully-decoding UTF-8 sample means the file is
/// plain text of an unrecognised kind (`Other`); anything else is `Binary`, so later stages can
/// skip the decode/chunk/extract passes without attempting and failing them per file.
fn classify(normalized_path: &str, absolute: &Path) -> Classification {
    if let Some(lang) = Lang::of(normalized_path) {
        return if lang.is_doc() { Classification::Doc } else { Classification::Code(lang) };
    }

    match std::fs::read(absolute) {
        Ok(bytes) => {
            let sample = &bytes[..bytes.len().min(512)];
            if has_utf8_bom(sample) || std::str::from_utf8(sample).is_ok() {
                Classification::Other
            } else {
                Classification::Binary
            }
        }
        Err(_) => Classification::Other,
    }
}

fn has_utf8_bom(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xEF, 0xBB, 0xBF])
}

/// Decode file bytes as UTF-8, falling back to Latin-1 then Windows-1252. Returns
/// `None` if every encoding fails, in which case the caller records a decoding failure and skips
/// chunking rather than failing the stage.
pub fn decode_text(bytes: &[u8]) -> Option<String> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Some(text.to_string());
    }

    if let Some(text) = decode_latin1(bytes) {
        return Some(text);
    }

    let (text, _, had_errors) = encoding_rs::WINDOWS_1252.decode(bytes);
    if !had_errors {
        return Some(text.into_owned());
    }

    None
}

/// `encoding_rs` has no true ISO-8859-1 constant (the WHATWG Encoding Standard folds the
/// "latin1" label into windows-1252), so Latin-1 is decoded by hand: every byte maps directly to
/// the Unicode codepoint of the same value. Latin-1 and Windows-1252 agree on every byte except
/// 0x80-0x9F, which Latin-1 defines as the C1 control codes but Windows-1252 uses for printable
/// punctuation (curly quotes, em-dash, ellipsis...). A sample containing one of those bytes is
/// treated as not-really-Latin-1 so the caller falls through to the Windows-1252 decode instead.
fn decode_latin1(bytes: &[u8]) -> Option<String> {
    if bytes.iter().any(|&b| (0x80..=0x9F).contains(&b)) {
        return None;
    }
    Some(bytes.iter().map(|&b| b as char).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_git_directory_and_user_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "").unwrap();
        std::fs::write(dir.path().join("main.py"), "x = 1\n").unwrap();

        let result = discover(dir.path(), None, &["node_modules/**".to_string()]).unwrap();
        let paths: Vec<_> = result.files.iter().map(|f| f.path.as_str()).collect();

        assert!(paths.contains(&"main.py"));
        assert!(!paths.iter().any(|p| p.starts_with(".git")));
        assert!(!paths.iter().any(|p| p.starts_with("node_modules")));
    }

    #[test]
    fn classifies_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("b.md"), "# hi\n").unwrap();

        let result = discover(dir.path(), None, &[]).unwrap();
        let by_path: std::collections::HashMap<_, _> =
            result.files.into_iter().map(|f| (f.path.clone(), f.classification)).collect();

        assert_eq!(by_path["a.py"], Classification::Code(Lang::Python));
        assert_eq!(by_path["b.md"], Classification::Doc);
    }

    #[test]
    fn decode_text_falls_back_when_not_valid_utf8() {
        let latin1_bytes = vec![0xE9, 0x20, 0x63, 0x61, 0x66, 0xE9]; // "é café" in latin-1-ish
        assert!(decode_text(&latin1_bytes).is_some());
    }

    #[test]
    fn decode_text_falls_through_to_windows_1252_for_c1_range_bytes() {
        // 0x93 is a C1 control code in true Latin-1 but U+201C (left double quote) in
        // Windows-1252; its presence should skip the Latin-1 decode and land on Windows-1252.
        let bytes = vec![0x93, 0x68, 0x69, 0x93];
        let text = decode_text(&bytes).unwrap();
        assert_eq!(text, "\u{201C}hi\u{201C}");
    }

    #[test]
    fn content_sniff_distinguishes_extensionless_text_from_binary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("LICENSE"), "MIT License\n").unwrap();
        std::fs::write(dir.path().join("blob"), [0x00u8, 0xFF, 0x93, 0x10]).unwrap();

        let result = discover(dir.path(), None, &[]).unwrap();
        let by_path: std::collections::HashMap<_, _> =
            result.files.into_iter().map(|f| (f.path.clone(), f.classification)).collect();

        assert_eq!(by_path["LICENSE"], Classification::Other);
        assert_eq!(by_path["blob"], Classification::Binary);
    }
}
