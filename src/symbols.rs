//! Symbol/Library Extractor: shallow, grammar-free symbol extraction per
//! `SyntaxFamily`, import-statement resolution to repo files or external libraries, and manifest
//! parsing for dependency-declared libraries. Replaces the tree-sitter-grammar approach an
//! `EntityExtractor` would use with line-oriented regexes, per this crate's shallow-parser
//! direction.

use std::collections::HashMap;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

use crate::core::EdgeKind;
use crate::core::NodeKind;
use crate::core::SymbolKind;
use crate::core::Uid;
use crate::errors::EngineResult;
use crate::languages::Lang;
use crate::store::EdgeRow;
use crate::store::NodeRow;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ExtractedSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct ExtractedImport {
    /// The raw module/path text as written in the source (e.g. `./utils`, `requests`, `pkg/foo`).
    pub raw: String,
    pub line: usize,
}

lazy_static! {
    static ref PY_DEF: Regex = Regex::new(r"^\s*def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap();
    static ref PY_CLASS: Regex = Regex::new(r"^\s*class\s+([A-Za-z_][A-Za-z0-9_]*)\s*[:(]").unwrap();
    static ref PY_IMPORT: Regex =
        Regex::new(r"^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))").unwrap();

    static ref RB_DEF: Regex = Regex::new(r"^\s*def\s+([A-Za-z_][A-Za-z0-9_?!]*)").unwrap();
    static ref RB_CLASS: Regex = Regex::new(r"^\s*class\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    static ref RB_REQUIRE: Regex = Regex::new(r#"^\s*require(?:_relative)?\s*['"]([^'"]+)['"]"#).unwrap();

    static ref JS_FUNC: Regex =
        Regex::new(r"^\s*(?:export\s+)?(?:async\s+)?function\s+([A-Za-z_$][\w$]*)\s*\(").unwrap();
    static ref JS_CLASS: Regex = Regex::new(r"^\s*(?:export\s+)?class\s+([A-Za-z_$][\w$]*)").unwrap();
    static ref JS_METHOD: Regex =
        Regex::new(r"^\s{2,}(?:async\s+|static\s+)*([A-Za-z_$][\w$]*)\s*\([^)]*\)\s*\{").unwrap();
    static ref JS_IMPORT: Regex = Regex::new(r#"(?:import\s+.*from\s+|require\s*\(\s*)['"]([^'"]+)['"]"#).unwrap();

    static ref JAVA_CLASS: Regex =
        Regex::new(r"^\s*(?:public|private|protected)?\s*(?:static\s+)?(?:final\s+)?(?:class|interface)\s+([A-Za-z_$][\w$]*)").unwrap();
    static ref JAVA_METHOD: Regex = Regex::new(
        r"^\s*(?:public|private|protected)\s+(?:static\s+)?(?:final\s+)?[\w<>\[\],\s]+\s+([A-Za-z_$][\w$]*)\s*\([^;]*\)\s*\{?$"
    ).unwrap();
    static ref JAVA_IMPORT: Regex = Regex::new(r"^\s*import\s+(?:static\s+)?([\w.]+)\s*;").unwrap();

    static ref GO_FUNC: Regex = Regex::new(r"^\s*func\s+(?:\([^)]*\)\s*)?([A-Za-z_][\w]*)\s*\(").unwrap();
    static ref GO_TYPE: Regex = Regex::new(r"^\s*type\s+([A-Za-z_][\w]*)\s+(?:struct|interface)").unwrap();
    static ref GO_IMPORT: Regex = Regex::new(r#"^\s*(?:_\s+)?"([^"]+)"\s*$"#).unwrap();

    static ref C_FUNC: Regex =
        Regex::new(r"^[A-Za-z_][\w\s*]*[\s*]([A-Za-z_][\w]*)\s*\([^;{]*\)\s*\{?\s*$").unwrap();
    static ref C_INCLUDE: Regex = Regex::new(r#"^\s*#include\s*[<"]([^>"]+)[>"]"#).unwrap();
}

/// Extract symbols from one source file's text, dispatched by the language's `SyntaxFamily`
///. Every line a rule matches produces one `Symbol` at that 1-based line number.
pub fn extract_symbols(lang: Lang, text: &str) -> Vec<ExtractedSymbol> {
    let mut symbols = Vec::new();

    match lang {
        Lang::Python => push_regex_matches(&mut symbols, text, &PY_DEF, SymbolKind::Function),
        Lang::Ruby => push_regex_matches(&mut symbols, text, &RB_DEF, SymbolKind::Function),
        Lang::JavaScript | Lang::TypeScript => {
            push_regex_matches(&mut symbols, text, &JS_FUNC, SymbolKind::Function);
            push_regex_matches(&mut symbols, text, &JS_METHOD, SymbolKind::Method);
        }
        Lang::Java | Lang::Kotlin => push_regex_matches(&mut symbols, text, &JAVA_METHOD, SymbolKind::Method),
        Lang::Go => push_regex_matches(&mut symbols, text, &GO_FUNC, SymbolKind::Function),
        Lang::C | Lang::Cpp => push_regex_matches(&mut symbols, text, &C_FUNC, SymbolKind::Function),
        Lang::Markdown => {}
    }

    match lang {
        Lang::Python => push_regex_matches(&mut symbols, text, &PY_CLASS, SymbolKind::Class),
        Lang::Ruby => push_regex_matches(&mut symbols, text, &RB_CLASS, SymbolKind::Class),
        Lang::JavaScript | Lang::TypeScript => {
            push_regex_matches(&mut symbols, text, &JS_CLASS, SymbolKind::Class)
        }
        Lang::Java | Lang::Kotlin => push_regex_matches(&mut symbols, text, &JAVA_CLASS, SymbolKind::Class),
        _ => {}
    }

    symbols.sort_by_key(|s| s.line);
    symbols
}

/// Extract raw import/require/include targets, dispatched the same way. Resolution to a
/// repo file or an external library happens in `resolve_imports`.
pub fn extract_imports(lang: Lang, text: &str) -> Vec<ExtractedImport> {
    let mut imports = Vec::new();

    let regex: &Regex = match lang {
        Lang::Python => &PY_IMPORT,
        Lang::Ruby => &RB_REQUIRE,
        Lang::JavaScript | Lang::TypeScript => &JS_IMPORT,
        Lang::Java | Lang::Kotlin => &JAVA_IMPORT,
        Lang::Go => &GO_IMPORT,
        Lang::C | Lang::Cpp => &C_INCLUDE,
        Lang::Markdown => return imports,
    };

    for (i, line) in text.lines().enumerate() {
        if let Some(caps) = regex.captures(line) {
            let raw = caps.iter().skip(1).flatten().next().map(|m| m.as_str().to_string());
            if let Some(raw) = raw {
                imports.push(ExtractedImport { raw, line: i + 1 });
            }
        }
    }

    imports
}

fn push_regex_matches(out: &mut Vec<ExtractedSymbol>, text: &str, regex: &Regex, kind: SymbolKind) {
    for (i, line) in text.lines().enumerate() {
        if let Some(caps) = regex.captures(line) {
            if let Some(name) = caps.get(1) {
                out.push(ExtractedSymbol { name: name.as_str().to_string(), kind, line: i + 1 });
            }
        }
    }
}

/// Persist `Symbol` nodes for one file and `DEFINED_IN` edges back to it.
pub fn ingest_symbols(store: &Store, file_path: &str, symbols: &[ExtractedSymbol]) -> EngineResult<Vec<Uid>> {
    let file_uid = Uid::of(NodeKind::File, file_path);
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let mut uids = Vec::new();

    for symbol in symbols {
        let natural_key = format!("{file_path}::{}:{}", symbol.name, symbol.line);
        let uid = Uid::of(NodeKind::Symbol, &natural_key);
        uids.push(uid);

        nodes.push(NodeRow {
            uid: uid.to_string(),
            kind: NodeKind::Symbol,
            natural_key,
            props: json!({
                "name": symbol.name,
                "kind": symbol.kind.to_string(),
                "file": file_path,
                "line": symbol.line,
            }),
        });

        edges.push(EdgeRow {
            src: uid.to_string(),
            rel: EdgeKind::DefinedIn,
            dst: file_uid.to_string(),
            timestamp: None,
            props: json!({}),
            sources: Vec::new(),
            confidence: None,
            first_seen_ts: None,
            last_seen_ts: None,
        });
    }

    store.upsert_nodes(&nodes)?;
    for edge in &edges {
        store.upsert_edge(edge, None)?;
    }

    Ok(uids)
}

/// Resolve each import to a `File` already known to the graph when the raw text looks like a
/// relative path that resolves under the repo root; otherwise treat it as an external `Library`.
/// An import matching neither cleanly (ambiguous module resolution, e.g. bare package names that
/// could be either a local package or a third-party one) is linked with confidence 0.5.
pub fn resolve_and_ingest_imports(
    store: &Store,
    file_path: &str,
    imports: &[ExtractedImport],
    known_files: &HashMap<String, Uid>,
) -> EngineResult<()> {
    let file_uid = Uid::of(NodeKind::File, file_path);
    let base_dir = Path::new(file_path).parent().unwrap_or_else(|| Path::new(""));

    for import in imports {
        let is_relative = import.raw.starts_with('.') || import.raw.starts_with('/');

        let resolved_file = if is_relative {
            resolve_relative(base_dir, &import.raw, known_files)
        } else {
            None
        };

        match resolved_file {
            Some(target_uid) => {
                store.upsert_edge(
                    &EdgeRow {
                        src: file_uid.to_string(),
                        rel: EdgeKind::Imports,
                        dst: target_uid.to_string(),
                        timestamp: None,
                        props: json!({ "raw": import.raw, "line": import.line }),
                        sources: Vec::new(),
                        confidence: None,
                        first_seen_ts: None,
                        last_seen_ts: None,
                    },
                    None,
                )?;
            }
            None => {
                let library_key = import.raw.split(['/', '.']).next().unwrap_or(&import.raw).to_string();
                let library_uid = Uid::of(NodeKind::Library, &library_key);

                store.upsert_nodes(&[NodeRow {
                    uid: library_uid.to_string(),
                    kind: NodeKind::Library,
                    natural_key: library_key.clone(),
                    props: json!({ "name": library_key }),
                }])?;

                let ambiguous = !is_relative && import.raw.matches('/').count() == 0 && import.raw.len() < 3;

                store.upsert_edge(
                    &EdgeRow {
                        src: file_uid.to_string(),
                        rel: EdgeKind::UsesLibrary,
                        dst: library_uid.to_string(),
                        timestamp: None,
                        props: json!({ "raw": import.raw, "line": import.line }),
                        sources: vec!["import-statement".to_string()],
                        confidence: Some(if ambiguous { 0.5 } else { 1.0 }),
                        first_seen_ts: None,
                        last_seen_ts: None,
                    },
                    None,
                )?;
            }
        }
    }

    Ok(())
}

fn resolve_relative(base_dir: &Path, raw: &str, known_files: &HashMap<String, Uid>) -> Option<Uid> {
    let joined = base_dir.join(raw);
    let normalized = crate::core::normalize_path(&joined);

    for candidate in [
        normalized.clone(),
        format!("{normalized}.py"),
        format!("{normalized}.js"),
        format!("{normalized}.ts"),
        format!("{normalized}.rb"),
        format!("{normalized}/index.js"),
        format!("{normalized}/index.ts"),
    ] {
        if let Some(&uid) = known_files.get(&candidate) {
            return Some(uid);
        }
    }

    None
}

/// Parse a dependency manifest into the library names it declares. Supports the common
/// package managers; an unrecognised manifest filename yields no libraries rather than an error.
pub fn parse_manifest(filename: &str, text: &str) -> Vec<String> {
    match filename {
        "package.json" => parse_package_json(text),
        "requirements.txt" => parse_requirements_txt(text),
        "go.mod" => parse_go_mod(text),
        "Cargo.toml" => parse_cargo_toml(text),
        _ => Vec::new(),
    }
}

fn parse_package_json(text: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else { return Vec::new() };
    let mut names = Vec::new();
    for field in ["dependencies", "devDependencies"] {
        if let Some(deps) = value.get(field).and_then(|v| v.as_object()) {
            names.extend(deps.keys().cloned());
        }
    }
    names
}

fn parse_requirements_txt(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            l.split(|c: char| c == '=' || c == '<' || c == '>' || c == '~' || c == '!' || c == '[')
                .next()
                .unwrap_or(l)
                .trim()
                .to_string()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

fn parse_go_mod(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with("module") && !l.starts_with("go ") && !l.is_empty())
        .filter_map(|l| l.split_whitespace().next())
        .filter(|s| !matches!(*s, "require" | "(" | ")"))
        .map(str::to_string)
        .collect()
}

fn parse_cargo_toml(text: &str) -> Vec<String> {
    let Ok(value) = toml::from_str::<toml::Value>(text) else { return Vec::new() };
    value
        .get("dependencies")
        .and_then(|v| v.as_table())
        .map(|t| t.keys().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_python_functions_and_classes() {
        let text = "class Foo:\n    def bar(self):\n        pass\n\ndef baz():\n    pass\n";
        let symbols = extract_symbols(Lang::Python, text);
        let names: Vec<_> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"Foo"));
        assert!(names.contains(&"bar"));
        assert!(names.contains(&"baz"));
    }

    #[test]
    fn extracts_python_imports() {
        let text = "import os\nfrom pkg.mod import thing\n";
        let imports = extract_imports(Lang::Python, text);
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].raw, "os");
        assert_eq!(imports[1].raw, "pkg.mod");
    }

    #[test]
    fn parses_requirements_txt_stripping_version_pins() {
        let names = parse_requirements_txt("flask==2.0.1\n# comment\nrequests>=2.0\n");
        assert_eq!(names, vec!["flask".to_string(), "requests".to_string()]);
    }

    #[test]
    fn resolves_relative_import_to_known_file() {
        let mut known = HashMap::new();
        let target_uid = Uid::of(NodeKind::File, "src/utils.py");
        known.insert("src/utils.py".to_string(), target_uid);

        let resolved = resolve_relative(Path::new("src"), "./utils", &known);
        assert_eq!(resolved, Some(target_uid));
    }
}
