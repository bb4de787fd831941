//! Domain types shared across every stage: node/edge kinds, stable ids, paths.

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use sha1::Digest;
use sha1::Sha1;
use strum_macros::AsRefStr;
use strum_macros::Display;
use strum_macros::EnumString;

/// A stable, content-derived identifier for a node.
///
/// A SHA1 digest of the node's natural key, rendered as hex so it travels cleanly through JSON
/// and SQL alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub [u8; 20]);

impl Uid {
    pub fn of(kind: NodeKind, natural_key: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_ref().as_bytes());
        hasher.update(b"\0");
        hasher.update(natural_key.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    GitCommit,
    File,
    Directory,
    Document,
    Chunk,
    Symbol,
    Library,
    Requirement,
    Sprint,
    DerivationWatermark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Touched,
    Implements,
    EvolvesFrom,
    RefactoredTo,
    DeprecatedBy,
    Contains,
    ContainsChunk,
    PartOf,
    Mentions,
    ContainsDoc,
    Includes,
    InvolvesFile,
    DefinedIn,
    Imports,
    UsesLibrary,
    MentionsSymbol,
    MentionsFile,
    MentionsCommit,
    MentionsLibrary,
    RelatesTo,
    DependsOn,
    CoOccursWith,
}

impl EdgeKind {
    /// Whether this edge kind is required to carry a `timestamp`.
    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            EdgeKind::Touched
                | EdgeKind::Implements
                | EdgeKind::EvolvesFrom
                | EdgeKind::RefactoredTo
                | EdgeKind::DeprecatedBy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeType {
    #[strum(serialize = "A")]
    Added,
    #[strum(serialize = "M")]
    Modified,
    #[strum(serialize = "D")]
    Deleted,
    #[strum(serialize = "R")]
    Renamed,
    #[strum(serialize = "C")]
    Copied,
}

impl ChangeType {
    pub fn as_letter(self) -> &'static str {
        match self {
            ChangeType::Added => "A",
            ChangeType::Modified => "M",
            ChangeType::Deleted => "D",
            ChangeType::Renamed => "R",
            ChangeType::Copied => "C",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Function,
    Method,
    Interface,
}

/// Normalise a filesystem path to the POSIX, repo-relative form every key in the graph is
/// hashed from: forward slashes, no `.`/`..` segments, case preserved.
pub fn normalize_path(path: &Path) -> String {
    let mut parts = Vec::new();

    for component in path.components() {
        match component {
            std::path::Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }

    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn normalizes_windows_style_and_dot_segments() {
        let path = PathBuf::from("src/./foo/../bar.rs");
        assert_eq!(normalize_path(&path), "src/bar.rs");
    }

    #[test]
    fn uid_is_stable_for_same_kind_and_key() {
        let a = Uid::of(NodeKind::File, "src/bar.rs");
        let b = Uid::of(NodeKind::File, "src/bar.rs");
        assert_eq!(a, b);
    }

    #[test]
    fn uid_differs_across_kinds_with_same_key() {
        let a = Uid::of(NodeKind::File, "07");
        let b = Uid::of(NodeKind::Sprint, "07");
        assert_ne!(a, b);
    }

    #[test]
    fn temporal_classification_matches_spec() {
        assert!(EdgeKind::Touched.is_temporal());
        assert!(EdgeKind::RefactoredTo.is_temporal());
        assert!(!EdgeKind::Contains.is_temporal());
        assert!(!EdgeKind::CoOccursWith.is_temporal());
    }
}
