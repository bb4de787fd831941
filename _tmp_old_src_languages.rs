//! Extension-to-language lookup table. Rather than loading a tree-sitter grammar and a
//! `tags.scm` query per language, this crate dispatches to the shallow, grammar-free parsing
//! rules in `symbols.rs` instead, so no grammar crates or `.scm` files are carried forward.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// Each source language this crate recognises for symbol extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum Lang {
    C,
    Cpp,
    Go,
    Java,
    JavaScript,
    Kotlin,
    Markdown,
    Python,
    Ruby,
    TypeScript,
}

/// The shallow parsing family a language's symbols are extracted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxFamily {
    /// Indentation/`def`/`class` rules (Python-like).
    Indentation,
    /// Brace + signature regex (JS/TS-like).
    BraceSignature,
    /// Brace + `func`/`type` (Go-like).
    BraceFuncType,
}

impl Lang {
    pub fn of<S: AsRef<str>>(filename: S) -> Option<Self> {
        LANG_TABLE.get_lang(filename)
    }

    pub fn is_code(self) -> bool {
        !matches!(self, Lang::Markdown)
    }

    pub fn is_doc(self) -> bool {
        matches!(self, Lang::Markdown)
    }

    pub fn syntax_family(self) -> SyntaxFamily {
        match self {
            Lang::Python | Lang::Ruby => SyntaxFamily::Indentation,
            Lang::JavaScript | Lang::TypeScript | Lang::Java | Lang::Kotlin => {
                SyntaxFamily::BraceSignature
            }
            Lang::Go | Lang::C | Lang::Cpp => SyntaxFamily::BraceFuncType,
            Lang::Markdown => SyntaxFamily::BraceSignature,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct LangLookupTable {
    special_files: HashMap<String, Lang>,
    extensions: HashMap<String, Lang>,
}

impl LangLookupTable {
    fn get_lang<S: AsRef<str>>(&self, filename: S) -> Option<Lang> {
        self.special_files
            .get(filename.as_ref())
            .or_else(|| {
                filename.as_ref().to_lowercase().rsplit('.').next().and_then(|e| self.extensions.get(e))
            })
            .copied()
    }

    fn insert_special_file(&mut self, lang: Lang, special: &str) {
        self.special_files.insert(special.to_lowercase(), lang);
    }

    fn insert_extension(&mut self, lang: Lang, ext: &str) {
        self.extensions.insert(ext.to_lowercase(), lang);
    }
}

lazy_static! {
    static ref LANG_TABLE: LangLookupTable = {
        let mut table = LangLookupTable::default();
        table.insert_extension(Lang::C, "c");
        table.insert_extension(Lang::C, "h");
        table.insert_extension(Lang::Cpp, "cc");
        table.insert_extension(Lang::Cpp, "cpp");
        table.insert_extension(Lang::Cpp, "cxx");
        table.insert_extension(Lang::Cpp, "hh");
        table.insert_extension(Lang::Cpp, "hpp");
        table.insert_extension(Lang::Cpp, "hxx");
        table.insert_extension(Lang::Go, "go");
        table.insert_extension(Lang::Java, "java");
        table.insert_extension(Lang::JavaScript, "js");
        table.insert_extension(Lang::JavaScript, "jsx");
        table.insert_extension(Lang::Kotlin, "kt");
        table.insert_extension(Lang::Markdown, "md");
        table.insert_extension(Lang::Markdown, "markdown");
        table.insert_extension(Lang::Python, "py");
        table.insert_extension(Lang::Ruby, "rb");
        table.insert_extension(Lang::TypeScript, "ts");
        table.insert_extension(Lang::TypeScript, "tsx");
        table.insert_special_file(Lang::TypeScript, "tsconfig.json");
        table
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_by_extension_case_insensitively() {
        assert_eq!(Lang::of("Main.JAVA"), Some(Lang::Java));
        assert_eq!(Lang::of("README.md"), Some(Lang::Markdown));
        assert_eq!(Lang::of("unknown.xyz"), None);
    }

    #[test]
    fn markdown_is_doc_not_code() {
        assert!(Lang::Markdown.is_doc());
        assert!(!Lang::Markdown.is_code());
        assert!(Lang::Python.is_code());
    }
}


