//! Layered configuration: built-in defaults, an optional `dev-graph.toml`, CLI flags, then
//! `DEVGRAPH_*` environment variables, highest precedence last, via the two-stage
//! parse-then-normalise idiom used for `Cli`/`ProcessedCli` in `main.rs`.

use std::env;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::EngineError;
use crate::errors::EngineResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub repo_path: PathBuf,
    pub graph_store_url: Option<String>,
    pub graph_store_user: Option<String>,
    pub graph_store_password: Option<String>,
    pub reset_graph: bool,
    pub commit_limit: usize,
    pub derive_relationships: bool,
    pub subpath: Option<String>,
    pub max_workers: usize,
    pub exclude_patterns: Vec<String>,
    pub dry_run: bool,
}

/// The raw TOML/env/CLI shape; every field optional so each layer only supplies what it knows.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigLayer {
    pub repo_path: Option<PathBuf>,
    pub graph_store_url: Option<String>,
    pub graph_store_user: Option<String>,
    pub graph_store_password: Option<String>,
    pub reset_graph: Option<bool>,
    pub commit_limit: Option<usize>,
    pub derive_relationships: Option<bool>,
    pub subpath: Option<String>,
    pub max_workers: Option<usize>,
    pub exclude_patterns: Option<Vec<String>>,
    pub dry_run: Option<bool>,
}

impl ConfigLayer {
    fn merge(self, over: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            repo_path: over.repo_path.or(self.repo_path),
            graph_store_url: over.graph_store_url.or(self.graph_store_url),
            graph_store_user: over.graph_store_user.or(self.graph_store_user),
            graph_store_password: over.graph_store_password.or(self.graph_store_password),
            reset_graph: over.reset_graph.or(self.reset_graph),
            commit_limit: over.commit_limit.or(self.commit_limit),
            derive_relationships: over.derive_relationships.or(self.derive_relationships),
            subpath: over.subpath.or(self.subpath),
            max_workers: over.max_workers.or(self.max_workers),
            exclude_patterns: over.exclude_patterns.or(self.exclude_patterns),
            dry_run: over.dry_run.or(self.dry_run),
        }
    }
}

fn from_env() -> ConfigLayer {
    let bool_var = |name: &str| env::var(name).ok().and_then(|v| v.parse::<bool>().ok());
    let usize_var = |name: &str| env::var(name).ok().and_then(|v| v.parse::<usize>().ok());

    ConfigLayer {
        repo_path: env::var("DEVGRAPH_REPO_PATH").ok().map(PathBuf::from),
        graph_store_url: env::var("DEVGRAPH_GRAPH_STORE_URL").ok(),
        graph_store_user: env::var("DEVGRAPH_GRAPH_STORE_USER").ok(),
        graph_store_password: env::var("DEVGRAPH_GRAPH_STORE_PASSWORD").ok(),
        reset_graph: bool_var("DEVGRAPH_RESET_GRAPH"),
        commit_limit: usize_var("DEVGRAPH_COMMIT_LIMIT"),
        derive_relationships: bool_var("DEVGRAPH_DERIVE_RELATIONSHIPS"),
        subpath: env::var("DEVGRAPH_SUBPATH").ok(),
        max_workers: usize_var("DEVGRAPH_MAX_WORKERS"),
        exclude_patterns: env::var("DEVGRAPH_EXCLUDE_PATTERNS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect()),
        dry_run: bool_var("DEVGRAPH_DRY_RUN"),
    }
}

fn from_toml_file(repo_path: &Path) -> EngineResult<ConfigLayer> {
    let path = repo_path.join("dev-graph.toml");

    if !path.exists() {
        return Ok(ConfigLayer::default());
    }

    let text = std::fs::read_to_string(&path)
        .map_err(|e| EngineError::Configuration(format!("failed to read {}: {e}", path.display())))?;

    toml::from_str(&text)
        .map_err(|e| EngineError::Configuration(format!("invalid {}: {e}", path.display())))
}

impl Config {
    /// Build a `Config` by layering defaults, the repo's `dev-graph.toml` (if any), CLI flags,
    /// and `DEVGRAPH_*` environment variables, in increasing precedence.
    pub fn resolve(cli: ConfigLayer) -> EngineResult<Config> {
        let repo_path = cli
            .repo_path
            .clone()
            .ok_or_else(|| EngineError::Configuration("repo_path is required".into()))?;

        if !repo_path.exists() {
            return Err(EngineError::Configuration(format!(
                "repo_path {} does not exist",
                repo_path.display()
            )));
        }

        let defaults = ConfigLayer {
            repo_path: Some(repo_path.clone()),
            reset_graph: Some(false),
            commit_limit: Some(1000),
            derive_relationships: Some(true),
            max_workers: Some(num_cpus()),
            exclude_patterns: Some(default_exclude_patterns()),
            dry_run: Some(false),
            ..Default::default()
        };

        let from_file = from_toml_file(&repo_path)?;
        let merged = defaults.merge(from_file).merge(cli).merge(from_env());

        Ok(Config {
            repo_path: merged.repo_path.unwrap(),
            graph_store_url: merged.graph_store_url,
            graph_store_user: merged.graph_store_user,
            graph_store_password: merged.graph_store_password,
            reset_graph: merged.reset_graph.unwrap(),
            commit_limit: merged.commit_limit.unwrap(),
            derive_relationships: merged.derive_relationships.unwrap(),
            subpath: merged.subpath,
            max_workers: merged.max_workers.unwrap().max(1),
            exclude_patterns: merged.exclude_patterns.unwrap(),
            dry_run: merged.dry_run.unwrap(),
        })
    }

    /// Where the embedded graph store file lives for this repo, honouring `graph_store_url` as
    /// a local path override.
    pub fn store_path(&self) -> PathBuf {
        match &self.graph_store_url {
            Some(url) if !url.is_empty() => PathBuf::from(url),
            _ => self.repo_path.join(".devgraph").join("graph.sqlite"),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        ".git/**".into(),
        "node_modules/**".into(),
        "target/**".into(),
        "dist/**".into(),
        "build/**".into(),
        "*.lock".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_repo_path() {
        let layer = ConfigLayer::default();
        let err = Config::resolve(layer).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn resolves_defaults_against_a_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        let layer = ConfigLayer { repo_path: Some(dir.path().to_path_buf()), ..Default::default() };
        let config = Config::resolve(layer).unwrap();
        assert!(config.derive_relationships);
        assert_eq!(config.commit_limit, 1000);
        assert!(!config.dry_run);
    }
}
