//! Error taxonomy and the CLI exit-code mapping.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("repository unreadable: {0}")]
    RepositoryUnreadable(#[source] anyhow::Error),

    #[error("graph store unreachable: {0}")]
    StoreTransient(#[source] anyhow::Error),

    #[error("graph store permanent failure: {0}")]
    StorePermanent(#[source] anyhow::Error),

    #[error("failed to decode {path}: {source}")]
    Decoding { path: String, #[source] source: anyhow::Error },

    #[error("derivation family {family} failed: {source}")]
    Derivation { family: String, #[source] source: anyhow::Error },

    #[error("a job is already running for this repository")]
    JobAlreadyRunning,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Process exit codes: 0 success, 2 configuration error, 3 repository unreadable, 4 graph-store
/// unreachable, 5 stage failure, 130 cancelled.
impl EngineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Configuration(_) => 2,
            EngineError::RepositoryUnreadable(_) => 3,
            EngineError::StoreTransient(_) | EngineError::StorePermanent(_) => 4,
            EngineError::Cancelled => 130,
            EngineError::Decoding { .. }
            | EngineError::Derivation { .. }
            | EngineError::JobAlreadyRunning
            | EngineError::Other(_) => 5,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, EngineError::StoreTransient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "configuration",
            EngineError::RepositoryUnreadable(_) => "repository_unreadable",
            EngineError::StoreTransient(_) => "store_transient",
            EngineError::StorePermanent(_) => "store_permanent",
            EngineError::Decoding { .. } => "decoding",
            EngineError::Derivation { .. } => "derivation",
            EngineError::JobAlreadyRunning => "job_already_running",
            EngineError::Cancelled => "cancelled",
            EngineError::Other(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(EngineError::Configuration("x".into()).exit_code(), 2);
        assert_eq!(
            EngineError::RepositoryUnreadable(anyhow::anyhow!("x")).exit_code(),
            3
        );
        assert_eq!(EngineError::StoreTransient(anyhow::anyhow!("x")).exit_code(), 4);
        assert_eq!(EngineError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn only_transient_store_errors_are_retryable() {
        assert!(EngineError::StoreTransient(anyhow::anyhow!("x")).retryable());
        assert!(!EngineError::StorePermanent(anyhow::anyhow!("x")).retryable());
    }
}
