use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DataError {
    #[error("request to {url} failed: {message}")]
    #[diagnostic(help("the cached copy of this source (if any) is used instead"))]
    Fetch { url: String, message: String },

    #[error("{url} returned status {status}: {message}")]
    FetchStatus {
        url: String,
        status: u16,
        message: String,
    },

    #[error("no revision marker found at {url}")]
    RevisionNotFound { url: String },

    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("no usable rows in {file}")]
    Unparseable { file: String },

    #[error("{file} references {entity:?}, which has no population entry")]
    UnknownEntity { file: String, entity: String },

    #[error("{file} matches no known schema (header: {header})")]
    #[diagnostic(help("the upstream file format has changed; the loader needs updating"))]
    SchemaAmbiguity { file: String, header: String },

    #[error("data file not found: {0}")]
    MissingFile(PathBuf),

    #[error("dataset not loaded: {0}")]
    DatasetUnavailable(String),

    #[error("unknown nation: {0}")]
    UnknownNation(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("missing config file at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("an update is already in progress")]
    UpdateInProgress,

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl DataError {
    /// Row-level problems are skipped with a warning; everything else aborts
    /// the dataset being loaded.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DataError::Parse { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            DataError::Fetch { .. }
                | DataError::FetchStatus { .. }
                | DataError::RevisionNotFound { .. }
        )
    }
}
