use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::Rank;
use crate::fetch::FetchError;

/// Whether retrying the failed operation on a later run can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Terminal,
    Transient,
}

#[derive(Debug, Error, Diagnostic)]
pub enum EnrichError {
    #[error("invalid batch entry: {0}")]
    InvalidBatchEntry(String),

    #[error("invalid rank: {0}")]
    InvalidRank(String),

    #[error("invalid taxon id: {0}")]
    InvalidTaxonId(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("no taxonomy match for {0}")]
    #[diagnostic(help("check the spelling of the scientific name"))]
    NoMatch(String),

    #[error("taxon not found locally: {0}")]
    TaxonNotFound(String),

    #[error("{child_rank} {child} cannot sit under {parent_rank} {parent}")]
    InvalidLineage {
        child: String,
        child_rank: Rank,
        parent: String,
        parent_rank: Rank,
    },

    #[error("{service} request failed: {source}")]
    Upstream {
        service: &'static str,
        #[source]
        source: FetchError,
    },

    #[error("{service} returned an unexpected payload: {message}")]
    Payload {
        service: &'static str,
        message: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl EnrichError {
    pub fn upstream(service: &'static str, source: FetchError) -> Self {
        Self::Upstream { service, source }
    }

    pub fn payload(service: &'static str, message: impl Into<String>) -> Self {
        Self::Payload {
            service,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EnrichError::Upstream { source, .. } => source.class(),
            EnrichError::Database(_) | EnrichError::Checkpoint(_) | EnrichError::Filesystem(_) => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }
}
