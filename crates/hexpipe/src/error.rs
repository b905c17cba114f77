//! Error taxonomy for the pipeline.
//!
//! Per-row conditions ([`CellError`], property-cap drops) never leave a worker;
//! they are folded into a [`crate::worker::ProcessingResult`]. Everything in
//! [`PipelineError`] is systemic and aborts the run.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to read the columnar source. Always fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
}

/// Why a row's cell column could not be turned into a valid cell.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("row has no recognised H3 column")]
    MissingCellColumn,

    #[error("invalid H3 cell {value:?}: {reason}")]
    InvalidCell { value: String, reason: String },
}

impl CellError {
    pub(crate) fn invalid(value: impl Into<String>, reason: impl Into<String>) -> Self {
        CellError::InvalidCell {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Best-effort textual form of the offending value, for diagnostics.
    pub fn value(&self) -> &str {
        match self {
            CellError::MissingCellColumn => "",
            CellError::InvalidCell { value, .. } => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("empty boundary for cell {0}")]
    EmptyBoundary(String),
}

/// Failures of the external tiling/publishing collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{tool} CLI not found ({candidate}); install it or pass an explicit path")]
    NotFound { tool: &'static str, candidate: String },

    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed ({status}):\n{output}")]
    Failed {
        tool: &'static str,
        status: String,
        output: String,
    },

    #[error("{tool} returned malformed output: {source}")]
    MalformedResponse {
        tool: &'static str,
        output: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{tool} was cancelled")]
    Cancelled { tool: &'static str },
}

impl CollaboratorError {
    /// Captured combined stdout/stderr, when the tool produced any.
    pub fn output(&self) -> Option<&str> {
        match self {
            CollaboratorError::Failed { output, .. }
            | CollaboratorError::MalformedResponse { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Systemic failure that cancels the whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to serialize {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write feature stream: {0}")]
    SinkWrite(#[source] std::io::Error),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write parquet: {0}")]
    ParquetWrite(#[source] parquet::errors::ParquetError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("pipeline cancelled")]
    Cancelled,
}

impl PipelineError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
