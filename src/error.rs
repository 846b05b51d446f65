//! Error types for amplicora.
//!
//! Argument and file problems abort the run before any output is produced;
//! per-read arithmetic failures never surface here — the offending read is
//! dropped and counted instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can abort an amplicora run.
#[derive(Debug, Error)]
pub enum AmplicoraError {
    /// A primer string failed validation.
    #[error("invalid primer '{primer}': {details}")]
    InvalidPrimer { primer: String, details: String },

    /// Incompatible length bounds were requested.
    #[error("invalid length bounds: min {min} exceeds max {max}")]
    InvalidLengthBounds { min: usize, max: usize },

    /// A glob pattern matched no files.
    #[error("no read files match '{pattern}'")]
    UnmatchedGlob { pattern: String },

    /// Paired mode needs an even file count.
    #[error("{count} read files cannot be split into pairs")]
    UnpairableFiles { count: usize },

    /// Failed to read a sequence file.
    #[error("failed to read sequence file '{path}': {source}")]
    SequenceRead {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to parse a sequence record.
    #[error("failed to parse sequence record in '{path}': {details}")]
    SequenceParse { details: String, path: PathBuf },

    /// No read beginning with the forward primer was found.
    #[error("no reads start with the forward primer; nothing to assemble")]
    NoStartingReads,

    /// The temp partition directory could not be created or written.
    #[error("temp directory unusable: {source}")]
    TempDir {
        #[source]
        source: std::io::Error,
    },

    /// Failed to write an output file.
    #[error("failed to write '{path}': {source}")]
    OutputWrite {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to serialize the JSON stats dump.
    #[error("failed to serialize stats: {source}")]
    StatsJson {
        #[source]
        source: serde_json::Error,
    },
}

impl From<serde_json::Error> for AmplicoraError {
    fn from(source: serde_json::Error) -> Self {
        AmplicoraError::StatsJson { source }
    }
}
