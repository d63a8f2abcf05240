//! Error type shared by every stage of the lake build.

use std::path::PathBuf;

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtlError {
    /// A record is missing an expected field, carries a value of the wrong
    /// type, or is not valid JSON. Fatal for the owning extractor.
    #[error("schema mismatch in {}:{line}: {message}", path.display())]
    SchemaMismatch {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("no input files under '{}' match '{pattern}'", root.display())]
    NoInput { root: PathBuf, pattern: String },

    #[error("invalid source pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to scan '{}': {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsafe output location: {0}")]
    UnsafeOutput(String),

    #[error("timestamp {ts} ms is outside the supported range")]
    TimestampOutOfRange { ts: i64 },

    #[error("song play at {start_time} ({artist} / {song}) matches {matches} catalog records")]
    AmbiguousMatch {
        start_time: String,
        artist: String,
        song: String,
        matches: usize,
    },

    #[error("conflicting {table} rows share key {key}")]
    DedupConflict { table: &'static str, key: String },

    #[error("table '{table}' is malformed: {message}")]
    Table { table: String, message: String },

    #[error(transparent)]
    Arrow(#[from] ArrowError),

    #[error(transparent)]
    Parquet(#[from] ParquetError),
}

impl EtlError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EtlError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
