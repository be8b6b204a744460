use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("manifest unavailable: {0}")]
    #[diagnostic(help("check the spreadsheet id or the --manifest path"))]
    ManifestUnavailable(String),

    #[error("manifest row {row}: {message}")]
    ManifestRow { row: usize, message: String },

    #[error("{dimension} filter lists `{value}` in both include and exclude")]
    #[diagnostic(help("remove the value from one of the two lists"))]
    ConflictingFilter { dimension: String, value: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("confirmation to {granted} does not authorize {requested}")]
    Unauthorized { granted: String, requested: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("download request failed: {0}")]
    FetchHttp(String),

    #[error("server returned status {status} for {url}")]
    FetchStatus { status: u16, url: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("unsupported archive: {0}")]
    UnsupportedArchive(String),
}
