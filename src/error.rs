use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("conflicting {kind} {key}: {message}")]
    #[diagnostic(help("recorded entries are never overwritten; fix the input or the catalog"))]
    Conflict {
        kind: &'static str,
        key: String,
        message: String,
    },

    #[error("catalog store I/O failed at {path}: {message}")]
    StoreIo { path: Utf8PathBuf, message: String },

    #[error("catalog at {0} is locked by another process")]
    #[diagnostic(help("another runcat process is writing to this catalog; retry once it exits"))]
    StoreLocked(Utf8PathBuf),

    #[error("catalog at {0} was opened read-only")]
    ReadOnly(Utf8PathBuf),

    #[error("catalog data at {path} is corrupt: {message}")]
    CorruptStore { path: Utf8PathBuf, message: String },

    #[error("manifest line {line}: {message}")]
    ManifestParse { line: usize, message: String },

    #[error("invalid external identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid run key: {0:?}")]
    InvalidRunKey(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("missing config file runcat.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("manifest request failed: {0}")]
    ManifestHttp(String),

    #[error("manifest server returned status {status}: {message}")]
    ManifestStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("annotation runner failed for {document}: {message}")]
    Runner { document: String, message: String },
}

impl CatalogError {
    pub(crate) fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        CatalogError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub(crate) fn conflict(
        kind: &'static str,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CatalogError::Conflict {
            kind,
            key: key.into(),
            message: message.into(),
        }
    }

    pub(crate) fn store_io(path: &Utf8Path, err: impl ToString) -> Self {
        CatalogError::StoreIo {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }
}
