use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BindingError {
    /// The backing path cannot hold a document (a directory, a non-object root).
    #[error("Invalid target {path}: {reason}")]
    InvalidTarget { path: PathBuf, reason: String },

    #[error("Could not lock {path}: {source}")]
    LockAcquisition {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Cannot coerce {value:?} to {target}")]
    Coercion { value: String, target: String },

    /// A non-string key, or a non-object value where a row is expected.
    #[error("Type error: {0}")]
    Type(String),

    #[error("Binding for {0} is closed")]
    Closed(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl BindingError {
    pub(crate) fn coercion(value: impl Into<String>, target: impl Into<String>) -> Self {
        BindingError::Coercion {
            value: value.into(),
            target: target.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BindingError>;
