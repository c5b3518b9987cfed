//! Error types for the archive.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors raised by the archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The backing file could not be opened.
    #[error("unable to open archive {path}: {source}")]
    Open {
        /// Archive file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A statement failed.
    #[error("archive query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Object type names become table names and are restricted to
    /// ASCII letters, digits and `_`.
    #[error("invalid object type name: {0:?}")]
    InvalidObjType(String),

    /// An update referenced a row that does not exist.
    #[error("no archived change with id {id} for object type {objtype}")]
    NotFound {
        /// Object type.
        objtype: String,
        /// Row id.
        id: i64,
    },

    /// A stored value could not be decoded.
    #[error("archive is corrupt: {0}")]
    Corrupt(String),
}
