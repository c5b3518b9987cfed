//! Error types for format handling and group files.

use thiserror::Error;

/// Result type for format operations.
pub type FormatResult<T> = Result<T, FormatError>;

/// Result type for group file operations.
pub type GroupResult<T> = Result<T, GroupError>;

/// Errors raised by a [`FormatEnv`](crate::FormatEnv).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// No conversion path to the requested format.
    #[error("unable to convert from {from} to {to}")]
    NoConversionPath {
        /// Source format.
        from: String,
        /// Target format.
        to: String,
    },

    /// The conversion itself failed.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// The payload carries no usable revision.
    #[error("unable to get revision: {0}")]
    Revision(String),

    /// The change cannot be elevated.
    #[error("unable to duplicate change: {0}")]
    Elevation(String),
}

/// Errors reading or writing a group description.
#[derive(Error, Debug)]
pub enum GroupError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed group file.
    #[error("invalid group file: {0}")]
    Parse(#[from] serde_json::Error),
}
