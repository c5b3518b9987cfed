//! Error types for the engine.

use polysync_archive::ArchiveError;
use polysync_types::{FormatError, MemberId};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while configuring or running a sync.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The group cannot be synchronized as configured.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// Another engine holds the group lock.
    #[error("group is locked by another engine")]
    Locked,

    /// Generic failure.
    #[error("{0}")]
    Generic(String),

    /// A member reported a failure.
    #[error("member {member_id}: {message}")]
    Member {
        /// Failing member.
        member_id: MemberId,
        /// Error message.
        message: String,
    },

    /// Archive failure.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Format collaborator failure.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// A mapping has no master to propagate.
    #[error("no master set")]
    NoMaster,

    /// Latest-wins resolution found two equally recent entries.
    #[error("entries got changed at the same time, can't decide")]
    RevisionTie,

    /// The engine has not been initialized.
    #[error("engine is not initialized")]
    NotInitialized,

    /// The engine was already initialized.
    #[error("engine is already initialized")]
    AlreadyInitialized,

    /// A synchronization is already running.
    #[error("a synchronization is already running")]
    Busy,

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The engine thread is gone.
    #[error("engine thread is not running")]
    Disconnected,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error recorded on top of an earlier one.
    #[error("{error}")]
    Stacked {
        /// The most recent error.
        error: Box<EngineError>,
        /// The error recorded before it.
        #[source]
        cause: Box<EngineError>,
    },
}

impl EngineError {
    /// Creates a generic error.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic(message.into())
    }

    /// Creates a member-scoped error.
    pub fn member(member_id: MemberId, message: impl Into<String>) -> Self {
        Self::Member {
            member_id,
            message: message.into(),
        }
    }

    /// Records `self` on top of `previous`, if there is one.
    pub fn stacked_on(self, previous: Option<EngineError>) -> Self {
        match previous {
            Some(cause) => Self::Stacked {
                error: Box::new(self),
                cause: Box::new(cause),
            },
            None => self,
        }
    }

    /// Returns the first error of a stack.
    pub fn root_cause(&self) -> &EngineError {
        let mut current = self;
        while let EngineError::Stacked { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// Returns true for errors raised by configuration checks.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.root_cause(),
            EngineError::Misconfiguration(_) | EngineError::Locked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn stacking_keeps_cause_chain() {
        let first = EngineError::member(2, "connection refused");
        let second = EngineError::generic("fewer members connected");
        let stacked = second.stacked_on(Some(first));

        assert_eq!(stacked.to_string(), "fewer members connected");
        assert_eq!(stacked.root_cause().to_string(), "member 2: connection refused");
        assert!(stacked.source().is_some());
    }

    #[test]
    fn stacking_on_nothing_is_identity() {
        let err = EngineError::NoMaster.stacked_on(None);
        assert!(matches!(err, EngineError::NoMaster));
        assert!(matches!(err.root_cause(), EngineError::NoMaster));
    }

    #[test]
    fn configuration_errors() {
        assert!(EngineError::Locked.is_configuration());
        assert!(EngineError::Misconfiguration("x".into()).is_configuration());
        assert!(!EngineError::RevisionTie.is_configuration());
    }
}
