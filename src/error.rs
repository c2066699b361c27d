//! Error taxonomy for the gap and capability lifecycle core
//!
//! Expected failures (not-found, wrong state, dependency blocks, path rejections)
//! are mapped onto a [`FailureKind`] and reported through structured outcomes.
//! Store, I/O and serialization failures propagate as errors.

use serde::Serialize;
use thiserror::Error;

/// Machine-readable category for a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    InvalidState,
    PathNotAllowed,
    PathTraversal,
    DependencyBlocked,
    CyclicDependency,
    Cancelled,
    Store,
    Io,
}

impl FailureKind {
    /// Code used in log lines and CLI output
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::PathNotAllowed => "PATH_NOT_ALLOWED",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::DependencyBlocked => "DEPENDENCY_BLOCKED",
            Self::CyclicDependency => "CYCLIC_DEPENDENCY",
            Self::Cancelled => "CANCELLED",
            Self::Store => "STORE_ERROR",
            Self::Io => "IO_ERROR",
        }
    }

    /// Whether this failure is part of normal operation rather than a fault
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Store | Self::Io)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Core error type
#[derive(Debug, Error)]
pub enum EvolveError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("installation path not allowed: {0}")]
    PathNotAllowed(String),

    #[error("path traversal detected: {0}")]
    PathTraversal(String),

    #[error("rollback blocked: required by {}", .dependents.join(", "))]
    DependencyBlocked { dependents: Vec<String> },

    #[error("dependency would create a required cycle: {0}")]
    CyclicDependency(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EvolveError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    /// Map onto the structured failure category
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotFound { .. } => FailureKind::NotFound,
            Self::InvalidState(_) => FailureKind::InvalidState,
            Self::PathNotAllowed(_) => FailureKind::PathNotAllowed,
            Self::PathTraversal(_) => FailureKind::PathTraversal,
            Self::DependencyBlocked { .. } => FailureKind::DependencyBlocked,
            Self::CyclicDependency(_) => FailureKind::CyclicDependency,
            Self::Store(_) | Self::Serialization(_) => FailureKind::Store,
            Self::Io(_) => FailureKind::Io,
        }
    }

    /// True when the datastore reported a busy/locked database after the lock wait
    pub fn is_lock_timeout(&self) -> bool {
        match self {
            Self::Store(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EvolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EvolveError::not_found("gap", "gap-1").kind(), FailureKind::NotFound);
        assert_eq!(
            EvolveError::PathTraversal("../x".into()).kind(),
            FailureKind::PathTraversal
        );
        assert!(FailureKind::DependencyBlocked.is_expected());
        assert!(!FailureKind::Store.is_expected());
    }

    #[test]
    fn test_dependency_blocked_message() {
        let err = EvolveError::DependencyBlocked {
            dependents: vec!["pdf-reader".into(), "pdf-writer".into()],
        };
        assert_eq!(err.to_string(), "rollback blocked: required by pdf-reader, pdf-writer");
    }
}
