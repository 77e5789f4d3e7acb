use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use umbra_shared::ValidationError;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Bad input shape. Nothing was persisted.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Another writer held the store lock for the whole timeout.
    #[error("Timed out after {waited:?} waiting for lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The store document is unreadable and no snapshot could replace it.
    #[error("Store document {} is corrupt: {reason}", .path.display())]
    StoreCorrupt { path: PathBuf, reason: String },

    /// A schema transform failed; the pre-migration snapshot was put back.
    #[error("Migration from schema {from} to {to} failed: {reason}")]
    Migration { from: u32, to: u32, reason: String },

    /// Archive or snapshot I/O failed; no partial archive is left behind.
    #[error("Backup {op} failed for {}: {reason}", .path.display())]
    Backup {
        op: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// Extraction failed after the safety backup was taken.
    #[error("Restore of {backup} failed (safety backup {safety_backup} kept): {reason}")]
    Restore {
        backup: String,
        safety_backup: String,
        reason: String,
    },

    /// Writing a new document failed; the previous one is untouched.
    #[error("Failed to persist {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Plain filesystem failure outside the document write itself.
    #[error("IO error during {op} on {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Adapter for `map_err` on raw I/O results.
    pub fn io(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| StoreError::Io { op, path, source }
    }

    pub fn persist(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| StoreError::Persist { path, source }
    }

    pub fn backup(op: &'static str, path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StoreError::Backup {
            op,
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether the caller can reasonably retry (possibly after fixing input).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Validation(_) | StoreError::LockTimeout { .. } | StoreError::NotFound { .. }
        )
    }

    /// Message suitable for an operator-facing surface.
    pub fn user_message(&self) -> String {
        match self {
            StoreError::Validation(e) => format!("{e}. Please correct the input and try again."),
            StoreError::LockTimeout { .. } => {
                "The configuration store is busy. Please retry in a moment.".to_string()
            }
            StoreError::NotFound { .. } => self.to_string(),
            _ => format!("{self}. Contact the operator and check the service log."),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
