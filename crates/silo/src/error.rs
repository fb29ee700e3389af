//! Error and Result types for silo storage operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for silo operations.
pub type Result<T> = std::result::Result<T, SiloError>;

/// The error type for storage operations.
#[derive(Debug, Error)]
pub enum SiloError {
    /// A named resource (database, series or chunk) is absent.
    #[error("does not exist: {0}")]
    DoesNotExist(String),

    /// A create-time name collision on a directory or file.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Unreadable header or footer, unparseable chunk filename,
    /// inconsistent metadata, or an irrecoverable mapping failure.
    #[error("corrupted storage: {0}")]
    Corruption(String),

    /// Operation attempted on a closed resource, or on a resource in a
    /// state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Attempt to close or evict a chunk while outstanding references
    /// remain.
    #[error("still open: {0} outstanding reference(s)")]
    StillOpen(u32),

    /// An argument violates a documented constraint.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required codec is unavailable for the on-disk format encountered,
    /// or the on-disk layout is ambiguous about which codec to use.
    #[error("environment error: {0}")]
    Environment(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SiloError {
    /// Shorthand for a [`SiloError::Corruption`] with a formatted reason.
    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        Self::Corruption(reason.into())
    }

    /// Shorthand for a [`SiloError::InvalidArgument`] with a formatted
    /// reason.
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }
}
