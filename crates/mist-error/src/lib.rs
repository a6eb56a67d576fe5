#![forbid(unsafe_code)]
//! Error types for MistFS.
//!
//! Defines `MistError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for the wire status codes the serve task emits.

use thiserror::Error;

/// Unified error type for all MistFS operations.
#[derive(Debug, Error)]
pub enum MistError {
    #[error("file exists")]
    Exists,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("stale node or link reference")]
    Stale,

    #[error("operation cancelled")]
    Cancelled,

    #[error("peer lane closed")]
    LaneClosed,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl MistError {
    /// Convert this error into a POSIX errno suitable for wire status codes.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Exists => libc::EEXIST,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::Stale => libc::ESTALE,
            Self::Cancelled => libc::ECANCELED,
            Self::LaneClosed => libc::EPIPE,
            Self::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `MistError`.
pub type Result<T> = std::result::Result<T, MistError>;
