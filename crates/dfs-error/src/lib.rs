#![forbid(unsafe_code)]
//! Error types for DumbFS.
//!
//! Defines `DfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for host VFS adapters, which expect a single
//! negative status per failure kind.

use dfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all DumbFS operations.
#[derive(Debug, Error)]
pub enum DfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("flash {op} failed at offset {offset}: {detail}")]
    Flash {
        op: &'static str,
        offset: u64,
        detail: String,
    },

    #[error("corrupt on-flash metadata: {0}")]
    Layout(#[from] ParseError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("inode table full ({max} inodes)")]
    NoInodes { max: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("file exists: {0}")]
    Exists(String),

    #[error("device too small: need {needed} bytes, have {available}")]
    NoSpace { needed: u64, available: u64 },

    #[error("name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },
}

impl DfsError {
    /// Convert this error into a POSIX errno for a host VFS adapter.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Flash { .. } | Self::Layout(_) => libc::EIO,
            Self::NotFound(_) => libc::ENOENT,
            Self::NoInodes { .. } => libc::ENOMEM,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::Exists(_) => libc::EEXIST,
            Self::NoSpace { .. } => libc::ENOSPC,
            Self::NameTooLong { .. } => libc::ENAMETOOLONG,
        }
    }
}

/// Result alias using `DfsError`.
pub type Result<T> = std::result::Result<T, DfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_public_contract() {
        assert_eq!(DfsError::NotFound("a".into()).to_errno(), libc::ENOENT);
        assert_eq!(DfsError::NoInodes { max: 17 }.to_errno(), libc::ENOMEM);
        assert_eq!(
            DfsError::InvalidArgument("truncate is grow-only").to_errno(),
            libc::EINVAL
        );
        assert_eq!(
            DfsError::Flash {
                op: "erase",
                offset: 0,
                detail: "simulated".into(),
            }
            .to_errno(),
            libc::EIO
        );
    }
}
