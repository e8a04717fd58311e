#![forbid(unsafe_code)]
//! DumbFS public API facade.
//!
//! Re-exports core functionality from `dfs-core` through a stable external
//! interface. This is the crate that downstream consumers (CLI, host VFS
//! adapters) depend on.

pub use dfs_core::*;
