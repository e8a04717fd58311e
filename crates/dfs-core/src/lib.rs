#![forbid(unsafe_code)]
//! DumbFS core: a minimal flat filesystem for raw NAND-style flash.
//!
//! Flash only supports erase-before-write at erase-block granularity, so the
//! interesting machinery is the buffered-rewrite engine in [`rewrite`],
//! which emulates arbitrary in-place byte writes by rebuilding whole blocks
//! through a scratch area. Everything else is deliberately dumb: a
//! superblock, a fixed dirent table, and one preallocated extent per file.
//!
//! The namespace is flat and append-only within a mount: files live in the
//! root, are never deleted, and only grow.

mod config;
mod fs;
mod rewrite;

pub use config::{DfsConfig, ScratchMode};
pub use fs::{DirCursor, DumbFs, FS_NAME, FsOps, Inode, OpenFile, PathStyle, ReadDir};
pub use rewrite::{BlockScratch, RamScratch, Scratch, buffered_write};

pub use dfs_error::{DfsError, Result};
pub use dfs_ondisk::{DIRENT_SIZE, DirEntry, FileKind, NAME_LEN, SB_SIZE, SbInfo, dirent_offset};
pub use dfs_types::{BlockIndex, ByteOffset, InodeNo, SCRATCH_NONE};
