#![forbid(unsafe_code)]
//! Mount-time configuration.
//!
//! Embedded deployments fix these knobs at build time; here they are a
//! validated value handed to `format`/`mount`.

use dfs_error::{DfsError, Result};

/// Where `buffered_write` stages the block image it is rebuilding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchMode {
    /// One erase-block RAM buffer owned by the mount.
    Ram,
    /// A reserved flash block (the device's last block). Never holds file
    /// data.
    ReservedBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfsConfig {
    page_size: u32,
    block_size: u32,
    min_file_size: u32,
    inodes_max: u32,
    scratch: ScratchMode,
}

impl DfsConfig {
    pub fn new(
        page_size: u32,
        block_size: u32,
        min_file_size: u32,
        inodes_max: u32,
        scratch: ScratchMode,
    ) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(DfsError::InvalidArgument("page size must be a power of two"));
        }
        if block_size == 0 || block_size % page_size != 0 {
            return Err(DfsError::InvalidArgument(
                "block size must be a multiple of page size",
            ));
        }
        if min_file_size == 0 {
            return Err(DfsError::InvalidArgument("file capacity must be nonzero"));
        }
        if inodes_max == 0 {
            return Err(DfsError::InvalidArgument("inode maximum must be nonzero"));
        }
        Ok(Self {
            page_size,
            block_size,
            min_file_size,
            inodes_max,
            scratch,
        })
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Per-file preallocated capacity (`max_len` in the superblock).
    #[must_use]
    pub fn min_file_size(&self) -> u32 {
        self.min_file_size
    }

    /// Number of user files; the dirent table holds one more slot for root.
    #[must_use]
    pub fn inodes_max(&self) -> u32 {
        self.inodes_max
    }

    #[must_use]
    pub fn scratch(&self) -> ScratchMode {
        self.scratch
    }
}

impl Default for DfsConfig {
    /// The reference geometry: 256-byte pages, 4 KiB erase blocks, 8 KiB
    /// file capacity, 16 files.
    fn default() -> Self {
        Self {
            page_size: 256,
            block_size: 4096,
            min_file_size: 8192,
            inodes_max: 16,
            scratch: ScratchMode::ReservedBlock,
        }
    }
}
