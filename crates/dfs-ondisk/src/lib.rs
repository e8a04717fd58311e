#![forbid(unsafe_code)]
//! On-flash layout of DumbFS.
//!
//! The format is little-endian with fixed offsets:
//!
//! ```text
//! offset 0:        SbInfo          (SB_SIZE bytes)
//! offset SB_SIZE:  DirEntry table  (max_inode_count slots of DIRENT_SIZE)
//! offset free_space_initial: file extents, max_len bytes each
//! last block:      scratch         (flash-scratch mode only, never file data)
//! ```
//!
//! Slot emptiness has two faces, both honored: a slot whose first four bytes
//! read back `0xFFFFFFFF` has never been written since format, and a slot
//! whose name starts with NUL holds no file either.

use dfs_types::{
    ByteOffset, DFS_MAGIC, ERASED_WORD, ParseError, name_from_padded, read_fixed, read_le_u16,
    read_le_u32,
};

/// Encoded size of [`SbInfo`].
pub const SB_SIZE: usize = 24;

/// Encoded size of one [`DirEntry`] slot.
pub const DIRENT_SIZE: usize = 40;

/// Size of the NUL-padded name field; names carry at most `NAME_LEN - 1`
/// bytes.
pub const NAME_LEN: usize = 28;

/// Byte offset of dirent slot `n` on flash.
#[must_use]
pub fn dirent_offset(slot: u32) -> ByteOffset {
    ByteOffset(SB_SIZE as u64 + u64::from(slot) * DIRENT_SIZE as u64)
}

/// Superblock, stored at flash offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbInfo {
    /// Next free inode index; the root occupies 0, so this is always >= 1.
    pub inode_count: u32,
    /// Hard cap: configured inode maximum plus the root slot.
    pub max_inode_count: u32,
    /// Per-file preallocated capacity in bytes.
    pub max_len: u32,
    /// Reserved scratch-block index, or [`dfs_types::SCRATCH_NONE`] when the
    /// mount stages through RAM.
    pub scratch_block: u32,
    /// Byte offset of the next unused data extent.
    pub free_space: u32,
}

impl SbInfo {
    /// Parse a superblock image, validating the format signature.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let magic = read_fixed::<2>(raw, 0)?;
        if magic != DFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u16::from_le_bytes(DFS_MAGIC),
                actual: u16::from_le_bytes(magic),
            });
        }
        // Offset 2 is reserved padding; tolerated on read.
        let _ = read_le_u16(raw, 2)?;

        let sb = Self {
            inode_count: read_le_u32(raw, 4)?,
            max_inode_count: read_le_u32(raw, 8)?,
            max_len: read_le_u32(raw, 12)?,
            scratch_block: read_le_u32(raw, 16)?,
            free_space: read_le_u32(raw, 20)?,
        };

        if sb.inode_count == 0 {
            return Err(ParseError::InvalidField {
                field: "inode_count",
                reason: "root slot missing",
            });
        }
        if sb.max_inode_count == 0 {
            return Err(ParseError::InvalidField {
                field: "max_inode_count",
                reason: "zero capacity",
            });
        }
        Ok(sb)
    }

    /// Quick signature probe, used by mount to decide whether to format.
    #[must_use]
    pub fn magic_present(raw: &[u8]) -> bool {
        raw.len() >= 2 && raw[0] == DFS_MAGIC[0] && raw[1] == DFS_MAGIC[1]
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SB_SIZE] {
        let mut out = [0_u8; SB_SIZE];
        out[0..2].copy_from_slice(&DFS_MAGIC);
        out[4..8].copy_from_slice(&self.inode_count.to_le_bytes());
        out[8..12].copy_from_slice(&self.max_inode_count.to_le_bytes());
        out[12..16].copy_from_slice(&self.max_len.to_le_bytes());
        out[16..20].copy_from_slice(&self.scratch_block.to_le_bytes());
        out[20..24].copy_from_slice(&self.free_space.to_le_bytes());
        out
    }
}

/// File type bits stored in the dirent `flags` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

impl FileKind {
    const REGULAR: u32 = 1;
    const DIRECTORY: u32 = 2;

    #[must_use]
    pub fn to_flags(self) -> u32 {
        match self {
            Self::Regular => Self::REGULAR,
            Self::Directory => Self::DIRECTORY,
        }
    }

    pub fn from_flags(flags: u32) -> Result<Self, ParseError> {
        match flags {
            Self::REGULAR => Ok(Self::Regular),
            Self::DIRECTORY => Ok(Self::Directory),
            _ => Err(ParseError::InvalidField {
                field: "flags",
                reason: "unknown file type",
            }),
        }
    }
}

/// One fixed-stride directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Absolute byte offset of the file's extent.
    pub pos_start: u32,
    /// Current file length; never exceeds the superblock `max_len`.
    pub len: u32,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let name_field = read_fixed::<NAME_LEN>(raw, 0)?;
        Ok(Self {
            name: name_from_padded(&name_field),
            pos_start: read_le_u32(raw, NAME_LEN)?,
            len: read_le_u32(raw, NAME_LEN + 4)?,
            kind: FileKind::from_flags(read_le_u32(raw, NAME_LEN + 8)?)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let name = self.name.as_bytes();
        debug_assert!(name.len() < NAME_LEN);
        let take = name.len().min(NAME_LEN - 1);

        let mut out = [0_u8; DIRENT_SIZE];
        out[..take].copy_from_slice(&name[..take]);
        out[NAME_LEN..NAME_LEN + 4].copy_from_slice(&self.pos_start.to_le_bytes());
        out[NAME_LEN + 4..NAME_LEN + 8].copy_from_slice(&self.len.to_le_bytes());
        out[NAME_LEN + 8..NAME_LEN + 12].copy_from_slice(&self.kind.to_flags().to_le_bytes());
        out
    }
}

/// True when the slot has never been written since the last format: its
/// leading word still reads back as erased flash.
#[must_use]
pub fn slot_is_erased(raw: &[u8]) -> bool {
    read_le_u32(raw, 0).is_ok_and(|word| word == ERASED_WORD)
}

/// True when the slot's name begins with NUL, the "no file here" signal
/// `read_dirent` reports as not-found.
#[must_use]
pub fn slot_is_unnamed(raw: &[u8]) -> bool {
    raw.first().is_some_and(|b| *b == 0)
}
