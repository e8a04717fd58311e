#![forbid(unsafe_code)]
//! Mount/format, metadata operations, and file operations.
//!
//! `DumbFs` owns the device, the single superblock cache, and the single
//! scratch resource of a mount. Mutating operations take `&mut self`, so
//! callers are serialized at compile time.

use crate::config::{DfsConfig, ScratchMode};
use crate::rewrite::{BlockScratch, RamScratch, Scratch, buffered_write};
use dfs_error::{DfsError, Result};
use dfs_flash::FlashDevice;
use dfs_ondisk::{
    DIRENT_SIZE, DirEntry, FileKind, NAME_LEN, SB_SIZE, SbInfo, dirent_offset, slot_is_erased,
    slot_is_unnamed,
};
use dfs_types::{BlockIndex, ByteOffset, InodeNo, ParseError, SCRATCH_NONE};
use tracing::{debug, info};

/// Driver name reported to host adapters.
pub const FS_NAME: &str = "DumbFS";

/// In-memory inode: everything a file operation needs to address its extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub ino: InodeNo,
    /// Absolute flash offset of the file's preallocated extent.
    pub pos_start: ByteOffset,
    /// Current length. Writes do not advance this; truncate does.
    pub len: u32,
    pub kind: FileKind,
}

/// Opaque enumeration cursor for the root directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirCursor(u32);

/// Rendering mode for [`DumbFs::pathname`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    /// Bare dirent name.
    NameOnly,
    /// `/` followed by the dirent name. DFS is flat, so no separator logic
    /// exists; the root dirent (named `/`) renders as `//`, as it always
    /// has.
    Full,
}

/// The narrow surface a host VFS adapter needs.
pub trait FsOps {
    fn create(&mut self, name: &str, kind: FileKind) -> Result<Inode>;
    fn lookup(&self, name: &str) -> Result<Inode>;
    fn truncate(&mut self, inode: &mut Inode, new_len: u32) -> Result<()>;
    fn read(&self, inode: &Inode, pos: u32, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, inode: &Inode, pos: u32, data: &[u8]) -> Result<usize>;
    fn next_entry(&self, cursor: &mut DirCursor) -> Result<Option<(String, Inode)>>;
    fn pathname(&self, inode: &Inode, style: PathStyle) -> Result<String>;
}

/// A mounted DumbFS.
pub struct DumbFs<D: FlashDevice> {
    dev: D,
    sbi: SbInfo,
    scratch: Box<dyn Scratch>,
    block_size: u32,
    root: Inode,
}

impl<D: FlashDevice> std::fmt::Debug for DumbFs<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumbFs")
            .field("block_size", &self.block_size)
            .field("root", &self.root)
            .finish()
    }
}

fn device_block_size(dev: &dyn FlashDevice, config: &DfsConfig) -> Result<u32> {
    let block_size = dev
        .geometry()
        .uniform_block_size()
        .ok_or(DfsError::InvalidArgument("device has mixed erase-block sizes"))?;
    if block_size != config.block_size() {
        return Err(DfsError::InvalidArgument(
            "configured block size disagrees with device geometry",
        ));
    }
    if dev.page_size() != config.page_size() {
        return Err(DfsError::InvalidArgument(
            "configured page size disagrees with device geometry",
        ));
    }
    Ok(block_size)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DfsError::InvalidArgument("empty file name"));
    }
    if name.len() >= NAME_LEN {
        return Err(DfsError::NameTooLong {
            len: name.len(),
            max: NAME_LEN - 1,
        });
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(DfsError::InvalidArgument("name contains '/' or NUL"));
    }
    Ok(())
}

impl<D: FlashDevice> DumbFs<D> {
    /// Erase the whole device and lay down a fresh filesystem: superblock
    /// plus root dirent, written as one image at offset 0.
    pub fn format(dev: D, config: &DfsConfig) -> Result<Self> {
        let block_size = device_block_size(&dev, config)?;
        let geometry = dev.geometry();
        let total_blocks = geometry.total_blocks();

        let table_slots = config.inodes_max() + 1;
        let table_end = SB_SIZE as u64 + u64::from(table_slots) * DIRENT_SIZE as u64;
        let data_end =
            table_end + u64::from(config.inodes_max()) * u64::from(config.min_file_size());
        let reserved = match config.scratch() {
            ScratchMode::Ram => 0,
            ScratchMode::ReservedBlock => u64::from(block_size),
        };
        let available = geometry.len_bytes() - reserved;
        if data_end > available {
            return Err(DfsError::NoSpace {
                needed: data_end,
                available,
            });
        }
        if u32::try_from(data_end).is_err() {
            return Err(DfsError::InvalidArgument(
                "file extents exceed the 4 GiB addressing limit",
            ));
        }

        info!(
            target: "dfs::fs",
            event = "format",
            blocks = total_blocks,
            block_size = block_size,
            inodes_max = config.inodes_max(),
            max_len = config.min_file_size()
        );

        for block in 0..total_blocks {
            dev.erase(BlockIndex(block))?;
        }

        let sbi = SbInfo {
            inode_count: 1,
            max_inode_count: table_slots,
            max_len: config.min_file_size(),
            scratch_block: match config.scratch() {
                ScratchMode::Ram => SCRATCH_NONE,
                ScratchMode::ReservedBlock => total_blocks - 1,
            },
            free_space: u32::try_from(table_end)
                .map_err(|_| DfsError::InvalidArgument("dirent table exceeds 4 GiB"))?,
        };
        let root = DirEntry {
            name: "/".to_owned(),
            pos_start: sbi.free_space,
            // Enumeration bound: one slot per inode, root included.
            len: table_slots,
            kind: FileKind::Directory,
        };

        let mut image = [0_u8; SB_SIZE + DIRENT_SIZE];
        image[..SB_SIZE].copy_from_slice(&sbi.encode());
        image[SB_SIZE..].copy_from_slice(&root.encode());
        dev.write_aligned(ByteOffset::ZERO, &image)?;

        Self::attach(dev, config, block_size, sbi)
    }

    /// Attach to a device: read the superblock, format first if the magic is
    /// absent, and populate the in-memory root inode.
    pub fn mount(dev: D, config: &DfsConfig) -> Result<Self> {
        let block_size = device_block_size(&dev, config)?;

        let mut raw = [0_u8; SB_SIZE];
        dev.read_aligned(ByteOffset::ZERO, &mut raw)?;
        if !SbInfo::magic_present(&raw) {
            info!(target: "dfs::fs", event = "mount_unformatted");
            return Self::format(dev, config);
        }

        let sbi = SbInfo::parse(&raw)?;
        debug!(
            target: "dfs::fs",
            event = "mount",
            inode_count = sbi.inode_count,
            free_space = sbi.free_space
        );
        Self::attach(dev, config, block_size, sbi)
    }

    fn attach(dev: D, config: &DfsConfig, block_size: u32, sbi: SbInfo) -> Result<Self> {
        let total_blocks = dev.geometry().total_blocks();
        let scratch: Box<dyn Scratch> = match config.scratch() {
            ScratchMode::Ram => {
                if sbi.scratch_block != SCRATCH_NONE {
                    return Err(DfsError::InvalidArgument(
                        "superblock reserves a scratch block but RAM mode was requested",
                    ));
                }
                Box::new(RamScratch::new(block_size))
            }
            ScratchMode::ReservedBlock => {
                if sbi.scratch_block >= total_blocks {
                    return Err(DfsError::InvalidArgument(
                        "superblock scratch block lies past the device end",
                    ));
                }
                Box::new(BlockScratch::new(BlockIndex(sbi.scratch_block), block_size))
            }
        };

        let mut fs = Self {
            dev,
            sbi,
            scratch,
            block_size,
            root: Inode {
                ino: InodeNo::ROOT,
                pos_start: ByteOffset::ZERO,
                len: 0,
                kind: FileKind::Directory,
            },
        };

        let root_entry = fs.read_dirent(InodeNo::ROOT).map_err(|err| match err {
            DfsError::NotFound(_) => DfsError::Layout(ParseError::InvalidField {
                field: "root dirent",
                reason: "missing after format",
            }),
            other => other,
        })?;
        fs.root = Inode {
            ino: InodeNo::ROOT,
            pos_start: ByteOffset(u64::from(root_entry.pos_start)),
            len: root_entry.len,
            kind: root_entry.kind,
        };
        Ok(fs)
    }

    #[must_use]
    pub fn superblock(&self) -> &SbInfo {
        &self.sbi
    }

    #[must_use]
    pub fn root(&self) -> &Inode {
        &self.root
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Tear down the mount and hand the device back, e.g. for a remount.
    #[must_use]
    pub fn into_device(self) -> D {
        self.dev
    }

    // ── Metadata operations ─────────────────────────────────────────────

    fn read_sb_info(&self) -> Result<SbInfo> {
        let mut raw = [0_u8; SB_SIZE];
        self.dev.read_aligned(ByteOffset::ZERO, &mut raw)?;
        Ok(SbInfo::parse(&raw)?)
    }

    fn write_sb_info(&mut self) -> Result<()> {
        let image = self.sbi.encode();
        buffered_write(
            &self.dev,
            &mut *self.scratch,
            self.block_size,
            ByteOffset::ZERO,
            &image,
        )
    }

    fn read_dirent_raw(&self, slot: u32) -> Result<[u8; DIRENT_SIZE]> {
        if slot >= self.sbi.max_inode_count {
            return Err(DfsError::InvalidArgument("inode index past table end"));
        }
        let mut raw = [0_u8; DIRENT_SIZE];
        self.dev.read_aligned(dirent_offset(slot), &mut raw)?;
        Ok(raw)
    }

    /// Read dirent `ino`, reporting not-found for both empty-slot encodings
    /// (never-written erased flash, and a name starting with NUL).
    pub fn read_dirent(&self, ino: InodeNo) -> Result<DirEntry> {
        let raw = self.read_dirent_raw(ino.0)?;
        if slot_is_erased(&raw) || slot_is_unnamed(&raw) {
            return Err(DfsError::NotFound(format!("inode {ino}")));
        }
        Ok(DirEntry::parse(&raw)?)
    }

    fn write_dirent(&mut self, slot: u32, entry: &DirEntry) -> Result<()> {
        let image = entry.encode();
        buffered_write(
            &self.dev,
            &mut *self.scratch,
            self.block_size,
            dirent_offset(slot),
            &image,
        )
    }

    /// Linear scan of the dirent table for `name`. O(table size), accepted
    /// because the table is small.
    fn ino_from_path(&self, name: &str) -> Result<InodeNo> {
        for slot in 0..self.sbi.max_inode_count {
            let raw = self.read_dirent_raw(slot)?;
            if slot_is_erased(&raw) || slot_is_unnamed(&raw) {
                continue;
            }
            let entry = DirEntry::parse(&raw)?;
            if entry.name == name {
                return Ok(InodeNo(slot));
            }
        }
        Err(DfsError::NotFound(name.to_owned()))
    }

    fn inode_from_entry(slot: u32, entry: &DirEntry) -> Inode {
        Inode {
            ino: InodeNo(slot),
            pos_start: ByteOffset(u64::from(entry.pos_start)),
            len: entry.len,
            kind: entry.kind,
        }
    }

    // ── File operations ─────────────────────────────────────────────────

    /// Allocate the next inode slot and a fresh `max_len`-byte extent.
    ///
    /// The new file has length 0; `write` does not grow it, a follow-up
    /// [`DumbFs::truncate`] does.
    pub fn create(&mut self, name: &str, kind: FileKind) -> Result<Inode> {
        validate_name(name)?;

        // Refresh the cached superblock before deciding.
        self.sbi = self.read_sb_info()?;
        if self.sbi.inode_count >= self.sbi.max_inode_count {
            return Err(DfsError::NoInodes {
                max: self.sbi.max_inode_count - 1,
            });
        }
        match self.ino_from_path(name) {
            Ok(_) => return Err(DfsError::Exists(name.to_owned())),
            Err(DfsError::NotFound(_)) => {}
            Err(other) => return Err(other),
        }

        let slot = self.sbi.inode_count;
        let entry = DirEntry {
            name: name.to_owned(),
            pos_start: self.sbi.free_space,
            len: 0,
            kind,
        };
        self.write_dirent(slot, &entry)?;

        self.sbi.inode_count += 1;
        self.sbi.free_space += self.sbi.max_len;
        self.write_sb_info()?;

        debug!(
            target: "dfs::fs",
            event = "create",
            name = name,
            ino = slot,
            pos_start = entry.pos_start
        );
        Ok(Self::inode_from_entry(slot, &entry))
    }

    /// Resolve `name` to an inode. Root is addressable as `/`.
    pub fn lookup(&self, name: &str) -> Result<Inode> {
        let ino = self.ino_from_path(name)?;
        let entry = self.read_dirent(ino)?;
        Ok(Self::inode_from_entry(ino.0, &entry))
    }

    /// Grow `inode` to `new_len` bytes. Shrinking is unsupported; repeating
    /// the same length is a no-op that never touches flash.
    pub fn truncate(&mut self, inode: &mut Inode, new_len: u32) -> Result<()> {
        if new_len > self.sbi.max_len {
            return Err(DfsError::InvalidArgument("length exceeds file capacity"));
        }
        if new_len == inode.len {
            return Ok(());
        }
        if new_len < inode.len {
            return Err(DfsError::InvalidArgument("truncate is grow-only"));
        }

        let mut entry = self.read_dirent(inode.ino)?;
        entry.len = new_len;
        self.write_dirent(inode.ino.0, &entry)?;
        inode.len = new_len;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `pos`, clipped to the file length.
    /// `pos` past the end is an error; `pos` at the end reads zero bytes.
    pub fn read(&self, inode: &Inode, pos: u32, buf: &mut [u8]) -> Result<usize> {
        if pos > inode.len {
            return Err(DfsError::InvalidArgument("read position past end of file"));
        }
        let n = buf.len().min((inode.len - pos) as usize);
        if n > 0 {
            let at = inode
                .pos_start
                .checked_add(u64::from(pos))
                .ok_or(DfsError::InvalidArgument("read range overflows u64"))?;
            self.dev.read_aligned(at, &mut buf[..n])?;
        }
        Ok(n)
    }

    /// Write into the extent at `pos`, clipped to the file capacity. Returns
    /// the clipped count. The file length is untouched; callers that track
    /// length must truncate afterwards.
    pub fn write(&mut self, inode: &Inode, pos: u32, data: &[u8]) -> Result<usize> {
        let capacity = self.sbi.max_len;
        if pos >= capacity {
            return Err(DfsError::InvalidArgument("write position past file capacity"));
        }
        let n = data.len().min((capacity - pos) as usize);
        if n == 0 {
            return Err(DfsError::InvalidArgument("nothing to write"));
        }

        let at = inode
            .pos_start
            .checked_add(u64::from(pos))
            .ok_or(DfsError::InvalidArgument("write range overflows u64"))?;
        buffered_write(
            &self.dev,
            &mut *self.scratch,
            self.block_size,
            at,
            &data[..n],
        )?;
        Ok(n)
    }

    /// Yield the next present root entry at or after the cursor, skipping
    /// the root slot itself. A slot is present iff its first four bytes are
    /// not erased flash.
    pub fn next_entry(&self, cursor: &mut DirCursor) -> Result<Option<(String, Inode)>> {
        if cursor.0 == 0 {
            cursor.0 = 1;
        }
        let mut slot = cursor.0;
        while slot < self.root.len {
            let raw = self.read_dirent_raw(slot)?;
            if !slot_is_erased(&raw) {
                let entry = DirEntry::parse(&raw)?;
                cursor.0 = slot + 1;
                let inode = Self::inode_from_entry(slot, &entry);
                return Ok(Some((entry.name, inode)));
            }
            slot += 1;
        }
        cursor.0 = slot;
        Ok(None)
    }

    /// Iterator over the root directory.
    pub fn read_dir(&self) -> ReadDir<'_, D> {
        ReadDir {
            fs: self,
            cursor: DirCursor::default(),
        }
    }

    /// Render the name or absolute path of `inode`.
    pub fn pathname(&self, inode: &Inode, style: PathStyle) -> Result<String> {
        let entry = self.read_dirent(inode.ino)?;
        Ok(match style {
            PathStyle::NameOnly => entry.name,
            PathStyle::Full => format!("/{}", entry.name),
        })
    }

    /// Open `name` for sequential access.
    pub fn open(&self, name: &str) -> Result<OpenFile> {
        Ok(OpenFile {
            inode: self.lookup(name)?,
            pos: 0,
        })
    }
}

impl<D: FlashDevice> FsOps for DumbFs<D> {
    fn create(&mut self, name: &str, kind: FileKind) -> Result<Inode> {
        Self::create(self, name, kind)
    }

    fn lookup(&self, name: &str) -> Result<Inode> {
        Self::lookup(self, name)
    }

    fn truncate(&mut self, inode: &mut Inode, new_len: u32) -> Result<()> {
        Self::truncate(self, inode, new_len)
    }

    fn read(&self, inode: &Inode, pos: u32, buf: &mut [u8]) -> Result<usize> {
        Self::read(self, inode, pos, buf)
    }

    fn write(&mut self, inode: &Inode, pos: u32, data: &[u8]) -> Result<usize> {
        Self::write(self, inode, pos, data)
    }

    fn next_entry(&self, cursor: &mut DirCursor) -> Result<Option<(String, Inode)>> {
        Self::next_entry(self, cursor)
    }

    fn pathname(&self, inode: &Inode, style: PathStyle) -> Result<String> {
        Self::pathname(self, inode, style)
    }
}

/// Iterator adapter over [`DumbFs::next_entry`].
pub struct ReadDir<'a, D: FlashDevice> {
    fs: &'a DumbFs<D>,
    cursor: DirCursor,
}

impl<D: FlashDevice> Iterator for ReadDir<'_, D> {
    type Item = Result<(String, Inode)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fs.next_entry(&mut self.cursor).transpose()
    }
}

/// Sequential cursor over one file, for host file-descriptor plumbing.
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    inode: Inode,
    pos: u32,
}

impl OpenFile {
    #[must_use]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    #[must_use]
    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn read<D: FlashDevice>(&mut self, fs: &DumbFs<D>, buf: &mut [u8]) -> Result<usize> {
        let n = fs.read(&self.inode, self.pos, buf)?;
        self.pos += u32::try_from(n).unwrap_or(u32::MAX);
        Ok(n)
    }

    pub fn write<D: FlashDevice>(&mut self, fs: &mut DumbFs<D>, data: &[u8]) -> Result<usize> {
        let n = fs.write(&self.inode, self.pos, data)?;
        self.pos += u32::try_from(n).unwrap_or(u32::MAX);
        Ok(n)
    }

    /// Grow the file to cover everything written so far.
    pub fn extend_to_pos<D: FlashDevice>(&mut self, fs: &mut DumbFs<D>) -> Result<()> {
        if self.pos > self.inode.len {
            let target = self.pos;
            fs.truncate(&mut self.inode, target)?;
        }
        Ok(())
    }
}
