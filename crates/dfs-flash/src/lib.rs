#![forbid(unsafe_code)]
//! Flash device facade for DumbFS.
//!
//! Provides the [`FlashDevice`] trait the filesystem is written against,
//! plus two emulations: [`RamFlash`] for tests and [`FileFlash`] for
//! image-file tooling. Both model NAND behavior: an erase fills a block with
//! `0xFF`, and programming can only clear bits, so a write into un-erased
//! flash corrupts visibly instead of silently succeeding.

use dfs_error::{DfsError, Result};
use dfs_types::{BlockIndex, ByteOffset};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, trace};

/// One run of equally-sized erase blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    pub block_size: u32,
    pub blocks: u32,
}

/// Device geometry: an ordered list of `{block_size, blocks}` regions.
/// Total block count is the sum over regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashGeometry {
    regions: Vec<FlashRegion>,
}

impl FlashGeometry {
    pub fn new(regions: Vec<FlashRegion>) -> Result<Self> {
        if regions.is_empty() {
            return Err(DfsError::InvalidArgument("geometry has no regions"));
        }
        if regions.iter().any(|r| r.block_size == 0 || r.blocks == 0) {
            return Err(DfsError::InvalidArgument("geometry region is empty"));
        }
        Ok(Self { regions })
    }

    /// Single-region geometry, the common shape for small NAND parts.
    pub fn uniform(block_size: u32, blocks: u32) -> Result<Self> {
        Self::new(vec![FlashRegion { block_size, blocks }])
    }

    #[must_use]
    pub fn regions(&self) -> &[FlashRegion] {
        &self.regions
    }

    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.regions.iter().map(|r| r.blocks).sum()
    }

    /// The common erase-block size, if every region agrees on one.
    ///
    /// DumbFS requires a uniform block size; mixed-geometry parts are
    /// rejected at mount.
    #[must_use]
    pub fn uniform_block_size(&self) -> Option<u32> {
        let first = self.regions[0].block_size;
        self.regions
            .iter()
            .all(|r| r.block_size == first)
            .then_some(first)
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.regions
            .iter()
            .map(|r| u64::from(r.block_size) * u64::from(r.blocks))
            .sum()
    }
}

/// Raw NAND-style flash access.
///
/// `read_aligned`/`write_aligned` accept byte-granular offsets and lengths;
/// alignment to the device's page grid is the implementation's duty (real
/// drivers bounce through a page buffer, the emulations here are
/// byte-addressable to begin with). Writes program bits: the target range
/// must have been erased for the data to read back intact.
pub trait FlashDevice: Send + Sync {
    fn geometry(&self) -> &FlashGeometry;

    /// Smallest programmable unit, in bytes.
    fn page_size(&self) -> u32;

    /// Reset every byte of `block` to `0xFF`.
    fn erase(&self, block: BlockIndex) -> Result<()>;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_aligned(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Program `data` starting at `offset`.
    fn write_aligned(&self, offset: ByteOffset, data: &[u8]) -> Result<()>;

    /// Copy `len` bytes between device ranges through a page-sized bounce
    /// buffer. The destination range must be erased.
    fn copy_aligned(&self, dst: ByteOffset, src: ByteOffset, len: u64) -> Result<()> {
        let page = usize::try_from(self.page_size()).unwrap_or(usize::MAX);
        let mut bounce = vec![0_u8; page];
        let mut dst = dst;
        let mut src = src;
        let mut left = len;
        while left > 0 {
            let chunk = usize::try_from(left.min(page as u64)).unwrap_or(page);
            self.read_aligned(src, &mut bounce[..chunk])?;
            self.write_aligned(dst, &bounce[..chunk])?;
            dst = dst
                .checked_add(chunk as u64)
                .ok_or(DfsError::InvalidArgument("copy destination overflow"))?;
            src = src
                .checked_add(chunk as u64)
                .ok_or(DfsError::InvalidArgument("copy source overflow"))?;
            left -= chunk as u64;
        }
        Ok(())
    }

    /// Erase `dst`, then copy the full content of `src` onto it.
    fn copy_block(&self, dst: BlockIndex, src: BlockIndex) -> Result<()> {
        let block_size = self
            .geometry()
            .uniform_block_size()
            .ok_or(DfsError::InvalidArgument("mixed block sizes"))?;
        trace!(
            target: "dfs::flash",
            event = "copy_block",
            dst = dst.0,
            src = src.0
        );
        self.erase(dst)?;
        self.copy_aligned(
            dst.byte_start(block_size),
            src.byte_start(block_size),
            u64::from(block_size),
        )
    }
}

fn check_range(
    geometry: &FlashGeometry,
    op: &'static str,
    offset: ByteOffset,
    len: usize,
) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DfsError::InvalidArgument("range overflows u64"))?;
    if end.0 > geometry.len_bytes() {
        return Err(DfsError::Flash {
            op,
            offset: offset.0,
            detail: format!(
                "range of {len} bytes exceeds device length {}",
                geometry.len_bytes()
            ),
        });
    }
    Ok(())
}

fn check_block(geometry: &FlashGeometry, op: &'static str, block: BlockIndex) -> Result<()> {
    if block.0 >= geometry.total_blocks() {
        return Err(DfsError::Flash {
            op,
            offset: u64::from(block.0),
            detail: format!("block index past device end ({})", geometry.total_blocks()),
        });
    }
    Ok(())
}

fn validate_page_block(page_size: u32, block_size: u32) -> Result<()> {
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(DfsError::InvalidArgument("page size must be a power of two"));
    }
    if block_size == 0 || block_size % page_size != 0 {
        return Err(DfsError::InvalidArgument(
            "block size must be a multiple of page size",
        ));
    }
    Ok(())
}

/// In-memory NAND emulation.
#[derive(Debug)]
pub struct RamFlash {
    geometry: FlashGeometry,
    page_size: u32,
    bytes: Mutex<Vec<u8>>,
}

impl RamFlash {
    /// A fresh (fully erased) device.
    pub fn new(page_size: u32, block_size: u32, blocks: u32) -> Result<Self> {
        validate_page_block(page_size, block_size)?;
        let geometry = FlashGeometry::uniform(block_size, blocks)?;
        let len = usize::try_from(geometry.len_bytes())
            .map_err(|_| DfsError::InvalidArgument("device too large for memory emulation"))?;
        Ok(Self {
            geometry,
            page_size,
            bytes: Mutex::new(vec![0xFF_u8; len]),
        })
    }

    /// Raw copy of the device content, for test assertions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Replace the device content wholesale, e.g. to simulate remounting a
    /// previously used part.
    pub fn restore(&self, image: Vec<u8>) -> Result<()> {
        let mut bytes = self.bytes.lock();
        if image.len() != bytes.len() {
            return Err(DfsError::InvalidArgument("image length mismatch"));
        }
        *bytes = image;
        Ok(())
    }
}

impl FlashDevice for RamFlash {
    fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn erase(&self, block: BlockIndex) -> Result<()> {
        check_block(&self.geometry, "erase", block)?;
        let block_size = self.geometry.regions()[0].block_size as usize;
        let start = block.0 as usize * block_size;
        trace!(target: "dfs::flash", event = "erase", block = block.0);
        self.bytes.lock()[start..start + block_size].fill(0xFF);
        Ok(())
    }

    fn read_aligned(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(&self.geometry, "read", offset, buf.len())?;
        let start = offset.0 as usize;
        buf.copy_from_slice(&self.bytes.lock()[start..start + buf.len()]);
        Ok(())
    }

    fn write_aligned(&self, offset: ByteOffset, data: &[u8]) -> Result<()> {
        check_range(&self.geometry, "write", offset, data.len())?;
        let start = offset.0 as usize;
        trace!(
            target: "dfs::flash",
            event = "program",
            offset = offset.0,
            len = data.len()
        );
        let mut bytes = self.bytes.lock();
        for (cell, byte) in bytes[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        Ok(())
    }
}

/// Image-file-backed NAND emulation, used by the CLI and remount tests.
///
/// The image holds raw device content; geometry is supplied by the caller
/// (a real part would report it out-of-band too).
#[derive(Debug)]
pub struct FileFlash {
    geometry: FlashGeometry,
    page_size: u32,
    file: File,
}

impl FileFlash {
    /// Open an existing image. The file length must match the geometry.
    pub fn open(path: impl AsRef<Path>, page_size: u32, block_size: u32) -> Result<Self> {
        validate_page_block(page_size, block_size)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len == 0 || len % u64::from(block_size) != 0 {
            return Err(DfsError::InvalidArgument(
                "image length is not a multiple of the block size",
            ));
        }
        let blocks = u32::try_from(len / u64::from(block_size))
            .map_err(|_| DfsError::InvalidArgument("image too large"))?;
        let geometry = FlashGeometry::uniform(block_size, blocks)?;
        debug!(
            target: "dfs::flash",
            event = "open_image",
            blocks = blocks,
            block_size = block_size
        );
        Ok(Self {
            geometry,
            page_size,
            file,
        })
    }

    /// Create a fresh (fully erased) image file.
    pub fn create(
        path: impl AsRef<Path>,
        page_size: u32,
        block_size: u32,
        blocks: u32,
    ) -> Result<Self> {
        validate_page_block(page_size, block_size)?;
        let geometry = FlashGeometry::uniform(block_size, blocks)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let erased = vec![0xFF_u8; block_size as usize];
        for block in 0..blocks {
            file.write_all_at(&erased, u64::from(block) * u64::from(block_size))?;
        }
        debug!(
            target: "dfs::flash",
            event = "create_image",
            blocks = blocks,
            block_size = block_size
        );
        Ok(Self {
            geometry,
            page_size,
            file,
        })
    }
}

impl FlashDevice for FileFlash {
    fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn erase(&self, block: BlockIndex) -> Result<()> {
        check_block(&self.geometry, "erase", block)?;
        let block_size = self.geometry.regions()[0].block_size;
        trace!(target: "dfs::flash", event = "erase", block = block.0);
        let erased = vec![0xFF_u8; block_size as usize];
        self.file
            .write_all_at(&erased, u64::from(block.0) * u64::from(block_size))?;
        Ok(())
    }

    fn read_aligned(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(&self.geometry, "read", offset, buf.len())?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_aligned(&self, offset: ByteOffset, data: &[u8]) -> Result<()> {
        check_range(&self.geometry, "write", offset, data.len())?;
        let mut current = vec![0_u8; data.len()];
        self.file.read_exact_at(&mut current, offset.0)?;
        for (cell, byte) in current.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.file.write_all_at(&current, offset.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_reads_erased() {
        let dev = RamFlash::new(256, 4096, 4).unwrap();
        let mut buf = [0_u8; 16];
        dev.read_aligned(ByteOffset(4096 + 100), &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
    }

    #[test]
    fn programming_only_clears_bits() {
        let dev = RamFlash::new(256, 4096, 4).unwrap();
        dev.write_aligned(ByteOffset(10), &[0xA5]).unwrap();
        let mut b = [0_u8; 1];
        dev.read_aligned(ByteOffset(10), &mut b).unwrap();
        assert_eq!(b[0], 0xA5);

        // Overwriting without an erase ANDs, it does not replace.
        dev.write_aligned(ByteOffset(10), &[0x5A]).unwrap();
        dev.read_aligned(ByteOffset(10), &mut b).unwrap();
        assert_eq!(b[0], 0xA5 & 0x5A);

        dev.erase(BlockIndex(0)).unwrap();
        dev.read_aligned(ByteOffset(10), &mut b).unwrap();
        assert_eq!(b[0], 0xFF);
    }

    #[test]
    fn copy_block_replaces_destination() {
        let dev = RamFlash::new(256, 4096, 4).unwrap();
        dev.write_aligned(ByteOffset(4096), &[1, 2, 3, 4]).unwrap();
        // Dirty the destination first; copy_block must erase it.
        dev.write_aligned(ByteOffset(3 * 4096), &[0; 8]).unwrap();
        dev.copy_block(BlockIndex(3), BlockIndex(1)).unwrap();

        let mut buf = [0_u8; 8];
        dev.read_aligned(ByteOffset(3 * 4096), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let dev = RamFlash::new(256, 4096, 2).unwrap();
        let mut buf = [0_u8; 8];
        let err = dev
            .read_aligned(ByteOffset(2 * 4096 - 4), &mut buf)
            .expect_err("read past end");
        assert!(matches!(err, DfsError::Flash { op: "read", .. }));
        assert!(dev.erase(BlockIndex(2)).is_err());
    }

    #[test]
    fn geometry_uniformity() {
        let mixed = FlashGeometry::new(vec![
            FlashRegion {
                block_size: 4096,
                blocks: 8,
            },
            FlashRegion {
                block_size: 2048,
                blocks: 8,
            },
        ])
        .unwrap();
        assert_eq!(mixed.uniform_block_size(), None);
        assert_eq!(mixed.total_blocks(), 16);
        assert_eq!(mixed.len_bytes(), 8 * 4096 + 8 * 2048);
    }

    #[test]
    fn file_flash_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nand.img");
        {
            let dev = FileFlash::create(&path, 256, 4096, 4).unwrap();
            dev.write_aligned(ByteOffset(5000), b"persist").unwrap();
        }
        let dev = FileFlash::open(&path, 256, 4096).unwrap();
        assert_eq!(dev.geometry().total_blocks(), 4);
        let mut buf = [0_u8; 7];
        dev.read_aligned(ByteOffset(5000), &mut buf).unwrap();
        assert_eq!(&buf, b"persist");
    }
}
