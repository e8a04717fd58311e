#![forbid(unsafe_code)]
//! The buffered-rewrite engine.
//!
//! NAND flash only supports erase-before-write at erase-block granularity,
//! so an arbitrary in-place byte write must rebuild every touched block:
//! stage the block's surviving bytes plus the new payload somewhere safe,
//! erase the target, and copy the staged image back. [`buffered_write`] is
//! the only path by which persistent bytes change after format.
//!
//! The staging area is a [`Scratch`]: either a RAM buffer of one erase block
//! or a reserved flash block. The rewrite algorithm is identical for both;
//! only the four staging primitives differ.

use dfs_error::{DfsError, Result};
use dfs_flash::FlashDevice;
use dfs_types::{BlockIndex, ByteOffset};
use tracing::{debug, trace};

/// One erase block's worth of staging space.
///
/// `dst_off` arguments are offsets within the staged block image.
pub trait Scratch: Send + Sync {
    /// The flash block backing this scratch, if any. File extents must
    /// never cover it.
    fn reserved_block(&self) -> Option<BlockIndex> {
        None
    }

    /// Reset the staging area to erased state.
    fn scratch_erase(&mut self, dev: &dyn FlashDevice) -> Result<()>;

    /// Bring `len` bytes at `src` from the persistent region into the
    /// staged image at `dst_off`.
    fn stage_copy(
        &mut self,
        dev: &dyn FlashDevice,
        dst_off: u32,
        src: ByteOffset,
        len: u32,
    ) -> Result<()>;

    /// Place caller payload into the staged image at `dst_off`.
    fn stage_write(&mut self, dev: &dyn FlashDevice, dst_off: u32, bytes: &[u8]) -> Result<()>;

    /// Erase `target` and copy the staged image onto it.
    fn publish(&mut self, dev: &dyn FlashDevice, target: BlockIndex) -> Result<()>;
}

/// RAM-backed scratch: staging is plain memory copies, publish is one erase
/// plus one whole-block aligned write.
#[derive(Debug)]
pub struct RamScratch {
    buf: Vec<u8>,
}

impl RamScratch {
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        Self {
            buf: vec![0xFF_u8; block_size as usize],
        }
    }
}

impl Scratch for RamScratch {
    fn scratch_erase(&mut self, _dev: &dyn FlashDevice) -> Result<()> {
        self.buf.fill(0xFF);
        Ok(())
    }

    fn stage_copy(
        &mut self,
        dev: &dyn FlashDevice,
        dst_off: u32,
        src: ByteOffset,
        len: u32,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let dst = dst_off as usize;
        let end = dst
            .checked_add(len as usize)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DfsError::InvalidArgument("stage range past block end"))?;
        dev.read_aligned(src, &mut self.buf[dst..end])
    }

    fn stage_write(&mut self, _dev: &dyn FlashDevice, dst_off: u32, bytes: &[u8]) -> Result<()> {
        let dst = dst_off as usize;
        let end = dst
            .checked_add(bytes.len())
            .filter(|end| *end <= self.buf.len())
            .ok_or(DfsError::InvalidArgument("stage range past block end"))?;
        self.buf[dst..end].copy_from_slice(bytes);
        Ok(())
    }

    fn publish(&mut self, dev: &dyn FlashDevice, target: BlockIndex) -> Result<()> {
        trace!(target: "dfs::rewrite", event = "publish", mode = "ram", block = target.0);
        dev.erase(target)?;
        dev.write_aligned(target.byte_start(self.buf.len() as u32), &self.buf)
    }
}

/// Flash-backed scratch: staging reads and writes go to a reserved block on
/// the device itself, publish is a block-to-block copy.
#[derive(Debug)]
pub struct BlockScratch {
    block: BlockIndex,
    block_size: u32,
}

impl BlockScratch {
    #[must_use]
    pub fn new(block: BlockIndex, block_size: u32) -> Self {
        Self { block, block_size }
    }

    fn base(&self) -> ByteOffset {
        self.block.byte_start(self.block_size)
    }

    fn stage_offset(&self, dst_off: u32, len: usize) -> Result<ByteOffset> {
        let fits = (dst_off as usize)
            .checked_add(len)
            .is_some_and(|end| end <= self.block_size as usize);
        if !fits {
            return Err(DfsError::InvalidArgument("stage range past block end"));
        }
        self.base()
            .checked_add(u64::from(dst_off))
            .ok_or(DfsError::InvalidArgument("scratch offset overflow"))
    }
}

impl Scratch for BlockScratch {
    fn reserved_block(&self) -> Option<BlockIndex> {
        Some(self.block)
    }

    fn scratch_erase(&mut self, dev: &dyn FlashDevice) -> Result<()> {
        dev.erase(self.block)
    }

    fn stage_copy(
        &mut self,
        dev: &dyn FlashDevice,
        dst_off: u32,
        src: ByteOffset,
        len: u32,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let dst = self.stage_offset(dst_off, len as usize)?;
        dev.copy_aligned(dst, src, u64::from(len))
    }

    fn stage_write(&mut self, dev: &dyn FlashDevice, dst_off: u32, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let dst = self.stage_offset(dst_off, bytes.len())?;
        dev.write_aligned(dst, bytes)
    }

    fn publish(&mut self, dev: &dyn FlashDevice, target: BlockIndex) -> Result<()> {
        trace!(target: "dfs::rewrite", event = "publish", mode = "flash", block = target.0);
        dev.copy_block(target, self.block)
    }
}

/// Write `data` at absolute flash offset `pos`, preserving every byte of the
/// touched erase blocks outside `[pos, pos + data.len())`.
///
/// Flash effects are ordered: publish of the first block, direct rewrites of
/// fully-covered intermediate blocks, publish of the last block. A zero-length
/// write returns without touching flash. The caller is responsible for
/// clipping `pos + data.len()` to the valid range; `data` must not alias the
/// scratch block.
pub fn buffered_write(
    dev: &dyn FlashDevice,
    scratch: &mut dyn Scratch,
    block_size: u32,
    pos: ByteOffset,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    let end = pos
        .checked_add(data.len() as u64)
        .ok_or(DfsError::InvalidArgument("write range overflows u64"))?;
    let start_bk = pos.block(block_size);
    let last_bk = end.block(block_size);
    let off = pos.block_offset(block_size) as usize;

    if let Some(reserved) = scratch.reserved_block() {
        if start_bk <= reserved && reserved <= last_bk {
            return Err(DfsError::InvalidArgument("write range covers scratch block"));
        }
    }

    debug!(
        target: "dfs::rewrite",
        event = "buffered_write",
        pos = pos.0,
        len = data.len(),
        start_block = start_bk.0,
        last_block = last_bk.0
    );

    scratch.scratch_erase(dev)?;
    scratch.stage_copy(dev, 0, start_bk.byte_start(block_size), off as u32)?;

    let block = block_size as usize;
    let mut rest = data;
    let tail_end;

    if start_bk == last_bk {
        scratch.stage_write(dev, off as u32, rest)?;
        tail_end = off + rest.len();
    } else {
        let head = block - off;
        scratch.stage_write(dev, off as u32, &rest[..head])?;
        scratch.publish(dev, start_bk)?;
        rest = &rest[head..];

        for bk in start_bk.0 + 1..last_bk.0 {
            let target = BlockIndex(bk);
            trace!(target: "dfs::rewrite", event = "whole_block", block = bk);
            dev.erase(target)?;
            dev.write_aligned(target.byte_start(block_size), &rest[..block])?;
            rest = &rest[block..];
        }

        scratch.scratch_erase(dev)?;
        scratch.stage_write(dev, 0, rest)?;
        tail_end = rest.len();
    }

    let suffix = block - tail_end;
    scratch.stage_copy(
        dev,
        tail_end as u32,
        last_bk
            .byte_start(block_size)
            .checked_add(tail_end as u64)
            .ok_or(DfsError::InvalidArgument("write range overflows u64"))?,
        suffix as u32,
    )?;
    scratch.publish(dev, last_bk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_flash::RamFlash;

    const BLOCK: u32 = 4096;

    fn scratches() -> Vec<Box<dyn Scratch>> {
        vec![
            Box::new(RamScratch::new(BLOCK)),
            Box::new(BlockScratch::new(BlockIndex(7), BLOCK)),
        ]
    }

    fn prefilled_device() -> RamFlash {
        let dev = RamFlash::new(256, BLOCK, 8).unwrap();
        // Give the data region recognizable content so preservation is
        // checkable.
        for block in 0..7_u32 {
            let pattern: Vec<u8> = (0..BLOCK).map(|i| (i % 251) as u8 | 0x80).collect();
            // Programming ANDs bits, so only set bits survive; write the
            // pattern onto erased flash.
            dev.write_aligned(BlockIndex(block).byte_start(BLOCK), &pattern)
                .unwrap();
        }
        dev
    }

    fn read_all(dev: &RamFlash) -> Vec<u8> {
        dev.snapshot()
    }

    #[test]
    fn zero_length_write_touches_nothing() {
        for mut scratch in scratches() {
            let dev = prefilled_device();
            let before = read_all(&dev);
            buffered_write(&dev, scratch.as_mut(), BLOCK, ByteOffset(100), &[]).unwrap();
            assert_eq!(before, read_all(&dev));
        }
    }

    #[test]
    fn single_block_write_preserves_neighbors() {
        for mut scratch in scratches() {
            let dev = prefilled_device();
            let before = read_all(&dev);
            let payload = [0x11_u8, 0x22, 0x33, 0x44, 0x55];
            let pos = 2 * BLOCK as u64 + 1000;

            buffered_write(&dev, scratch.as_mut(), BLOCK, ByteOffset(pos), &payload).unwrap();

            let after = read_all(&dev);
            let (p, pe) = (pos as usize, pos as usize + payload.len());
            assert_eq!(&after[p..pe], &payload);
            assert_eq!(&after[..p], &before[..p]);
            assert_eq!(&after[pe..7 * BLOCK as usize], &before[pe..7 * BLOCK as usize]);
        }
    }

    #[test]
    fn three_block_span_preserves_partial_ends() {
        for mut scratch in scratches() {
            let dev = prefilled_device();
            let before = read_all(&dev);
            let payload: Vec<u8> = (0..(2 * BLOCK as usize + 100)).map(|i| (i % 256) as u8).collect();
            let pos = BLOCK as u64 + 300;

            buffered_write(&dev, scratch.as_mut(), BLOCK, ByteOffset(pos), &payload).unwrap();

            let after = read_all(&dev);
            let (p, pe) = (pos as usize, pos as usize + payload.len());
            assert_eq!(&after[p..pe], &payload[..]);
            assert_eq!(&after[..p], &before[..p]);
            assert_eq!(&after[pe..7 * BLOCK as usize], &before[pe..7 * BLOCK as usize]);
        }
    }

    #[test]
    fn write_ending_on_block_boundary() {
        for mut scratch in scratches() {
            let dev = prefilled_device();
            let before = read_all(&dev);
            let payload = vec![0x0F_u8; BLOCK as usize];

            // Covers exactly block 1; the republish of the following block
            // must leave its content intact.
            buffered_write(
                &dev,
                scratch.as_mut(),
                BLOCK,
                ByteOffset(u64::from(BLOCK)),
                &payload,
            )
            .unwrap();

            let after = read_all(&dev);
            let b = BLOCK as usize;
            assert_eq!(&after[b..2 * b], &payload[..]);
            assert_eq!(&after[..b], &before[..b]);
            assert_eq!(&after[2 * b..7 * b], &before[2 * b..7 * b]);
        }
    }

    #[test]
    fn rejects_write_over_reserved_scratch_block() {
        let dev = prefilled_device();
        let mut scratch = BlockScratch::new(BlockIndex(7), BLOCK);
        let err = buffered_write(
            &dev,
            &mut scratch,
            BLOCK,
            ByteOffset(6 * u64::from(BLOCK) + 4000),
            &[0_u8; 200],
        )
        .expect_err("write into scratch block");
        assert!(matches!(err, DfsError::InvalidArgument(_)));
    }
}
