#![forbid(unsafe_code)]
//! Erase-budget and preservation properties of the buffered-rewrite engine,
//! observed through a counting device wrapper.

use dfs_core::{BlockIndex, BlockScratch, ByteOffset, RamScratch, Scratch, buffered_write};
use dfs_flash::{FlashDevice, FlashGeometry, RamFlash};
use parking_lot::Mutex;

const PAGE: u32 = 256;
const BLOCK: u32 = 4096;
const BLOCKS: u32 = 16;

/// Delegating wrapper that records every erase and program call.
struct CountingFlash {
    inner: RamFlash,
    erases: Mutex<Vec<u32>>,
    programs: Mutex<Vec<(u64, usize)>>,
}

impl CountingFlash {
    fn new(inner: RamFlash) -> Self {
        Self {
            inner,
            erases: Mutex::new(Vec::new()),
            programs: Mutex::new(Vec::new()),
        }
    }

    fn erased_blocks(&self) -> Vec<u32> {
        self.erases.lock().clone()
    }

    fn reset_counts(&self) {
        self.erases.lock().clear();
        self.programs.lock().clear();
    }

    /// Number of program calls that touch the given block.
    fn programs_into_block(&self, block: u32) -> usize {
        let start = u64::from(block) * u64::from(BLOCK);
        let end = start + u64::from(BLOCK);
        self.programs
            .lock()
            .iter()
            .filter(|(off, len)| *off < end && off + *len as u64 > start)
            .count()
    }
}

impl FlashDevice for CountingFlash {
    fn geometry(&self) -> &FlashGeometry {
        self.inner.geometry()
    }

    fn page_size(&self) -> u32 {
        self.inner.page_size()
    }

    fn erase(&self, block: BlockIndex) -> dfs_core::Result<()> {
        self.erases.lock().push(block.0);
        self.inner.erase(block)
    }

    fn read_aligned(&self, offset: ByteOffset, buf: &mut [u8]) -> dfs_core::Result<()> {
        self.inner.read_aligned(offset, buf)
    }

    fn write_aligned(&self, offset: ByteOffset, data: &[u8]) -> dfs_core::Result<()> {
        self.programs.lock().push((offset.0, data.len()));
        self.inner.write_aligned(offset, data)
    }
}

fn patterned_device() -> CountingFlash {
    let inner = RamFlash::new(PAGE, BLOCK, BLOCKS).unwrap();
    for block in 0..BLOCKS - 1 {
        let pattern: Vec<u8> = (0..BLOCK).map(|i| (i % 249) as u8 | 0xC0).collect();
        inner
            .write_aligned(BlockIndex(block).byte_start(BLOCK), &pattern)
            .unwrap();
    }
    CountingFlash::new(inner)
}

const SCRATCH_BLOCK: u32 = BLOCKS - 1;

fn run_both_modes(test: impl Fn(&CountingFlash, &mut dyn Scratch)) {
    let dev = patterned_device();
    let mut ram = RamScratch::new(BLOCK);
    test(&dev, &mut ram);

    let dev = patterned_device();
    let mut reserved = BlockScratch::new(BlockIndex(SCRATCH_BLOCK), BLOCK);
    test(&dev, &mut reserved);
}

/// Erases of data blocks, with the scratch block's own erases filtered out.
fn target_erases(dev: &CountingFlash) -> Vec<u32> {
    dev.erased_blocks()
        .into_iter()
        .filter(|b| *b != SCRATCH_BLOCK)
        .collect()
}

#[test]
fn content_lands_and_neighbors_survive() {
    run_both_modes(|dev, scratch| {
        let before = dev.inner.snapshot();
        let payload: Vec<u8> = (0..5000_u32).map(|i| (i % 256) as u8).collect();
        let pos = 2 * u64::from(BLOCK) + 1234;

        buffered_write(dev, scratch, BLOCK, ByteOffset(pos), &payload).unwrap();

        let after = dev.inner.snapshot();
        let (p, pe) = (pos as usize, pos as usize + payload.len());
        assert_eq!(&after[p..pe], &payload[..]);
        assert_eq!(&after[..p], &before[..p]);
        let data_end = (SCRATCH_BLOCK * BLOCK) as usize;
        assert_eq!(&after[pe..data_end], &before[pe..data_end]);
    });
}

#[test]
fn erase_budget_is_one_per_touched_block() {
    // Single block touched: exactly one target erase.
    run_both_modes(|dev, scratch| {
        dev.reset_counts();
        buffered_write(dev, scratch, BLOCK, ByteOffset(5 * u64::from(BLOCK) + 7), &[1, 2, 3])
            .unwrap();
        assert_eq!(target_erases(dev), vec![5]);
    });

    // Three blocks touched: three target erases, ordered first, middle,
    // last, independent of payload size.
    run_both_modes(|dev, scratch| {
        dev.reset_counts();
        let payload = vec![0_u8; BLOCK as usize * 2];
        buffered_write(dev, scratch, BLOCK, ByteOffset(u64::from(BLOCK) + 100), &payload)
            .unwrap();
        assert_eq!(target_erases(dev), vec![1, 2, 3]);
    });
}

#[test]
fn intermediate_block_written_exactly_once() {
    run_both_modes(|dev, scratch| {
        dev.reset_counts();
        let payload: Vec<u8> = (0..8200_u32).map(|i| (i % 256) as u8).collect();
        buffered_write(dev, scratch, BLOCK, ByteOffset(100), &payload).unwrap();

        // The span [100, 8300) has partial ends in blocks 0 and 2; block 1
        // is fully covered and must be programmed by exactly one call.
        assert_eq!(dev.programs_into_block(1), 1);
    });
}

#[test]
fn zero_length_write_is_free() {
    run_both_modes(|dev, scratch| {
        dev.reset_counts();
        buffered_write(dev, scratch, BLOCK, ByteOffset(123), &[]).unwrap();
        assert!(dev.erased_blocks().is_empty());
    });
}
