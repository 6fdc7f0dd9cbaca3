//! Boundary-tag block allocator.
//!
//! The heap is managed as uniform blocks of [`MEM_BLOCK_SIZE`] bytes. One
//! signed counter per block forms the index: a run of `L` occupied blocks
//! stores `L` at its first and last block, a free run stores `-L` at both
//! ends. The redundant tags make the coalescing decision on `free` O(1):
//! only the two neighbouring tags are inspected, never the whole index.
//!
//! A zero tag encountered where a run boundary must be is not an
//! allocation failure; it means the index itself has been corrupted, and
//! the kernel halts.

use alloc::{boxed::Box, vec};
use core::fmt;

use log::{debug, trace};

use crate::config::MEM_BLOCK_SIZE;

/// Start address of a block run handed out by [`BlockAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPtr(pub usize);

/// Rejection reasons for [`BlockAllocator::free`]. All of these are
/// caller mistakes, not kernel corruption, and are returned rather than
/// halting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// The pointer lies outside the managed heap.
    OutOfRange,
    /// The pointer is not block-aligned.
    Misaligned,
    /// The block under the pointer is not the start of an occupied run.
    NotAllocated,
    /// The tag at the computed run end disagrees; the pointer points
    /// into the middle of a larger allocation.
    NotRunStart,
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeError::OutOfRange => write!(f, "pointer outside the heap"),
            FreeError::Misaligned => write!(f, "pointer not block aligned"),
            FreeError::NotAllocated => write!(f, "block is not allocated"),
            FreeError::NotRunStart => write!(f, "pointer is not the start of an allocation"),
        }
    }
}

/// Number of blocks needed to back `bytes` bytes.
pub const fn blocks_for(bytes: usize) -> usize {
    (bytes + MEM_BLOCK_SIZE - 1) / MEM_BLOCK_SIZE
}

pub struct BlockAllocator {
    heap_start: usize,
    n_blocks: usize,
    index_blocks: usize,
    index: Box<[i32]>,
}

impl BlockAllocator {
    /// Sizes the index to cover `heap_len` bytes starting at `heap_start`
    /// and seeds two runs: the index's own occupied run (the heap is
    /// self-describing, the index is its first allocation) and one free
    /// run covering the remainder.
    pub fn new(heap_start: usize, heap_len: usize) -> Self {
        let n_blocks = heap_len / MEM_BLOCK_SIZE;
        assert!(n_blocks <= i32::MAX as usize, "heap too large for the block index");
        let index_blocks = blocks_for(n_blocks * core::mem::size_of::<i32>());
        assert!(
            index_blocks < n_blocks,
            "heap too small to hold its own index"
        );

        let mut index = vec![0i32; n_blocks].into_boxed_slice();
        index[0] = index_blocks as i32;
        index[index_blocks - 1] = index_blocks as i32;
        let free_run = (n_blocks - index_blocks) as i32;
        index[index_blocks] = -free_run;
        index[n_blocks - 1] = -free_run;

        debug!(
            "block allocator: {} blocks of {} bytes, index occupies {}",
            n_blocks, MEM_BLOCK_SIZE, index_blocks
        );

        Self {
            heap_start,
            n_blocks,
            index_blocks,
            index,
        }
    }

    /// First-fit scan from the low address. Occupied runs are skipped by
    /// their full length; a free run larger than `nblocks` is carved at
    /// its front, an exact fit flips its tags in place.
    ///
    /// Returns `None` when no run fits, ordinary exhaustion the caller
    /// is expected to handle. Panics if the scan lands on a zero tag,
    /// which can only mean the index is corrupted.
    pub fn alloc(&mut self, nblocks: usize) -> Option<BlockPtr> {
        if nblocks == 0 || nblocks > self.n_blocks {
            return None;
        }
        let want = nblocks as i32;

        let mut i = 0usize;
        while i < self.n_blocks {
            let tag = self.index[i];

            if tag > 0 {
                i += tag as usize;
                continue;
            }

            if tag < 0 {
                let free_run = -tag;

                if free_run > want {
                    // Carve the first `nblocks` off, shrink the rest.
                    let remainder = free_run - want;
                    self.index[i + free_run as usize - 1] = -remainder;
                    self.index[i + nblocks] = -remainder;
                    self.index[i + nblocks - 1] = want;
                    self.index[i] = want;

                    trace!("alloc {} blocks at {}", nblocks, i);
                    return Some(self.ptr_at(i));
                }

                if free_run == want {
                    self.index[i] = want;
                    self.index[i + nblocks - 1] = want;

                    trace!("alloc {} blocks at {} (exact fit)", nblocks, i);
                    return Some(self.ptr_at(i));
                }

                i += free_run as usize;
                continue;
            }

            panic!("memory index corrupted at block {}", i);
        }

        trace!("alloc {} blocks: out of memory", nblocks);
        None
    }

    /// [`alloc`](Self::alloc) sized in bytes.
    pub fn alloc_bytes(&mut self, bytes: usize) -> Option<BlockPtr> {
        self.alloc(blocks_for(bytes))
    }

    /// Returns the run starting at `ptr` to the free state, merging with
    /// the preceding and following runs where those are free. Interior
    /// tags that stop being boundaries are zeroed.
    pub fn free(&mut self, ptr: BlockPtr) -> Result<(), FreeError> {
        let addr = ptr.0;
        let heap_end = self.heap_start + self.n_blocks * MEM_BLOCK_SIZE;

        if addr < self.heap_start || addr >= heap_end {
            return Err(FreeError::OutOfRange);
        }
        if (addr - self.heap_start) % MEM_BLOCK_SIZE != 0 {
            return Err(FreeError::Misaligned);
        }

        let entry = (addr - self.heap_start) / MEM_BLOCK_SIZE;
        let tag = self.index[entry];
        if tag <= 0 {
            return Err(FreeError::NotAllocated);
        }
        if self.index.get(entry + tag as usize - 1) != Some(&tag) {
            return Err(FreeError::NotRunStart);
        }

        let mut start = entry;
        let mut size = tag as usize;

        let prev_free = entry > 0 && self.index[entry - 1] < 0;
        let next_free = entry + size < self.n_blocks && self.index[entry + size] < 0;

        if !prev_free && !next_free {
            self.index[start] = -(size as i32);
            self.index[start + size - 1] = -(size as i32);
        }

        if prev_free {
            let prev_len = (-self.index[entry - 1]) as usize;
            let prev_start = entry - prev_len;
            let joined = (size + prev_len) as i32;

            self.index[entry] = 0;
            self.index[entry - 1] = 0;
            self.index[prev_start] = -joined;
            self.index[prev_start + joined as usize - 1] = -joined;

            start = prev_start;
            size = joined as usize;
        }

        if next_free {
            let next_len = (-self.index[start + size]) as usize;
            let joined = (size + next_len) as i32;

            self.index[start + size - 1] = 0;
            self.index[start + size] = 0;
            self.index[start] = -joined;
            self.index[start + joined as usize - 1] = -joined;
        }

        trace!("freed {} blocks at {}", tag, entry);
        Ok(())
    }

    pub fn total_blocks(&self) -> usize {
        self.n_blocks
    }

    /// Blocks currently sitting in free runs.
    pub fn free_blocks(&self) -> usize {
        self.runs()
            .filter(|&(_, len)| len < 0)
            .map(|(_, len)| -len as usize)
            .sum()
    }

    /// Iterates `(first block, signed run length)` over every run.
    /// Positive lengths are occupied runs, negative are free runs.
    pub fn runs(&self) -> Runs<'_> {
        Runs { alloc: self, at: 0 }
    }

    /// Logs the non-zero index entries, the allocator's debug dump.
    pub fn log_index(&self) {
        for (start, len) in self.runs() {
            debug!("  block {}: run {}", start, len);
        }
    }

    fn ptr_at(&self, block: usize) -> BlockPtr {
        BlockPtr(self.heap_start + block * MEM_BLOCK_SIZE)
    }

    #[cfg(test)]
    fn poison(&mut self, block: usize) {
        self.index[block] = 0;
    }
}

pub struct Runs<'a> {
    alloc: &'a BlockAllocator,
    at: usize,
}

impl Iterator for Runs<'_> {
    type Item = (usize, i32);

    fn next(&mut self) -> Option<(usize, i32)> {
        if self.at >= self.alloc.n_blocks {
            return None;
        }
        let start = self.at;
        let tag = self.alloc.index[start];
        if tag == 0 {
            panic!("memory index corrupted at block {}", start);
        }
        self.at += tag.unsigned_abs() as usize;
        Some((start, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP_START: usize = 0x8020_0000;

    fn allocator(n_blocks: usize) -> BlockAllocator {
        BlockAllocator::new(HEAP_START, n_blocks * MEM_BLOCK_SIZE)
    }

    fn runs(a: &BlockAllocator) -> std::vec::Vec<(usize, i32)> {
        a.runs().collect()
    }

    #[test]
    fn index_is_the_first_allocation() {
        let a = allocator(10);
        // 10 * 4 index bytes fit in one block.
        assert_eq!(runs(&a), [(0, 1), (1, -9)]);
        assert_eq!(a.free_blocks(), 9);
    }

    #[test]
    fn carve_then_exact_fit_then_restore() {
        let mut a = allocator(10);

        let first = a.alloc(3).unwrap();
        assert_eq!(first.0, HEAP_START + MEM_BLOCK_SIZE);
        let second = a.alloc(2).unwrap();
        assert_eq!(second.0, HEAP_START + 4 * MEM_BLOCK_SIZE);
        assert_eq!(runs(&a), [(0, 1), (1, 3), (4, 2), (6, -4)]);

        a.free(first).unwrap();
        assert_eq!(runs(&a), [(0, 1), (1, -3), (4, 2), (6, -4)]);

        // Freeing the second run merges both neighbours into one.
        a.free(second).unwrap();
        assert_eq!(runs(&a), [(0, 1), (1, -9)]);
    }

    #[test]
    fn exact_fit_leaves_no_free_blocks_behind() {
        let mut a = allocator(10);
        let whole = a.alloc(9).unwrap();
        assert_eq!(a.free_blocks(), 0);
        assert!(a.alloc(1).is_none());

        a.free(whole).unwrap();
        assert_eq!(runs(&a), [(0, 1), (1, -9)]);
    }

    #[test]
    fn first_fit_skips_occupied_and_small_runs() {
        let mut a = allocator(16);
        let one = a.alloc(1).unwrap();
        let _two = a.alloc(2).unwrap();
        a.free(one).unwrap();

        // A two-block request cannot use the single freed block.
        let two_more = a.alloc(2).unwrap();
        assert_eq!(two_more.0, HEAP_START + 4 * MEM_BLOCK_SIZE);
        // A one-block request does.
        assert_eq!(a.alloc(1).unwrap(), one);
    }

    #[test]
    fn coalescing_is_total() {
        let mut a = allocator(12);
        let x = a.alloc(2).unwrap();
        let y = a.alloc(3).unwrap();
        let z = a.alloc(2).unwrap();
        let w = a.alloc(4).unwrap();
        assert_eq!(a.free_blocks(), 0);

        // Free in an order that exercises merge-left, merge-right and
        // merge-both.
        a.free(x).unwrap();
        a.free(z).unwrap();
        a.free(y).unwrap();
        a.free(w).unwrap();

        // No two adjacent free runs remain and no block is lost.
        assert_eq!(runs(&a), [(0, 1), (1, -11)]);
        let total: usize = a.runs().map(|(_, l)| l.unsigned_abs() as usize).sum();
        assert_eq!(total, a.total_blocks());
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let mut a = allocator(8);
        assert!(a.alloc(20).is_none());
        let p = a.alloc(7).unwrap();
        assert!(a.alloc(1).is_none());
        a.free(p).unwrap();
        assert!(a.alloc(1).is_some());
    }

    #[test]
    fn free_rejects_bad_pointers() {
        let mut a = allocator(10);
        let p = a.alloc(2).unwrap();

        assert_eq!(a.free(BlockPtr(HEAP_START - MEM_BLOCK_SIZE)), Err(FreeError::OutOfRange));
        assert_eq!(
            a.free(BlockPtr(HEAP_START + 10 * MEM_BLOCK_SIZE)),
            Err(FreeError::OutOfRange)
        );
        assert_eq!(a.free(BlockPtr(p.0 + 1)), Err(FreeError::Misaligned));
        // Interior of a run carries a zero tag.
        assert_eq!(a.free(BlockPtr(HEAP_START + 5 * MEM_BLOCK_SIZE)), Err(FreeError::NotAllocated));

        a.free(p).unwrap();
        assert_eq!(a.free(p), Err(FreeError::NotAllocated));
    }

    #[test]
    fn free_rejects_run_end_tag() {
        let mut a = allocator(10);
        let first = a.alloc(2).unwrap();
        let _second = a.alloc(3).unwrap();

        // The end tag of the first run reads 2, but the tag two blocks
        // further is the second run's start tag, so the lengths disagree.
        let end_tag = BlockPtr(first.0 + MEM_BLOCK_SIZE);
        assert_eq!(a.free(end_tag), Err(FreeError::NotRunStart));
    }

    #[test]
    #[should_panic(expected = "memory index corrupted")]
    fn zero_tag_mid_scan_halts() {
        let mut a = allocator(10);
        let _held = a.alloc(2).unwrap();
        a.poison(1);
        let _ = a.alloc(4);
    }
}
