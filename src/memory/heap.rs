//! Block-table kernel heap.
//!
//! The heap window is carved into fixed 4 KiB blocks tracked by a side
//! table of one tag byte per block. Allocation is a first-fit scan for a
//! run of free blocks; the run is recorded in the tags themselves
//! (first block, continuation chain), so `free` needs only the start
//! address. Coarse but predictable; the slab layer sits on top for
//! small objects.

use bitflags::bitflags;
use log::debug;

use crate::arch::MmuControl;
use crate::constants::memory::HEAP_BLOCK_SIZE;
use crate::error::KernelError;
use crate::memory::addr::VirtAddr;
use crate::memory::paging::MemoryManager;
use crate::memory::phys::PhysMapper;

bitflags! {
    /// Per-block tag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        const TAKEN = 1 << 0;
        /// First block of an allocation; the only block `free` accepts.
        const IS_FIRST = 1 << 6;
        /// The allocation continues into the following block.
        const HAS_NEXT = 1 << 7;
    }
}

/// Allocator over a virtually contiguous, already mapped heap window.
/// The tag table is borrowed, not owned; at startup it lives in kernel
/// static storage sized for the full window.
pub struct BlockHeap<'t> {
    start: VirtAddr,
    table: &'t mut [BlockFlags],
}

impl<'t> BlockHeap<'t> {
    /// `table` must carry one entry per block of `[start, start +
    /// table.len() * HEAP_BLOCK_SIZE)`. All blocks start free.
    pub fn new(start: VirtAddr, table: &'t mut [BlockFlags]) -> Result<Self, KernelError> {
        if start.as_u32() as usize % HEAP_BLOCK_SIZE != 0 || table.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        table.fill(BlockFlags::empty());
        Ok(Self { start, table })
    }

    /// First-fit run of enough blocks for `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<VirtAddr, KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let blocks = size.div_ceil(HEAP_BLOCK_SIZE);
        if blocks > self.table.len() {
            return Err(KernelError::OutOfMemory);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.table.len() {
            if self.table[index].contains(BlockFlags::TAKEN) {
                run_start = index + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == blocks {
                self.claim(run_start, blocks);
                return Ok(self.block_address(run_start));
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// [`allocate`](Self::allocate), with the claimed blocks zeroed
    /// through the active address space.
    pub fn allocate_zeroed<P: PhysMapper, M: MmuControl>(
        &mut self,
        size: usize,
        mem: &mut MemoryManager<P, M>,
    ) -> Result<VirtAddr, KernelError> {
        let blocks = size.div_ceil(HEAP_BLOCK_SIZE);
        let addr = self.allocate(size)?;
        mem.zero_range(addr, blocks * HEAP_BLOCK_SIZE)?;
        Ok(addr)
    }

    /// Release the allocation starting at `addr`.
    ///
    /// Null is ignored. Addresses that are not the first block of a live
    /// allocation are ignored too, logged at debug level.
    pub fn free(&mut self, addr: VirtAddr) {
        if addr.is_null() {
            return;
        }
        let Some(first) = self.block_index(addr) else {
            debug!("free of address {} outside the heap ignored", addr);
            return;
        };
        if !self.table[first].contains(BlockFlags::IS_FIRST) {
            debug!("free of {} which is no allocation start ignored", addr);
            return;
        }
        let mut index = first;
        loop {
            let tag = self.table[index];
            self.table[index] = BlockFlags::empty();
            if !tag.contains(BlockFlags::HAS_NEXT) {
                break;
            }
            index += 1;
        }
    }

    /// Forget every allocation. Used once, right after paging comes up:
    /// bootstrap-time allocations referred to physical addresses and are
    /// invalid in the virtual regime.
    pub fn reset(&mut self) {
        self.table.fill(BlockFlags::empty());
    }

    pub fn total_blocks(&self) -> usize {
        self.table.len()
    }

    pub fn free_blocks(&self) -> usize {
        self.table
            .iter()
            .filter(|tag| !tag.contains(BlockFlags::TAKEN))
            .count()
    }

    fn claim(&mut self, first: usize, blocks: usize) {
        for index in first..first + blocks {
            let mut tag = BlockFlags::TAKEN;
            if index == first {
                tag |= BlockFlags::IS_FIRST;
            }
            if index + 1 < first + blocks {
                tag |= BlockFlags::HAS_NEXT;
            }
            self.table[index] = tag;
        }
    }

    fn block_address(&self, index: usize) -> VirtAddr {
        self.start.offset((index * HEAP_BLOCK_SIZE) as u32)
    }

    /// Index of the block starting exactly at `addr`, or None.
    fn block_index(&self, addr: VirtAddr) -> Option<usize> {
        if addr.as_u32() < self.start.as_u32() {
            return None;
        }
        let offset = (addr.as_u32() - self.start.as_u32()) as usize;
        if offset % HEAP_BLOCK_SIZE != 0 {
            return None;
        }
        let index = offset / HEAP_BLOCK_SIZE;
        (index < self.table.len()).then_some(index)
    }
}
