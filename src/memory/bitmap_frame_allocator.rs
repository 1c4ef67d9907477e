//! Bitmap allocator for physical page frames.
//!
//! One bit per frame over a configured physical range, first-fit by
//! index. The bitmap itself lives inside physical memory at a
//! caller-chosen spot (conventionally right after the kernel image) and
//! is reached through [`PhysMapper`], so the allocator works before
//! paging exists: it is what page tables are allocated from.

use log::debug;

use crate::constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY};
use crate::error::KernelError;
use crate::memory::addr::PhysAddr;
use crate::memory::phys::PhysMapper;

/// A half-open range of physical addresses, such as the kernel image.
#[derive(Debug, Clone, Copy)]
pub struct PhysRange {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

impl PhysRange {
    pub const fn new(start: PhysAddr, end: PhysAddr) -> Self {
        Self { start, end }
    }

    pub const fn empty() -> Self {
        Self {
            start: PhysAddr::new(0),
            end: PhysAddr::new(0),
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.end.as_u32() <= self.start.as_u32()
    }
}

pub struct FrameAllocator {
    base: PhysAddr,
    total_frames: usize,
    free_frames: usize,
    bitmap: PhysAddr,
}

impl FrameAllocator {
    /// Set up the bitmap over `[base, base + region_size)`.
    ///
    /// Every frame starts free, then the frames overlapped by
    /// `kernel_image` and by the bitmap itself are marked used when they
    /// fall inside the managed range. `bitmap_at` must be 8-byte aligned
    /// and must point at memory reachable through `phys` for
    /// `region_size / FRAME_SIZE / 8` bytes.
    pub fn init<P: PhysMapper>(
        phys: &P,
        base: PhysAddr,
        region_size: usize,
        bitmap_at: PhysAddr,
        kernel_image: PhysRange,
    ) -> Result<Self, KernelError> {
        if !base.is_aligned() || bitmap_at.as_u32() % 8 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let total_frames = region_size / FRAME_SIZE;
        if total_frames == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut allocator = Self {
            base,
            total_frames,
            free_frames: total_frames,
            bitmap: bitmap_at,
        };

        let words = Self::bitmap_words(total_frames);
        unsafe {
            let bitmap = phys.frame_to_pointer(bitmap_at).cast::<u64>();
            for word in 0..words {
                bitmap.add(word).write(0);
            }
        }

        allocator.reserve(phys, kernel_image);
        let bitmap_end = PhysAddr::new(bitmap_at.as_u32() + (words * 8) as u32);
        allocator.reserve(phys, PhysRange::new(bitmap_at, bitmap_end));

        debug!(
            "frame allocator: {} frames at {}, {} free after reservations",
            allocator.total_frames, allocator.base, allocator.free_frames
        );
        Ok(allocator)
    }

    /// Lowest-indexed free frame, marked used. Scan is linear: frame
    /// counts are small and frame allocation is rare next to heap-object
    /// allocation.
    pub fn allocate<P: PhysMapper>(&mut self, phys: &P) -> Result<PhysAddr, KernelError> {
        if self.free_frames == 0 {
            return Err(KernelError::OutOfMemory);
        }
        let words = Self::bitmap_words(self.total_frames);
        for word_index in 0..words {
            if self.read_word(phys, word_index) == FULL_BITMAP_ENTRY {
                continue;
            }
            let first = word_index * BITMAP_ENTRY_SIZE;
            let last = (first + BITMAP_ENTRY_SIZE).min(self.total_frames);
            for frame_index in first..last {
                if !self.is_bit_set(phys, frame_index) {
                    self.set_bit(phys, frame_index);
                    self.free_frames -= 1;
                    return Ok(self.frame_address(frame_index));
                }
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Mark the frame owning `addr` free again.
    ///
    /// Addresses outside the managed range and frames that are already
    /// free are silently ignored; the policy is deliberately permissive
    /// (logged at debug level so a stricter redesign can find callers).
    pub fn release<P: PhysMapper>(&mut self, phys: &P, addr: PhysAddr) {
        let Some(frame_index) = self.frame_index(addr) else {
            debug!("release of unmanaged address {} ignored", addr);
            return;
        };
        if !self.is_bit_set(phys, frame_index) {
            debug!("double release of frame {} ignored", addr.align_down());
            return;
        }
        self.clear_bit(phys, frame_index);
        self.free_frames += 1;
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    fn bitmap_words(total_frames: usize) -> usize {
        total_frames.div_ceil(BITMAP_ENTRY_SIZE)
    }

    fn frame_address(&self, frame_index: usize) -> PhysAddr {
        PhysAddr::new(self.base.as_u32() + (frame_index * FRAME_SIZE) as u32)
    }

    /// Index of the frame owning `addr`, or None outside the range.
    fn frame_index(&self, addr: PhysAddr) -> Option<usize> {
        if addr.as_u32() < self.base.as_u32() {
            return None;
        }
        let index = (addr.as_u32() - self.base.as_u32()) as usize / FRAME_SIZE;
        (index < self.total_frames).then_some(index)
    }

    /// Mark every managed frame overlapping `range` as used.
    fn reserve<P: PhysMapper>(&mut self, phys: &P, range: PhysRange) {
        if range.is_empty() {
            return;
        }
        let first = range.start.align_down();
        let mut addr = first.as_u32();
        while addr < range.end.as_u32() {
            if let Some(frame_index) = self.frame_index(PhysAddr::new(addr)) {
                if !self.is_bit_set(phys, frame_index) {
                    self.set_bit(phys, frame_index);
                    self.free_frames -= 1;
                }
            }
            addr += FRAME_SIZE as u32;
        }
    }

    fn word_pointer<P: PhysMapper>(&self, phys: &P, word_index: usize) -> *mut u64 {
        unsafe { phys.frame_to_pointer(self.bitmap).cast::<u64>().add(word_index) }
    }

    fn read_word<P: PhysMapper>(&self, phys: &P, word_index: usize) -> u64 {
        unsafe { self.word_pointer(phys, word_index).read() }
    }

    fn is_bit_set<P: PhysMapper>(&self, phys: &P, frame_index: usize) -> bool {
        debug_assert!(frame_index < self.total_frames);
        let word = self.read_word(phys, frame_index / BITMAP_ENTRY_SIZE);
        word & (1 << (frame_index % BITMAP_ENTRY_SIZE)) != 0
    }

    fn set_bit<P: PhysMapper>(&mut self, phys: &P, frame_index: usize) {
        let pointer = self.word_pointer(phys, frame_index / BITMAP_ENTRY_SIZE);
        unsafe {
            pointer.write(pointer.read() | 1 << (frame_index % BITMAP_ENTRY_SIZE));
        }
    }

    fn clear_bit<P: PhysMapper>(&mut self, phys: &P, frame_index: usize) {
        let pointer = self.word_pointer(phys, frame_index / BITMAP_ENTRY_SIZE);
        unsafe {
            pointer.write(pointer.read() & !(1 << (frame_index % BITMAP_ENTRY_SIZE)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ArenaMapper;

    const POOL_BASE: u32 = 0x0010_0000;

    /// Arena with the bitmap parked below the managed pool.
    fn pool(frames: usize) -> (ArenaMapper, FrameAllocator) {
        let arena = ArenaMapper::new(0x000F_0000, 0x1_0000 + frames * FRAME_SIZE);
        let allocator = FrameAllocator::init(
            &arena,
            PhysAddr::new(POOL_BASE),
            frames * FRAME_SIZE,
            PhysAddr::new(0x000F_0000),
            PhysRange::empty(),
        )
        .unwrap();
        (arena, allocator)
    }

    #[test]
    fn scenario_first_fit_and_reuse() {
        let (arena, mut allocator) = pool(256);
        assert_eq!(allocator.allocate(&arena).unwrap(), PhysAddr::new(0x0010_0000));
        assert_eq!(allocator.allocate(&arena).unwrap(), PhysAddr::new(0x0010_1000));
        assert_eq!(allocator.allocate(&arena).unwrap(), PhysAddr::new(0x0010_2000));

        allocator.release(&arena, PhysAddr::new(0x0010_1000));
        assert_eq!(allocator.allocate(&arena).unwrap(), PhysAddr::new(0x0010_1000));
    }

    #[test]
    fn unique_in_range_until_exhausted() {
        let (arena, mut allocator) = pool(64);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let frame = allocator.allocate(&arena).unwrap();
            assert!(frame.as_u32() >= POOL_BASE);
            assert!(frame.as_u32() < POOL_BASE + 64 * FRAME_SIZE as u32);
            assert!(seen.insert(frame), "frame {frame} handed out twice");
        }
        assert_eq!(allocator.allocate(&arena), Err(KernelError::OutOfMemory));
        assert_eq!(allocator.free_frames(), 0);
    }

    #[test]
    fn release_restores_free_count() {
        let (arena, mut allocator) = pool(16);
        let before = allocator.free_frames();
        let a = allocator.allocate(&arena).unwrap();
        let b = allocator.allocate(&arena).unwrap();
        allocator.release(&arena, a);
        allocator.release(&arena, b);
        assert_eq!(allocator.free_frames(), before);
    }

    #[test]
    fn foreign_and_double_release_are_no_ops() {
        let (arena, mut allocator) = pool(16);
        let frame = allocator.allocate(&arena).unwrap();
        let free = allocator.free_frames();

        // Outside the managed range, both below and above.
        allocator.release(&arena, PhysAddr::new(0x0000_1000));
        allocator.release(&arena, PhysAddr::new(POOL_BASE + 16 * FRAME_SIZE as u32));
        assert_eq!(allocator.free_frames(), free);

        allocator.release(&arena, frame);
        allocator.release(&arena, frame);
        assert_eq!(allocator.free_frames(), free + 1);
    }

    #[test]
    fn release_uses_owning_frame() {
        let (arena, mut allocator) = pool(16);
        let frame = allocator.allocate(&arena).unwrap();
        allocator.release(&arena, frame.offset(0x123));
        assert_eq!(allocator.allocate(&arena).unwrap(), frame);
    }

    #[test]
    fn init_reserves_kernel_image_and_bitmap() {
        // Bitmap placed inside the managed pool: its frame must not be
        // handed out, and neither must the kernel image's.
        let arena = ArenaMapper::new(POOL_BASE, 32 * FRAME_SIZE);
        let image = PhysRange::new(PhysAddr::new(POOL_BASE), PhysAddr::new(POOL_BASE + 0x2000));
        let mut allocator = FrameAllocator::init(
            &arena,
            PhysAddr::new(POOL_BASE),
            32 * FRAME_SIZE,
            PhysAddr::new(POOL_BASE + 0x2000),
            image,
        )
        .unwrap();

        // Frames 0-1 hold the image, frame 2 the bitmap.
        assert_eq!(allocator.free_frames(), 29);
        assert_eq!(
            allocator.allocate(&arena).unwrap(),
            PhysAddr::new(POOL_BASE + 0x3000)
        );
    }

    #[test]
    fn misaligned_base_rejected() {
        let arena = ArenaMapper::new(POOL_BASE, 8 * FRAME_SIZE);
        let result = FrameAllocator::init(
            &arena,
            PhysAddr::new(POOL_BASE + 0x10),
            4 * FRAME_SIZE,
            PhysAddr::new(POOL_BASE),
            PhysRange::empty(),
        );
        assert!(matches!(result, Err(KernelError::InvalidArgument)));
    }
}
