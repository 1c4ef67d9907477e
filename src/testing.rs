//! Host-side doubles for the two hardware seams, plus a bootstrapped
//! manager over simulated physical memory.

use crate::arch::MmuControl;
use crate::constants::memory::FRAME_SIZE;
use crate::memory::addr::{PhysAddr, VirtAddr};
use crate::memory::bitmap_frame_allocator::PhysRange;
use crate::memory::paging::{MemoryConfig, MemoryManager};
use crate::memory::phys::PhysMapper;

pub const POOL_BASE: u32 = 0x0010_0000;
const BITMAP_AT: u32 = 0x000F_0000;

/// Physical memory simulated by a host buffer: addresses `[base,
/// base + len)` land inside it. The buffer is leaked so copies of the
/// mapper stay valid for the whole test.
#[derive(Debug, Clone, Copy)]
pub struct ArenaMapper {
    base: u32,
    pointer: *mut u8,
    len: usize,
}

impl ArenaMapper {
    pub fn new(base: u32, len: usize) -> Self {
        // u64 backing keeps the bitmap's word accesses aligned.
        let buffer = vec![0u64; len.div_ceil(8)].into_boxed_slice();
        let pointer = Box::leak(buffer).as_mut_ptr().cast::<u8>();
        Self { base, pointer, len }
    }
}

impl PhysMapper for ArenaMapper {
    fn frame_to_pointer(&self, frame: PhysAddr) -> *mut u8 {
        let offset = frame
            .as_u32()
            .checked_sub(self.base)
            .unwrap_or_else(|| panic!("physical address {frame} below the arena")) as usize;
        assert!(offset < self.len, "physical address {frame} beyond the arena");
        unsafe { self.pointer.add(offset) }
    }
}

/// Records MMU programming instead of touching hardware.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    pub root: Option<PhysAddr>,
    pub paging_enabled: bool,
    pub flushes: usize,
}

impl MmuControl for RecordingMmu {
    fn load_root(&mut self, root: PhysAddr) {
        self.root = Some(root);
    }

    fn enable_paging(&mut self) {
        self.paging_enabled = true;
    }

    fn flush_page(&mut self, _page: VirtAddr) {
        self.flushes += 1;
    }

    fn fault_address(&self) -> VirtAddr {
        VirtAddr::new(0)
    }
}

/// Bootstrapped manager over `frames` frames of simulated memory, with
/// the frame bitmap parked just below the managed pool.
pub fn test_manager(frames: usize) -> MemoryManager<ArenaMapper, RecordingMmu> {
    let arena = ArenaMapper::new(
        BITMAP_AT,
        (POOL_BASE - BITMAP_AT) as usize + frames * FRAME_SIZE,
    );
    MemoryManager::bootstrap(
        arena,
        RecordingMmu::default(),
        MemoryConfig {
            physical_base: PhysAddr::new(POOL_BASE),
            physical_size: frames * FRAME_SIZE,
            bitmap_at: PhysAddr::new(BITMAP_AT),
            kernel_image: PhysRange::empty(),
        },
    )
    .expect("bootstrap over the test arena")
}
