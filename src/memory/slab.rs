//! Slab allocator for small kernel objects.
//!
//! Sits on top of [`BlockHeap`]: each slab is one heap block holding a
//! small header and a free list of equal-sized objects, one slab chain
//! per power-of-two size class from 8 to 2048 bytes. Requests above the
//! largest class bypass the slabs and go to the block heap whole.
//!
//! Objects are zeroed when handed out, not when freed. Free takes only
//! the address: page-aligned addresses can only be bulk allocations
//! (the header occupies every slab's first bytes), anything else finds
//! its class through the owning slab's header.

use log::debug;

use crate::arch::MmuControl;
use crate::constants::memory::{PAGE_SIZE, SLAB_MAX_OBJECT, SLAB_MIN_OBJECT};
use crate::error::KernelError;
use crate::memory::addr::VirtAddr;
use crate::memory::heap::BlockHeap;
use crate::memory::paging::MemoryManager;
use crate::memory::phys::PhysMapper;

/// Object sizes served from slabs, smallest first.
pub const SIZE_CLASSES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

const _: () = assert!(
    SIZE_CLASSES[0] == SLAB_MIN_OBJECT && SIZE_CLASSES[SIZE_CLASSES.len() - 1] == SLAB_MAX_OBJECT
);

/// Space reserved at the start of every slab page. Larger than the
/// header itself so the first object stays size-aligned.
const HEADER_SPAN: usize = 16;

/// Bookkeeping at the start of each slab page. Links are stored as raw
/// virtual addresses (0 for none) because the slab lives in mapped
/// memory the allocator cannot hold references into.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SlabHeader {
    next_slab: u32,
    free_head: u32,
    object_size: u16,
    free_count: u16,
}

/// Per-class slab chains. Holds no memory itself; slab pages come from
/// the block heap and all access goes through the active address space.
pub struct SlabHeap {
    class_heads: [VirtAddr; SIZE_CLASSES.len()],
}

impl SlabHeap {
    pub const fn new() -> Self {
        Self {
            class_heads: [VirtAddr::new(0); SIZE_CLASSES.len()],
        }
    }

    /// Smallest size class holding `size` bytes, or None above the slab
    /// ceiling.
    fn class_index(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&class| class >= size)
    }

    fn first_object_offset(class: usize) -> usize {
        class.max(HEADER_SPAN)
    }

    fn objects_per_slab(class: usize) -> usize {
        (PAGE_SIZE - Self::first_object_offset(class)) / class
    }

    pub fn allocate<P: PhysMapper, M: MmuControl>(
        &mut self,
        size: usize,
        pages: &mut BlockHeap<'_>,
        mem: &mut MemoryManager<P, M>,
    ) -> Result<VirtAddr, KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if size > SLAB_MAX_OBJECT {
            return pages.allocate_zeroed(size, mem);
        }
        let class_index = Self::class_index(size).ok_or(KernelError::InvalidArgument)?;
        let class = SIZE_CLASSES[class_index];

        let slab = match self.slab_with_room(class_index, mem)? {
            Some(slab) => slab,
            None => self.grow(class_index, pages, mem)?,
        };

        let mut header = read_header(slab, mem)?;
        let object = VirtAddr::new(header.free_head);
        header.free_head = read_link(object, mem)?;
        header.free_count -= 1;
        write_header(slab, header, mem)?;

        mem.zero_range(object, class)?;
        Ok(object)
    }

    /// [`allocate`](Self::allocate) with the zero guarantee stated in
    /// the name. Slab objects are zeroed on pop and bulk requests go
    /// through the block heap's zeroing path, so both routes already
    /// hand out zero-filled memory.
    pub fn allocate_zeroed<P: PhysMapper, M: MmuControl>(
        &mut self,
        size: usize,
        pages: &mut BlockHeap<'_>,
        mem: &mut MemoryManager<P, M>,
    ) -> Result<VirtAddr, KernelError> {
        self.allocate(size, pages, mem)
    }

    /// Return `addr` to its slab, or to the block heap for bulk
    /// allocations. Null and unrecognized addresses are ignored.
    pub fn free<P: PhysMapper, M: MmuControl>(
        &mut self,
        addr: VirtAddr,
        pages: &mut BlockHeap<'_>,
        mem: &mut MemoryManager<P, M>,
    ) {
        if addr.is_null() {
            return;
        }
        let slab = addr.align_down();
        if addr == slab {
            pages.free(addr);
            return;
        }
        let Ok(mut header) = read_header(slab, mem) else {
            debug!("free of {} in unmapped memory ignored", addr);
            return;
        };
        let class = header.object_size as usize;
        if !SIZE_CLASSES.contains(&class) {
            debug!("free of {} outside any slab ignored", addr);
            return;
        }
        let offset = (addr.as_u32() - slab.as_u32()) as usize;
        let first = Self::first_object_offset(class);
        if offset < first || (offset - first) % class != 0 {
            debug!("free of {} not on a {}-byte object boundary ignored", addr, class);
            return;
        }

        if write_link(addr, header.free_head, mem).is_err() {
            return;
        }
        header.free_head = addr.as_u32();
        header.free_count += 1;
        let _ = write_header(slab, header, mem);
    }

    /// First slab in the class chain with a free object.
    fn slab_with_room<P: PhysMapper, M: MmuControl>(
        &self,
        class_index: usize,
        mem: &mut MemoryManager<P, M>,
    ) -> Result<Option<VirtAddr>, KernelError> {
        let mut slab = self.class_heads[class_index];
        while !slab.is_null() {
            let header = read_header(slab, mem)?;
            if header.free_count > 0 {
                return Ok(Some(slab));
            }
            slab = VirtAddr::new(header.next_slab);
        }
        Ok(None)
    }

    /// Take a fresh block from the heap and carve it into a slab at the
    /// head of the class chain.
    fn grow<P: PhysMapper, M: MmuControl>(
        &mut self,
        class_index: usize,
        pages: &mut BlockHeap<'_>,
        mem: &mut MemoryManager<P, M>,
    ) -> Result<VirtAddr, KernelError> {
        let class = SIZE_CLASSES[class_index];
        let slab = pages.allocate(PAGE_SIZE)?;
        let first = Self::first_object_offset(class);
        let capacity = Self::objects_per_slab(class);

        for slot in 0..capacity {
            let object = slab.offset((first + slot * class) as u32);
            let next = if slot + 1 < capacity {
                slab.as_u32() + (first + (slot + 1) * class) as u32
            } else {
                0
            };
            write_link(object, next, mem)?;
        }

        write_header(
            slab,
            SlabHeader {
                next_slab: self.class_heads[class_index].as_u32(),
                free_head: slab.as_u32() + first as u32,
                object_size: class as u16,
                free_count: capacity as u16,
            },
            mem,
        )?;
        self.class_heads[class_index] = slab;
        debug!("new slab at {} serving {}-byte objects, {} per slab", slab, class, capacity);
        Ok(slab)
    }
}

impl Default for SlabHeap {
    fn default() -> Self {
        Self::new()
    }
}

fn read_header<P: PhysMapper, M: MmuControl>(
    slab: VirtAddr,
    mem: &mut MemoryManager<P, M>,
) -> Result<SlabHeader, KernelError> {
    let view = mem.virt_view(slab)?;
    Ok(unsafe { view.cast::<SlabHeader>().read() })
}

fn write_header<P: PhysMapper, M: MmuControl>(
    slab: VirtAddr,
    header: SlabHeader,
    mem: &mut MemoryManager<P, M>,
) -> Result<(), KernelError> {
    let view = mem.virt_view(slab)?;
    unsafe { view.cast::<SlabHeader>().write(header) };
    Ok(())
}

/// Free-list link stored in the first bytes of a free object.
fn read_link<P: PhysMapper, M: MmuControl>(
    object: VirtAddr,
    mem: &mut MemoryManager<P, M>,
) -> Result<u32, KernelError> {
    let view = mem.virt_view(object)?;
    Ok(unsafe { view.cast::<u32>().read() })
}

fn write_link<P: PhysMapper, M: MmuControl>(
    object: VirtAddr,
    link: u32,
    mem: &mut MemoryManager<P, M>,
) -> Result<(), KernelError> {
    let view = mem.virt_view(object)?;
    unsafe { view.cast::<u32>().write(link) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::HEAP_START;
    use crate::memory::heap::BlockFlags;
    use crate::testing::{test_manager, ArenaMapper, RecordingMmu};

    const WINDOW_PAGES: usize = 8;

    fn setup() -> (
        MemoryManager<ArenaMapper, RecordingMmu>,
        [BlockFlags; WINDOW_PAGES],
    ) {
        let mut manager = test_manager(128);
        manager.map_heap_window(WINDOW_PAGES).unwrap();
        (manager, [BlockFlags::empty(); WINDOW_PAGES])
    }

    #[test]
    fn small_objects_share_a_slab() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        let a = slab.allocate(32, &mut pages, &mut mem).unwrap();
        let b = slab.allocate(20, &mut pages, &mut mem).unwrap();
        // 20 rounds up into the 32-byte class, landing next to the first.
        assert_eq!(b.as_u32(), a.as_u32() + 32);
        assert_eq!(pages.free_blocks(), WINDOW_PAGES - 1);
    }

    #[test]
    fn tiny_requests_round_up_to_the_smallest_class() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        let a = slab.allocate(1, &mut pages, &mut mem).unwrap();
        let b = slab.allocate(SLAB_MIN_OBJECT, &mut pages, &mut mem).unwrap();
        assert_eq!(b.as_u32(), a.as_u32() + SLAB_MIN_OBJECT as u32);
    }

    #[test]
    fn freed_object_is_reused_and_zeroed() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        let a = slab.allocate(64, &mut pages, &mut mem).unwrap();
        unsafe {
            mem.virt_view(a).unwrap().write_bytes(0x5A, 64);
        }
        slab.free(a, &mut pages, &mut mem);

        let again = slab.allocate(64, &mut pages, &mut mem).unwrap();
        assert_eq!(again, a);
        let view = mem.virt_view(again).unwrap();
        for offset in 0..64 {
            assert_eq!(unsafe { view.add(offset).read() }, 0);
        }
    }

    #[test]
    fn allocate_zeroed_scrubs_on_both_routes() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        // Slab route: dirty an object, free it, take it back zeroed.
        let object = slab.allocate(128, &mut pages, &mut mem).unwrap();
        unsafe {
            mem.virt_view(object).unwrap().write_bytes(0xC3, 128);
        }
        slab.free(object, &mut pages, &mut mem);
        let again = slab.allocate_zeroed(128, &mut pages, &mut mem).unwrap();
        assert_eq!(again, object);
        let view = mem.virt_view(again).unwrap();
        for offset in 0..128 {
            assert_eq!(unsafe { view.add(offset).read() }, 0);
        }

        // Bulk route: dirty a page through the block heap, then get it
        // back zeroed via the slab surface.
        let bulk = slab.allocate(PAGE_SIZE, &mut pages, &mut mem).unwrap();
        unsafe {
            mem.virt_view(bulk).unwrap().write_bytes(0xC3, 256);
        }
        slab.free(bulk, &mut pages, &mut mem);
        let bulk_again = slab.allocate_zeroed(PAGE_SIZE, &mut pages, &mut mem).unwrap();
        assert_eq!(bulk_again, bulk);
        let view = mem.virt_view(bulk_again).unwrap();
        for offset in 0..256 {
            assert_eq!(unsafe { view.add(offset).read() }, 0);
        }
    }

    #[test]
    fn writes_stay_within_the_object() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        let a = slab.allocate(32, &mut pages, &mut mem).unwrap();
        let b = slab.allocate(32, &mut pages, &mut mem).unwrap();
        unsafe {
            mem.virt_view(a).unwrap().write_bytes(0x11, 32);
            mem.virt_view(b).unwrap().write_bytes(0x22, 32);
        }
        let view = mem.virt_view(a).unwrap();
        for offset in 0..32 {
            assert_eq!(unsafe { view.add(offset).read() }, 0x11);
        }
    }

    #[test]
    fn boundary_request_stays_in_the_slabs() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        // 2048 is the last slab class: one object per slab, offset 2048.
        let a = slab.allocate(SLAB_MAX_OBJECT, &mut pages, &mut mem).unwrap();
        assert_eq!(a.page_offset(), SLAB_MAX_OBJECT as u32);

        // One byte more bypasses the slabs entirely.
        let bulk = slab.allocate(SLAB_MAX_OBJECT + 1, &mut pages, &mut mem).unwrap();
        assert!(bulk.is_aligned());
    }

    #[test]
    fn bulk_allocations_round_trip_through_the_block_heap() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        let bulk = slab.allocate(3 * PAGE_SIZE, &mut pages, &mut mem).unwrap();
        assert_eq!(pages.free_blocks(), WINDOW_PAGES - 3);
        slab.free(bulk, &mut pages, &mut mem);
        assert_eq!(pages.free_blocks(), WINDOW_PAGES);
    }

    #[test]
    fn class_chains_grow_when_a_slab_fills() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        // 1024-byte class: three objects per slab (header span eats one).
        let per_slab = SlabHeap::objects_per_slab(1024);
        for _ in 0..per_slab {
            slab.allocate(1024, &mut pages, &mut mem).unwrap();
        }
        assert_eq!(pages.free_blocks(), WINDOW_PAGES - 1);
        slab.allocate(1024, &mut pages, &mut mem).unwrap();
        assert_eq!(pages.free_blocks(), WINDOW_PAGES - 2);
    }

    #[test]
    fn bad_frees_are_ignored() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        let a = slab.allocate(128, &mut pages, &mut mem).unwrap();
        slab.free(VirtAddr::new(0), &mut pages, &mut mem);
        // Mid-object address is not an object boundary.
        slab.free(a.offset(5), &mut pages, &mut mem);
        // Unmapped memory far from the heap.
        slab.free(VirtAddr::new(0x4000_0123), &mut pages, &mut mem);

        let b = slab.allocate(128, &mut pages, &mut mem).unwrap();
        assert_eq!(b.as_u32(), a.as_u32() + 128);
    }

    #[test]
    fn exhaustion_propagates_from_the_block_heap() {
        let (mut mem, mut table) = setup();
        let mut pages = BlockHeap::new(VirtAddr::new(HEAP_START), &mut table).unwrap();
        let mut slab = SlabHeap::new();

        for _ in 0..WINDOW_PAGES {
            pages.allocate(PAGE_SIZE).unwrap();
        }
        assert_eq!(
            slab.allocate(64, &mut pages, &mut mem),
            Err(KernelError::OutOfMemory)
        );
    }
}
