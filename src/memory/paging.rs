//! Two-level hardware page tables and per-address-space mappings.
//!
//! The manager runs in one of two modes. In bootstrap mode (translation
//! off) directory and table frames are edited through their physical
//! addresses. Once [`MemoryManager::enable_paging`] flips the hardware
//! on, physical memory stops being addressable and every edit goes
//! through a virtual window instead: the active space's own tables via
//! the recursive slot, any other space's frames via the single
//! temporary-mapping window. Each entry access picks exactly one of the
//! three paths; they are never mixed inside one operation.

use bitflags::bitflags;
use log::{debug, info};

use crate::arch::MmuControl;
use crate::constants::memory::{
    ENTRIES_PER_TABLE, FRAME_SIZE, HEAP_SIZE, HEAP_START, KERNEL_BASE, LOW_IDENTITY_SIZE,
    PAGE_SIZE, RECURSIVE_SLOT, TEMP_WINDOW,
};
use crate::error::KernelError;
use crate::memory::addr::{PhysAddr, VirtAddr};
use crate::memory::bitmap_frame_allocator::{FrameAllocator, PhysRange};
use crate::memory::phys::PhysMapper;

bitflags! {
    /// Flag bits of a directory or table entry, exactly as the hardware
    /// lays them out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
    }
}

/// One page-directory or page-table entry: a frame address in bits 31:12
/// combined with [`EntryFlags`] in the low bits.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    const ADDR_MASK: u32 = 0xFFFF_F000;

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub fn new(frame: PhysAddr, flags: EntryFlags) -> Self {
        debug_assert!(frame.is_aligned());
        Self((frame.as_u32() & Self::ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & Self::ADDR_MASK)
    }

    #[inline]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// An entry may be dereferenced as a table pointer only when this
    /// returns true.
    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PageEntry({}, {:?})", self.frame(), self.flags())
        } else {
            write!(f, "PageEntry(absent)")
        }
    }
}

/// Opaque handle to one address space: the physical frame of its page
/// directory plus the default flags its page tables are installed with.
///
/// The handle is inert data; the space it names only does anything while
/// loaded into the translation root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    directory: PhysAddr,
    default_flags: EntryFlags,
}

impl AddressSpace {
    pub fn directory(&self) -> PhysAddr {
        self.directory
    }
}

/// Physical memory layout handed to [`MemoryManager::bootstrap`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// Start of the managed physical pool.
    pub physical_base: PhysAddr,
    /// Size of the pool in bytes.
    pub physical_size: usize,
    /// Where the frame bitmap lives (conventionally right after the
    /// kernel image).
    pub bitmap_at: PhysAddr,
    /// Physical extent of the kernel image, reserved at init.
    pub kernel_image: PhysRange,
}

/// Owns the frame allocator, the kernel address space, and the paging
/// state machine. Constructed once at startup; all other singletons in
/// this crate hang off it.
pub struct MemoryManager<P: PhysMapper, M: MmuControl> {
    phys: P,
    mmu: M,
    frames: FrameAllocator,
    kernel_space: AddressSpace,
    active_space: AddressSpace,
    paging_enabled: bool,
    window_busy: bool,
    heap_pages: usize,
}

/// Virtual address of the active directory itself, seen through the
/// recursive slot.
const RECURSIVE_DIR_VA: u32 = ((RECURSIVE_SLOT as u32) << 22) | ((RECURSIVE_SLOT as u32) << 12);
/// Base of the 4 MiB region where the active space's page tables appear.
const RECURSIVE_TABLE_BASE: u32 = (RECURSIVE_SLOT as u32) << 22;

fn recursive_directory_pointer() -> *mut u32 {
    RECURSIVE_DIR_VA as usize as *mut u32
}

fn recursive_table_pointer(dir_index: usize) -> *mut u32 {
    (RECURSIVE_TABLE_BASE as usize + dir_index * PAGE_SIZE) as *mut u32
}

impl<P: PhysMapper, M: MmuControl> MemoryManager<P, M> {
    /// Stand the whole memory core up, in bootstrap order: frame
    /// allocator first, then the kernel address space with its recursive
    /// slot, the identity mapping of low memory, and the pre-installed
    /// page tables for the heap window and the temporary window. The
    /// kernel space is switched in; paging stays off until the caller
    /// decides its code and stack are covered.
    pub fn bootstrap(phys: P, mmu: M, config: MemoryConfig) -> Result<Self, KernelError> {
        let frames = FrameAllocator::init(
            &phys,
            config.physical_base,
            config.physical_size,
            config.bitmap_at,
            config.kernel_image,
        )?;

        let placeholder = AddressSpace {
            directory: PhysAddr::new(0),
            default_flags: EntryFlags::empty(),
        };
        let mut manager = Self {
            phys,
            mmu,
            frames,
            kernel_space: placeholder,
            active_space: placeholder,
            paging_enabled: false,
            window_busy: false,
            heap_pages: 0,
        };

        let kernel = manager.create_address_space(EntryFlags::WRITABLE)?;
        manager.kernel_space = kernel;

        // Keep the kernel image reachable across the paging switch.
        manager.map(
            &kernel,
            VirtAddr::new(0),
            PhysAddr::new(0),
            LOW_IDENTITY_SIZE,
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
        )?;

        // Install the kernel-side page tables now so every later process
        // directory shares them by entry; tables added after a process is
        // created would not propagate.
        let table_span = (ENTRIES_PER_TABLE * PAGE_SIZE) as u32;
        let mut heap_va = HEAP_START;
        while heap_va < HEAP_START + HEAP_SIZE as u32 {
            manager.ensure_table(&kernel, VirtAddr::new(heap_va).directory_index())?;
            heap_va += table_span;
        }
        manager.ensure_table(&kernel, VirtAddr::new(TEMP_WINDOW).directory_index())?;

        manager.switch(&kernel);
        info!(
            "memory core up: {} frames managed, kernel directory {}",
            manager.frames.total_frames(),
            kernel.directory()
        );
        Ok(manager)
    }

    /// Fresh address space: a zeroed directory whose only entry is the
    /// recursive self-mapping. `flags` become the space's defaults:
    /// page tables installed into a user space must carry the user bit
    /// or user leaves below them are unreachable.
    pub fn create_address_space(&mut self, flags: EntryFlags) -> Result<AddressSpace, KernelError> {
        let directory = self.frames.allocate(&self.phys)?;
        self.zero_frame(directory);
        self.entry_write_in_frame(
            directory,
            RECURSIVE_SLOT,
            PageEntry::new(directory, EntryFlags::PRESENT | EntryFlags::WRITABLE),
        );
        debug!("created address space, directory {}", directory);
        Ok(AddressSpace {
            directory,
            default_flags: flags,
        })
    }

    /// Map `size` bytes (rounded up to whole pages) of `space` starting
    /// at `virt` onto physical memory starting at `frame`, with `flags`
    /// on every leaf entry.
    ///
    /// Missing page tables are allocated and installed on the way. A
    /// table-allocation failure aborts the call with `OutOfMemory` and
    /// leaves already-installed pages in place; callers must treat the
    /// range as undefined and not retry at the same addresses.
    ///
    /// The temporary window page and the whole recursive region above it
    /// are off limits: a leaf written through the recursive slot would
    /// land in the directory itself.
    pub fn map(
        &mut self,
        space: &AddressSpace,
        virt: VirtAddr,
        frame: PhysAddr,
        size: usize,
        flags: EntryFlags,
    ) -> Result<(), KernelError> {
        if !virt.is_aligned() || !frame.is_aligned() || size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let span = (pages * PAGE_SIZE) as u64;
        // Everything from the temp window up is reserved table machinery.
        if virt.as_u32() as u64 + span > TEMP_WINDOW as u64
            || frame.as_u32() as u64 + span > 1 << 32
        {
            return Err(KernelError::InvalidArgument);
        }
        for page in 0..pages {
            let offset = (page * PAGE_SIZE) as u32;
            self.map_page(space, virt.offset(offset), frame.offset(offset), flags)?;
        }
        Ok(())
    }

    /// Clear the leaf entry for `virt` and drop any cached translation.
    ///
    /// The reserved region at the top of the address space is rejected,
    /// as in [`map`](Self::map).
    pub fn unmap(&mut self, space: &AddressSpace, virt: VirtAddr) -> Result<(), KernelError> {
        if !virt.is_aligned() || virt.as_u32() >= TEMP_WINDOW {
            return Err(KernelError::InvalidArgument);
        }
        let pde = self.read_pde(space, virt.directory_index());
        if !pde.is_present() {
            return Err(KernelError::NotMapped);
        }
        let table = pde.frame();
        let entry = self.read_pte(space, table, virt.directory_index(), virt.table_index());
        if !entry.is_present() {
            return Err(KernelError::NotMapped);
        }
        self.write_pte(
            space,
            table,
            virt.directory_index(),
            virt.table_index(),
            PageEntry::empty(),
        );
        if self.paging_enabled && space.directory == self.active_space.directory {
            self.mmu.flush_page(virt);
        }
        Ok(())
    }

    /// Walk `space`'s tables for `virt`. `NotMapped` if either level's
    /// entry lacks the present bit.
    pub fn translate(&mut self, space: &AddressSpace, virt: VirtAddr) -> Result<PhysAddr, KernelError> {
        let pde = self.read_pde(space, virt.directory_index());
        if !pde.is_present() {
            return Err(KernelError::NotMapped);
        }
        let entry = self.read_pte(space, pde.frame(), virt.directory_index(), virt.table_index());
        if !entry.is_present() {
            return Err(KernelError::NotMapped);
        }
        Ok(entry.frame().offset(virt.page_offset()))
    }

    /// [`translate`](Self::translate) against the active space.
    pub fn virtual_to_physical(&mut self, virt: VirtAddr) -> Result<PhysAddr, KernelError> {
        let active = self.active_space;
        self.translate(&active, virt)
    }

    /// Load `space` into the hardware translation root, making it the
    /// active space. The previous space becomes inert data.
    pub fn switch(&mut self, space: &AddressSpace) {
        self.active_space = *space;
        self.mmu.load_root(space.directory);
    }

    /// Turn hardware translation on. Once-only: the transition from
    /// bootstrap mode to window mode must be explicit, so a second call
    /// is rejected instead of ignored.
    pub fn enable_paging(&mut self) -> Result<(), KernelError> {
        if self.paging_enabled || self.active_space.directory.is_null() {
            return Err(KernelError::InvalidArgument);
        }
        self.mmu.enable_paging();
        self.paging_enabled = true;
        info!("paging enabled, root {}", self.active_space.directory());
        Ok(())
    }

    /// Copy the kernel's shared directory entries into `target`: the
    /// identity-mapped low region and everything at or above
    /// `KERNEL_BASE`, except the recursive slot, which must stay the
    /// target's own. The user region is left empty.
    pub fn clone_kernel_mappings(&mut self, target: &AddressSpace) {
        let kernel = self.kernel_space;
        let low_tables = LOW_IDENTITY_SIZE / (ENTRIES_PER_TABLE * PAGE_SIZE);
        let kernel_start = (KERNEL_BASE >> 22) as usize;
        for dir_index in (0..low_tables).chain(kernel_start..RECURSIVE_SLOT) {
            let entry = self.read_pde(&kernel, dir_index);
            if entry.is_present() {
                self.write_pde(target, dir_index, entry);
            }
        }
    }

    /// Back `pages` more pages of the kernel heap window with fresh
    /// frames, mapped supervisor-writable into the kernel space (and
    /// thereby into every process space, which shares the window's
    /// tables). Growth continues from the high-water mark, so repeated
    /// calls extend the backed region; the start of the new extent is
    /// returned.
    pub fn map_heap_window(&mut self, pages: usize) -> Result<VirtAddr, KernelError> {
        if pages == 0 || (self.heap_pages + pages) * PAGE_SIZE > HEAP_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let kernel = self.kernel_space;
        let start = VirtAddr::new(HEAP_START + (self.heap_pages * PAGE_SIZE) as u32);
        for page in 0..pages {
            let frame = self.frames.allocate(&self.phys)?;
            self.map_page(
                &kernel,
                start.offset((page * PAGE_SIZE) as u32),
                frame,
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
            )?;
        }
        self.heap_pages += pages;
        Ok(start)
    }

    pub fn kernel_space(&self) -> AddressSpace {
        self.kernel_space
    }

    pub fn active_space(&self) -> AddressSpace {
        self.active_space
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    pub fn allocate_frame(&mut self) -> Result<PhysAddr, KernelError> {
        self.frames.allocate(&self.phys)
    }

    pub fn release_frame(&mut self, addr: PhysAddr) {
        self.frames.release(&self.phys, addr);
    }

    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    pub fn total_frames(&self) -> usize {
        self.frames.total_frames()
    }

    /// Pointer through which `virt` of the active space can be touched.
    /// Valid only up to the end of the page containing `virt`.
    pub fn virt_view(&mut self, virt: VirtAddr) -> Result<*mut u8, KernelError> {
        let target = self.virtual_to_physical(virt)?;
        if self.paging_enabled {
            Ok(virt.as_u32() as usize as *mut u8)
        } else {
            let frame = target.align_down();
            let pointer = self.phys.frame_to_pointer(frame);
            Ok(unsafe { pointer.add(target.page_offset() as usize) })
        }
    }

    /// Zero `len` bytes of the active space starting at `virt`.
    pub fn zero_range(&mut self, virt: VirtAddr, len: usize) -> Result<(), KernelError> {
        let mut cursor = virt.as_u32() as u64;
        let end = cursor + len as u64;
        while cursor < end {
            let address = VirtAddr::new(cursor as u32);
            let in_page = (PAGE_SIZE - address.page_offset() as usize).min((end - cursor) as usize);
            let pointer = self.virt_view(address)?;
            unsafe { core::ptr::write_bytes(pointer, 0, in_page) };
            cursor += in_page as u64;
        }
        Ok(())
    }

    fn map_page(
        &mut self,
        space: &AddressSpace,
        virt: VirtAddr,
        frame: PhysAddr,
        flags: EntryFlags,
    ) -> Result<(), KernelError> {
        let table = self.ensure_table(space, virt.directory_index())?;
        self.write_pte(
            space,
            table,
            virt.directory_index(),
            virt.table_index(),
            PageEntry::new(frame, flags),
        );
        if self.paging_enabled && space.directory == self.active_space.directory {
            self.mmu.flush_page(virt);
        }
        Ok(())
    }

    /// Page table for `dir_index`, installing a fresh zeroed one when the
    /// directory entry is absent.
    fn ensure_table(
        &mut self,
        space: &AddressSpace,
        dir_index: usize,
    ) -> Result<PhysAddr, KernelError> {
        let pde = self.read_pde(space, dir_index);
        if pde.is_present() {
            return Ok(pde.frame());
        }
        let table = self.frames.allocate(&self.phys)?;
        self.zero_frame(table);
        let mut flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        if space.default_flags.contains(EntryFlags::USER) {
            flags |= EntryFlags::USER;
        }
        self.write_pde(space, dir_index, PageEntry::new(table, flags));
        if self.paging_enabled && space.directory == self.active_space.directory {
            // The table's slot in the recursive region was cached absent.
            self.mmu
                .flush_page(VirtAddr::new(RECURSIVE_TABLE_BASE + (dir_index * PAGE_SIZE) as u32));
        }
        Ok(table)
    }

    fn read_pde(&mut self, space: &AddressSpace, dir_index: usize) -> PageEntry {
        if self.paging_enabled && space.directory == self.active_space.directory {
            unsafe {
                PageEntry::from_raw(recursive_directory_pointer().add(dir_index).read_volatile())
            }
        } else {
            self.entry_read_in_frame(space.directory, dir_index)
        }
    }

    fn write_pde(&mut self, space: &AddressSpace, dir_index: usize, entry: PageEntry) {
        if self.paging_enabled && space.directory == self.active_space.directory {
            unsafe {
                recursive_directory_pointer()
                    .add(dir_index)
                    .write_volatile(entry.raw());
            }
        } else {
            self.entry_write_in_frame(space.directory, dir_index, entry);
        }
    }

    fn read_pte(
        &mut self,
        space: &AddressSpace,
        table: PhysAddr,
        dir_index: usize,
        table_index: usize,
    ) -> PageEntry {
        if self.paging_enabled && space.directory == self.active_space.directory {
            unsafe {
                PageEntry::from_raw(
                    recursive_table_pointer(dir_index)
                        .add(table_index)
                        .read_volatile(),
                )
            }
        } else {
            self.entry_read_in_frame(table, table_index)
        }
    }

    fn write_pte(
        &mut self,
        space: &AddressSpace,
        table: PhysAddr,
        dir_index: usize,
        table_index: usize,
        entry: PageEntry,
    ) {
        if self.paging_enabled && space.directory == self.active_space.directory {
            unsafe {
                recursive_table_pointer(dir_index)
                    .add(table_index)
                    .write_volatile(entry.raw());
            }
        } else {
            self.entry_write_in_frame(table, table_index, entry);
        }
    }

    /// Run `f` over a frame that is not reachable through the active
    /// space's tables: directly while paging is off, through the
    /// temporary window afterwards.
    fn with_frame<R>(&mut self, frame: PhysAddr, f: impl FnOnce(*mut u8) -> R) -> R {
        if self.paging_enabled {
            let pointer = self.window_map(frame);
            let result = f(pointer);
            self.window_unmap();
            result
        } else {
            f(self.phys.frame_to_pointer(frame))
        }
    }

    fn entry_read_in_frame(&mut self, table: PhysAddr, index: usize) -> PageEntry {
        self.with_frame(table, |pointer| unsafe {
            PageEntry::from_raw(pointer.cast::<u32>().add(index).read_volatile())
        })
    }

    fn entry_write_in_frame(&mut self, table: PhysAddr, index: usize, entry: PageEntry) {
        self.with_frame(table, |pointer| unsafe {
            pointer.cast::<u32>().add(index).write_volatile(entry.raw());
        })
    }

    fn zero_frame(&mut self, frame: PhysAddr) {
        self.with_frame(frame, |pointer| unsafe {
            core::ptr::write_bytes(pointer, 0, FRAME_SIZE);
        })
    }

    /// Bring `frame` into view at the temporary window. One window, no
    /// reentrancy: callers must unmap before mapping again.
    fn window_map(&mut self, frame: PhysAddr) -> *mut u8 {
        debug_assert!(self.paging_enabled);
        debug_assert!(!self.window_busy, "temporary window is not reentrant");
        self.window_busy = true;
        let window = VirtAddr::new(TEMP_WINDOW);
        let entry = PageEntry::new(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        unsafe {
            recursive_table_pointer(window.directory_index())
                .add(window.table_index())
                .write_volatile(entry.raw());
        }
        self.mmu.flush_page(window);
        TEMP_WINDOW as usize as *mut u8
    }

    fn window_unmap(&mut self) {
        let window = VirtAddr::new(TEMP_WINDOW);
        unsafe {
            recursive_table_pointer(window.directory_index())
                .add(window.table_index())
                .write_volatile(PageEntry::empty().raw());
        }
        self.mmu.flush_page(window);
        self.window_busy = false;
    }
}
