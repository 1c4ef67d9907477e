//! Memory layout of the kernel.

/// Size of one page of virtual memory.
pub const PAGE_SIZE: usize = 4096;
/// Size of one frame of physical memory; equal to [`PAGE_SIZE`] by design.
pub const FRAME_SIZE: usize = 4096;

/// Entries in a page directory or page table (10-bit index).
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Directory slot reserved for the recursive self-mapping. The active
/// directory's own tables appear at fixed virtual addresses through it.
pub const RECURSIVE_SLOT: usize = 1023;

/// The one virtual page reserved for briefly viewing frames of inactive
/// address spaces. Lives in the shared kernel region, directory slot 1022.
pub const TEMP_WINDOW: u32 = 0xFFBF_F000;

/// Everything at or above this address belongs to the kernel and is shared
/// into every process address space by directory entry.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// The kernel heap window. Pages inside it are demand-mapped as the heap
/// grows; the page tables covering it are installed at bootstrap so all
/// address spaces see the same heap.
pub const HEAP_START: u32 = 0xC020_0000;
pub const HEAP_SIZE: usize = 1024 * 1024; // 1 MiB

/// Block granularity of the block-table heap strategy.
pub const HEAP_BLOCK_SIZE: usize = 4096;

/// Largest request a slab class serves; anything bigger goes straight to
/// whole mapped pages.
pub const SLAB_MAX_OBJECT: usize = PAGE_SIZE / 2;
/// Smallest slab class. An object must at least hold its free-list link.
pub const SLAB_MIN_OBJECT: usize = 8;

/// Low physical memory that stays identity mapped (virtual == physical)
/// across the transition into paging, so the kernel image remains
/// reachable.
pub const LOW_IDENTITY_SIZE: usize = 4 * 1024 * 1024;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFF_FFFF_FFFF_FFFF;
