//! Memory management: physical frames, page tables, and the kernel heap.

pub mod addr;
pub mod bitmap_frame_allocator;
pub mod heap;
pub mod paging;
pub mod phys;
pub mod slab;

pub use addr::{PhysAddr, VirtAddr};
pub use bitmap_frame_allocator::{FrameAllocator, PhysRange};
pub use heap::{BlockFlags, BlockHeap};
pub use paging::{AddressSpace, EntryFlags, MemoryConfig, MemoryManager, PageEntry};
pub use phys::{IdentityMapper, PhysMapper};
pub use slab::SlabHeap;
