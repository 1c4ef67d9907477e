//! Access to raw physical memory.
//!
//! Everything that touches the bytes of a physical frame goes through
//! [`PhysMapper`], so the same allocator and table-walk code runs in
//! bootstrap mode (physical addresses directly addressable), and under
//! test (physical memory stood up in a host buffer).

use crate::memory::addr::PhysAddr;

/// Turns a physical address into a pointer the kernel can dereference.
pub trait PhysMapper {
    /// Pointer through which `frame` can be read and written.
    ///
    /// The returned pointer is valid for the rest of the frame, i.e. for
    /// `FRAME_SIZE - frame.page_offset()` bytes. Callers are responsible
    /// for not aliasing live mappings.
    fn frame_to_pointer(&self, frame: PhysAddr) -> *mut u8;
}

/// Bootstrap-mode access: physical and virtual addresses coincide.
///
/// Valid before paging is enabled, and afterwards only for the
/// identity-mapped low region.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    #[inline]
    fn frame_to_pointer(&self, frame: PhysAddr) -> *mut u8 {
        frame.as_u32() as usize as *mut u8
    }
}
