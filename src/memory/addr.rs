//! Physical and virtual address types.
//!
//! Newtype wrappers keep the two address kinds from mixing. The split
//! matters here more than in most kernels: before paging is enabled the
//! manager operates on raw physical frames, afterwards only on virtual
//! windows, and code paths must never confuse the two modes.

use core::fmt;

use crate::constants::memory::PAGE_SIZE;

/// Mask of the in-page offset bits.
pub const PAGE_MASK: u32 = PAGE_SIZE as u32 - 1;

/// A 32-bit physical memory address.
///
/// Cannot be dereferenced directly; it must go through a
/// [`PhysMapper`](crate::memory::phys::PhysMapper) first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// True for the address the rest of the crate treats as "no frame".
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Start of the frame this address falls into.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn page_offset(self) -> u32 {
        self.0 & PAGE_MASK
    }

    #[inline]
    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A 32-bit virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Index into the page directory: bits 31:22.
    #[inline]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Index into the page table: bits 21:12.
    #[inline]
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }

    /// In-page offset: bits 11:0.
    #[inline]
    pub const fn page_offset(self) -> u32 {
        self.0 & PAGE_MASK
    }

    #[inline]
    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_split() {
        let addr = VirtAddr::new(0xC020_1234);
        assert_eq!(addr.directory_index(), 0xC020_1234 >> 22);
        assert_eq!(addr.table_index(), (0xC020_1234 >> 12) & 0x3FF);
        assert_eq!(addr.page_offset(), 0x234);
    }

    #[test]
    fn recursive_window_addresses() {
        // Directory slot 1023 pointing at itself puts the directory at the
        // top page and table N at 0xFFC0_0000 + N * 4096.
        let dir = VirtAddr::new(0xFFFF_F000);
        assert_eq!(dir.directory_index(), 1023);
        assert_eq!(dir.table_index(), 1023);

        let table_5 = VirtAddr::new(0xFFC0_0000 + 5 * 0x1000);
        assert_eq!(table_5.directory_index(), 1023);
        assert_eq!(table_5.table_index(), 5);
    }

    #[test]
    fn alignment() {
        let addr = PhysAddr::new(0x0010_1234);
        assert!(!addr.is_aligned());
        assert_eq!(addr.align_down(), PhysAddr::new(0x0010_1000));
        assert!(PhysAddr::new(0x0010_1000).is_aligned());
    }
}
