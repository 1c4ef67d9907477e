#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod constants;
pub mod error;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod processes;

pub use error::KernelError;

pub mod prelude {
    pub use crate::arch::{Context, MmuControl};
    pub use crate::error::KernelError;
    pub use crate::memory::{
        AddressSpace, EntryFlags, MemoryConfig, MemoryManager, PhysAddr, VirtAddr,
    };
    pub use crate::processes::ProcessTable;
}

#[cfg(test)]
pub(crate) mod testing;
