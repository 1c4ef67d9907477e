//! The architecture-specific floor of the kernel.
//!
//! Exactly two things need real hardware: programming the translation
//! unit (CR3/CR0/INVLPG/CR2) and transferring control into a saved
//! context. Both are isolated here behind one trait and one primitive;
//! everything above them is ordinary data manipulation and runs on any
//! target.

use crate::memory::addr::{PhysAddr, VirtAddr};

/// Control over the hardware translation unit.
pub trait MmuControl {
    /// Load `root` as the active page directory. Implicitly flushes all
    /// cached translations.
    fn load_root(&mut self, root: PhysAddr);

    /// Turn translation on. The currently executing code and stack must
    /// already be mapped in the active space or the processor faults on
    /// the next fetch.
    fn enable_paging(&mut self);

    /// Invalidate any cached translation for the page containing `page`.
    fn flush_page(&mut self, page: VirtAddr);

    /// Address that caused the most recent page fault. Diagnostics only.
    fn fault_address(&self) -> VirtAddr;
}

/// Saved execution state of a process: everything [`transfer`] needs to
/// resume it. The instruction pointer is only meaningful for the first
/// entry into a process; afterwards the call/return protocol preserves it
/// on the saved stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    pub stack_pointer: u32,
    pub frame_pointer: u32,
    pub instruction_pointer: u32,
}

/// The real 32-bit protected-mode MMU.
#[cfg(target_arch = "x86")]
#[derive(Debug, Default)]
pub struct ProtectedMode;

#[cfg(target_arch = "x86")]
impl MmuControl for ProtectedMode {
    fn load_root(&mut self, root: PhysAddr) {
        unsafe {
            core::arch::asm!(
                "mov cr3, {root}",
                root = in(reg) root.as_u32(),
                options(nostack, preserves_flags),
            );
        }
    }

    fn enable_paging(&mut self) {
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr0",
                "or {tmp}, 0x80000000",
                "mov cr0, {tmp}",
                tmp = out(reg) _,
                options(nostack),
            );
        }
    }

    fn flush_page(&mut self, page: VirtAddr) {
        unsafe {
            core::arch::asm!(
                "invlpg [{page}]",
                page = in(reg) page.as_u32(),
                options(nostack, preserves_flags),
            );
        }
    }

    fn fault_address(&self) -> VirtAddr {
        let addr: u32;
        unsafe {
            core::arch::asm!(
                "mov {addr}, cr2",
                addr = out(reg) addr,
                options(nostack, preserves_flags),
            );
        }
        VirtAddr::new(addr)
    }
}

/// Install `next` and jump into it. Never returns.
///
/// The outgoing context, if any, gets the live stack and frame pointers;
/// its instruction pointer is left alone because the return address is
/// already on the stack being saved.
///
/// # Safety
///
/// `next` must describe a runnable context whose stack and code are
/// mapped in the active address space. The caller must have loaded the
/// target's translation root beforehand.
#[cfg(target_arch = "x86")]
pub unsafe fn transfer(save: Option<&mut Context>, next: &Context) -> ! {
    if let Some(previous) = save {
        core::arch::asm!(
            "mov {esp}, esp",
            "mov {ebp}, ebp",
            esp = out(reg) previous.stack_pointer,
            ebp = out(reg) previous.frame_pointer,
            options(nostack, preserves_flags),
        );
    }
    core::arch::asm!(
        "mov esp, {esp}",
        "mov ebp, {ebp}",
        "jmp {eip}",
        esp = in(reg) next.stack_pointer,
        ebp = in(reg) next.frame_pointer,
        eip = in(reg) next.instruction_pointer,
        options(noreturn),
    )
}
