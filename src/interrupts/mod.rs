//! Fault reporting hooks.
//!
//! Page faults are diagnostics, not a recovery mechanism: there is no
//! demand paging, so a fault means a kernel or process bug and the
//! handler's job is to say where. The interrupt table itself belongs to
//! the platform layer and is injected, like the console is for logging.

use log::{error, info};

use crate::arch::MmuControl;

pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Installs `handler` at `vector` in the platform's interrupt table.
pub type InstallVector = unsafe fn(vector: u8, handler: usize);
/// Activates the platform's interrupt table.
pub type LoadTable = unsafe fn();

/// Wire the page-fault handler in and activate the table.
///
/// # Safety
///
/// `handler` must be the address of a correctly framed interrupt
/// handler; `install` and `load` must match the platform's tables.
pub unsafe fn init(install: InstallVector, load: LoadTable, handler: usize) {
    install(PAGE_FAULT_VECTOR, handler);
    load();
    info!("page fault reporting installed");
}

/// Called from the page-fault handler: report the faulting address and
/// the hardware error code. The caller decides whether to halt.
pub fn log_page_fault<M: MmuControl>(mmu: &M, error_code: u32) {
    error!(
        "page fault at {} (error code {:#06x})",
        mmu.fault_address(),
        error_code
    );
}
