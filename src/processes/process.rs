//! Fixed-size process table and cooperative context switching.
//!
//! Every process owns an address space whose kernel half is cloned from
//! the kernel directory at creation. Switching is voluntary: the running
//! process asks the table to transfer control, the table loads the
//! target's translation root and the architecture layer swaps stacks.

use arrayvec::ArrayVec;
use log::{debug, info};

use crate::arch::{Context, MmuControl};
use crate::constants::processes::MAX_PROCESSES;
use crate::error::KernelError;
use crate::memory::addr::VirtAddr;
use crate::memory::paging::{AddressSpace, EntryFlags, MemoryManager};
use crate::memory::phys::PhysMapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
}

/// Process control block.
#[derive(Debug)]
pub struct Pcb {
    pub pid: u32,
    pub state: ProcessState,
    pub space: AddressSpace,
    pub context: Context,
}

/// All processes in the system. Fixed capacity, no allocation; slots are
/// indexed positionally and identified externally by pid.
pub struct ProcessTable {
    processes: ArrayVec<Pcb, MAX_PROCESSES>,
    current: Option<usize>,
    next_pid: u32,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            processes: ArrayVec::new_const(),
            current: None,
            next_pid: 1,
        }
    }

    /// New process around `entry` with its stack top at `stack_top`.
    ///
    /// The process gets a fresh user address space sharing the kernel's
    /// upper-half and identity mappings. Its first activation jumps to
    /// `entry`; nothing is mapped for it beyond the kernel share, the
    /// caller sets up code and stack pages before switching in.
    pub fn create_process<P: PhysMapper, M: MmuControl>(
        &mut self,
        mem: &mut MemoryManager<P, M>,
        entry: VirtAddr,
        stack_top: VirtAddr,
    ) -> Result<u32, KernelError> {
        if self.processes.is_full() {
            return Err(KernelError::ProcessTableFull);
        }
        let space = mem.create_address_space(EntryFlags::USER | EntryFlags::WRITABLE)?;
        mem.clone_kernel_mappings(&space);

        let pid = self.next_pid;
        self.next_pid += 1;
        self.processes.push(Pcb {
            pid,
            state: ProcessState::Ready,
            space,
            context: Context {
                stack_pointer: stack_top.as_u32(),
                frame_pointer: stack_top.as_u32(),
                instruction_pointer: entry.as_u32(),
            },
        });
        info!("created process {pid}, entry {entry}, stack top {stack_top}");
        Ok(pid)
    }

    pub fn get(&self, pid: u32) -> Option<&Pcb> {
        self.processes.iter().find(|process| process.pid == pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut Pcb> {
        self.processes.iter_mut().find(|process| process.pid == pid)
    }

    pub fn current(&self) -> Option<&Pcb> {
        self.current.map(|index| &self.processes[index])
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Everything of a switch except the stack swap: state transitions,
    /// bookkeeping, and loading the target's translation root. Returns
    /// the outgoing slot (for saving its context) and a copy of the
    /// incoming context.
    pub fn prepare_switch<P: PhysMapper, M: MmuControl>(
        &mut self,
        pid: u32,
        mem: &mut MemoryManager<P, M>,
    ) -> Result<(Option<usize>, Context), KernelError> {
        let next = self
            .processes
            .iter()
            .position(|process| process.pid == pid)
            .ok_or(KernelError::InvalidArgument)?;

        let previous = self.current;
        if let Some(index) = previous {
            self.processes[index].state = ProcessState::Ready;
        }
        self.processes[next].state = ProcessState::Running;
        self.current = Some(next);

        let space = self.processes[next].space;
        mem.switch(&space);
        debug!("switching to process {pid}");
        Ok((previous, self.processes[next].context))
    }

    /// Cooperative transfer of control into process `pid`. Saves the
    /// running stack into the outgoing process's context, so the next
    /// switch back resumes right here.
    ///
    /// # Safety
    ///
    /// The target's context must point at mapped, runnable code and
    /// stack in its address space.
    #[cfg(target_arch = "x86")]
    pub unsafe fn switch_to<P: PhysMapper, M: MmuControl>(
        &mut self,
        pid: u32,
        mem: &mut MemoryManager<P, M>,
    ) -> Result<core::convert::Infallible, KernelError> {
        let (previous, next) = self.prepare_switch(pid, mem)?;
        let save = previous.map(|index| &mut self.processes[index].context);
        crate::arch::transfer(save, &next)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
