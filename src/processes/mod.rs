//! Process management: the process table and cooperative switching.

pub mod process;

pub use process::{Pcb, ProcessState, ProcessTable};
