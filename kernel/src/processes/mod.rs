//! Process control blocks and the round-robin scheduler.

use spin::Mutex;

use crate::memory::MemoryError;

pub mod process;
pub mod registers;
pub mod scheduler;

pub use process::{Process, ProcessSpace, ProcessState};
pub use registers::{Context, TrapFrame};
pub use scheduler::{ms_to_ticks, ProcessManager};

pub type Pid = u32;

/// Kernel-global process manager, installed by `init`.
pub static PROCESS_MANAGER: Mutex<Option<ProcessManager>> = Mutex::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    Memory(MemoryError),
    NoSuchProcess,
    /// Destroying the running or idle process, blocking the idle process,
    /// waking a process that is not blocked.
    InvalidOperation,
}

impl From<MemoryError> for ProcessError {
    fn from(error: MemoryError) -> Self {
        ProcessError::Memory(error)
    }
}

impl core::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProcessError::Memory(error) => write!(f, "Memory error: {}", error),
            ProcessError::NoSuchProcess => write!(f, "No such process"),
            ProcessError::InvalidOperation => write!(f, "Invalid process operation"),
        }
    }
}
