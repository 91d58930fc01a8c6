extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use arrayvec::ArrayString;

use crate::{
    constants::processes::{KERNEL_STACK_SIZE, PROCESS_NAME_MAX},
    memory::{paging::AddressSpace, MemoryError},
    processes::{registers::Context, Pid},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Address space a process runs in.
#[derive(Debug)]
pub enum ProcessSpace {
    /// The shared kernel space.
    Kernel,
    /// A space owned by this process alone.
    User(AddressSpace),
}

/// Kernel-mode stack, carved from the kernel heap so it is mapped in every
/// address space.
pub struct KernelStack {
    memory: Box<[u8]>,
}

impl KernelStack {
    pub fn new() -> Result<Self, MemoryError> {
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(KERNEL_STACK_SIZE)
            .map_err(|_| MemoryError::OutOfMemory)?;
        memory.resize(KERNEL_STACK_SIZE, 0);
        Ok(KernelStack {
            memory: memory.into_boxed_slice(),
        })
    }

    /// Highest usable address, 16-byte aligned. The stack grows down from it.
    pub fn top_addr(&self) -> usize {
        (self.memory.as_ptr() as usize + self.memory.len()) & !0xF
    }

    /// `top_addr` as the 32-bit stack pointer the CPU loads. Only exact on
    /// the 32-bit target; host tests see the address truncated.
    pub fn top(&self) -> u32 {
        self.top_addr() as u32
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }
}

impl core::fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KernelStack(top: {:#x})", self.top_addr())
    }
}

/// Process control block.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    name: ArrayString<PROCESS_NAME_MAX>,
    pub(super) state: ProcessState,
    pub(super) context: Context,
    space: ProcessSpace,
    kernel_stack: KernelStack,
    priority: u32,
    time_slice: u32,
    pub(super) remaining: u32,
    pub(super) ticks_used: u64,
    pub(super) exit_code: Option<i32>,
    /// Tick at which a sleeping process becomes Ready again.
    pub(super) wake_at: Option<u64>,
    pub(super) parent: Option<Pid>,
    pub(super) children: Vec<Pid>,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        pid: Pid,
        name: &str,
        state: ProcessState,
        context: Context,
        space: ProcessSpace,
        kernel_stack: KernelStack,
        priority: u32,
        time_slice: u32,
        parent: Option<Pid>,
    ) -> Self {
        Process {
            pid,
            name: truncated_name(name),
            state,
            context,
            space,
            kernel_stack,
            priority,
            time_slice,
            remaining: time_slice,
            ticks_used: 0,
            exit_code: None,
            wake_at: None,
            parent,
            children: Vec::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Saved register file. Stale while the process is Running.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn space(&self) -> &ProcessSpace {
        &self.space
    }

    pub fn is_kernel(&self) -> bool {
        matches!(self.space, ProcessSpace::Kernel)
    }

    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn time_slice(&self) -> u32 {
        self.time_slice
    }

    pub fn remaining_slice(&self) -> u32 {
        self.remaining
    }

    pub fn ticks_used(&self) -> u64 {
        self.ticks_used
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Set while the process sleeps.
    pub fn wake_at(&self) -> Option<u64> {
        self.wake_at
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn children(&self) -> &[Pid] {
        &self.children
    }

    pub(super) fn into_space(self) -> ProcessSpace {
        self.space
    }
}

/// Keeps at most `PROCESS_NAME_MAX - 1` bytes, cut on a char boundary.
fn truncated_name(name: &str) -> ArrayString<PROCESS_NAME_MAX> {
    let mut end = name.len().min(PROCESS_NAME_MAX - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut stored = ArrayString::new();
    stored.push_str(&name[..end]);
    stored
}
