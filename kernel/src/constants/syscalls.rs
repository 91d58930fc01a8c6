// Syscall numbers, i386 numbering
pub const SYSCALL_EXIT: u32 = 1;
pub const SYSCALL_GETPID: u32 = 20;
pub const SYSCALL_GETPPID: u32 = 64;
pub const SYSCALL_SCHED_YIELD: u32 = 158;

/// Returned in eax for unknown calls and failures (-1).
pub const SYSCALL_ERROR: u32 = u32::MAX;
