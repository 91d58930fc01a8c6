pub const PROCESS_NAME_MAX: usize = 32;
pub const KERNEL_STACK_PAGES: usize = 2;
pub const KERNEL_STACK_SIZE: usize = KERNEL_STACK_PAGES * 4096;

/// Reserved; the scheduler does not look at it.
pub const DEFAULT_PRIORITY: u32 = 10;
/// Timer ticks a process may run before it is preempted.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// IF set, reserved bit 1 set.
pub const INITIAL_EFLAGS: u32 = 0x202;
