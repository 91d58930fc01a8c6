//! Interrupt Descriptor Table configuration.

/// Vector number assigned to the timer interrupt (IRQ0 after PIC remap).
pub const TIMER_VECTOR: u8 = 32;
pub const SYSCALL_HANDLER: u8 = 0x80;
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Timer frequency in Hertz.
pub const TIMER_FREQUENCY: u32 = 100;
