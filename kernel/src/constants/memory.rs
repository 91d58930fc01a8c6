//! Physical and virtual memory layout.
//!
//! The VMM and the process manager both derive their view of the address
//! space from these values, so they must only ever be read from here.

pub const PAGE_SIZE: u32 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Entries in a page directory or a page table.
pub const ENTRY_COUNT: usize = 1024;
/// Bytes covered by one page directory entry.
pub const REGION_SIZE: u32 = PAGE_SIZE * ENTRY_COUNT as u32;

pub const KERNEL_START: u32 = 0x0010_0000;
pub const KERNEL_HEAP_START: u32 = 0x0040_0000;
pub const KERNEL_HEAP_SIZE: u32 = 0x0100_0000; // 16 MiB
pub const USER_SPACE_START: u32 = 0x4000_0000;
pub const USER_STACK_TOP: u32 = 0xC000_0000;

/// First physical address 32-bit page tables cannot reach.
pub const PHYSICAL_LIMIT: u64 = 1 << 32;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Guard stamped into every heap block header.
pub const HEAP_MAGIC: u32 = 0xDEAD_BEEF;
/// Allocation granularity of the kernel heap.
pub const HEAP_ALIGN: usize = 16;
