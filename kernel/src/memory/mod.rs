//! Physical frames, address spaces and the kernel heap.

pub mod frame_allocator;
pub mod heap;
pub mod paging;
pub mod tlb;

use crate::constants::memory::{
    KERNEL_HEAP_SIZE, KERNEL_HEAP_START, KERNEL_START, REGION_SIZE, USER_STACK_TOP,
};
use x86_64::{PhysAddr, VirtAddr};

/// Failures of the memory subsystems.
///
/// Only `CorruptionDetected` is unrecoverable; callers that see it must
/// report and halt instead of touching the heap again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfMemory,
    CorruptionDetected,
    NotMapped,
    AlreadyMapped,
    InvalidOperation,
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "Out of memory"),
            MemoryError::CorruptionDetected => write!(f, "Heap corruption detected"),
            MemoryError::NotMapped => write!(f, "Address not mapped"),
            MemoryError::AlreadyMapped => write!(f, "Page already mapped"),
            MemoryError::InvalidOperation => write!(f, "Invalid memory operation"),
        }
    }
}

/// Type of a boot memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Bad,
}

/// One entry of the memory map handed over by the boot glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        MemoryRegion { base, length, kind }
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Fixed virtual layout shared by the VMM and the process manager.
///
/// `[kernel_start, heap_end)` is identity-mapped in the kernel address space.
/// The directory slots covering `[0, heap_end)` are shared, entry for entry,
/// by every process and only the kernel space may change them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLayout {
    pub kernel_start: u32,
    pub heap_start: u32,
    pub heap_size: u32,
    pub user_stack_top: u32,
}

impl KernelLayout {
    pub const DEFAULT: KernelLayout = KernelLayout {
        kernel_start: KERNEL_START,
        heap_start: KERNEL_HEAP_START,
        heap_size: KERNEL_HEAP_SIZE,
        user_stack_top: USER_STACK_TOP,
    };

    pub fn heap_end(&self) -> u32 {
        self.heap_start + self.heap_size
    }

    /// Number of leading directory entries that belong to the kernel.
    pub fn shared_directory_entries(&self) -> usize {
        self.heap_end().div_ceil(REGION_SIZE) as usize
    }

    /// Physical range that must never be handed out by the frame allocator.
    pub fn reserved_physical(&self) -> (PhysAddr, PhysAddr) {
        (
            PhysAddr::new(u64::from(self.kernel_start)),
            PhysAddr::new(u64::from(self.heap_end())),
        )
    }
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Translates a physical address into the kernel's window onto physical
/// memory (identity plus a constant offset).
pub fn phys_to_virt(phys_offset: VirtAddr, phys: PhysAddr) -> VirtAddr {
    phys_offset + phys.as_u64()
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Simulated physical memory for host tests.
    //!
    //! The buffer's address is used as the physical-memory offset, so frame
    //! `n` lives at `buffer + n * 4096` exactly as it would behind the
    //! kernel's physical window.

    extern crate std;

    use super::frame_allocator::BitmapFrameAllocator;
    use crate::constants::memory::FRAME_SIZE;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use x86_64::VirtAddr;

    pub struct PhysicalMemory {
        base: *mut u8,
        layout: Layout,
        frames: usize,
    }

    impl PhysicalMemory {
        pub fn new(frames: usize) -> Self {
            let layout = Layout::from_size_align(frames * FRAME_SIZE, FRAME_SIZE)
                .expect("bad simulated memory layout");
            let base = unsafe { alloc_zeroed(layout) };
            assert!(!base.is_null(), "host allocation failed");
            PhysicalMemory {
                base,
                layout,
                frames,
            }
        }

        pub fn offset(&self) -> VirtAddr {
            VirtAddr::from_ptr(self.base)
        }

        pub fn frames(&self) -> usize {
            self.frames
        }

        /// A frame allocator covering exactly this memory, with the first
        /// `reserved` frames already taken.
        pub fn allocator(&self, reserved: usize) -> BitmapFrameAllocator {
            let mut frames = BitmapFrameAllocator::new(self.frames);
            for index in 0..reserved {
                frames.mark_used(index);
            }
            frames
        }
    }

    impl Drop for PhysicalMemory {
        fn drop(&mut self) {
            unsafe { dealloc(self.base, self.layout) };
        }
    }

    /// A 16-byte aligned byte arena for heap tests.
    pub struct Arena {
        base: *mut u8,
        layout: Layout,
    }

    impl Arena {
        pub fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 4096).expect("bad arena layout");
            let base = unsafe { alloc_zeroed(layout) };
            assert!(!base.is_null(), "host allocation failed");
            Arena { base, layout }
        }

        pub fn start(&self) -> usize {
            self.base as usize
        }

        pub fn size(&self) -> usize {
            self.layout.size()
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            unsafe { dealloc(self.base, self.layout) };
        }
    }
}
