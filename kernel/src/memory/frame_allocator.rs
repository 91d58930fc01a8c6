//! Bitmap physical frame allocator.
//!
//! - One bit per 4 KiB frame, set = used
//! - Lowest-index-first allocation, so results are deterministic
//! - The kernel-global instance is only touched with interrupts masked

use crate::{
    constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, PHYSICAL_LIMIT},
    interrupts::without_interrupts,
    memory::{MemoryError, MemoryRegion, MemoryRegionKind},
};
use alloc::{boxed::Box, vec};
use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Clips `[base, end)` to the 32-bit physical address space.
fn clamp_to_physical_limit(base: u64, end: u64) -> Option<(u64, u64)> {
    let end = end.min(PHYSICAL_LIMIT);
    (base < end).then_some((base, end))
}

/// Global frame allocator that makes it so we just have one actual allocator throughout codebase
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

pub struct BitmapFrameAllocator {
    total_frames: usize,
    free_frames: usize,
    bitmap: Box<[u64]>,
}

impl BitmapFrameAllocator {
    /// Creates an allocator for `total_frames` frames, all free.
    pub fn new(total_frames: usize) -> Self {
        let bitmap_size = total_frames.div_ceil(BITMAP_ENTRY_SIZE);
        let mut allocator = Self {
            total_frames,
            free_frames: total_frames,
            bitmap: vec![0; bitmap_size].into_boxed_slice(),
        };
        allocator.seal_tail();
        allocator
    }

    /// Builds the allocator from the boot memory map.
    ///
    /// Everything starts used; usable regions are released, then the
    /// `reserved` physical range (kernel image and heap arena) is taken again.
    /// Memory at or above 4 GiB cannot be addressed by 32-bit page tables
    /// and is left out.
    pub fn from_memory_map(regions: &[MemoryRegion], reserved: (PhysAddr, PhysAddr)) -> Self {
        let usable = || {
            regions
                .iter()
                .filter(|region| region.kind == MemoryRegionKind::Usable)
                .filter_map(|region| clamp_to_physical_limit(region.base, region.end()))
        };

        // get the total number of frames (top of usable memory)
        let true_end = usable().map(|(_, end)| end).max().unwrap_or(0);

        let total_frames = (true_end / FRAME_SIZE as u64) as usize;
        let bitmap_size = total_frames.div_ceil(BITMAP_ENTRY_SIZE);

        log::debug!(
            "top of physical memory {:#x}, {} frames, {} bitmap words",
            true_end,
            total_frames,
            bitmap_size
        );

        let mut allocator = Self {
            total_frames,
            free_frames: 0,
            bitmap: vec![FULL_BITMAP_ENTRY; bitmap_size].into_boxed_slice(),
        };

        for (base, end) in usable() {
            allocator.free_region(base, end);
        }

        if let Some((start, end)) = clamp_to_physical_limit(reserved.0.as_u64(), reserved.1.as_u64()) {
            let first = (start / FRAME_SIZE as u64) as usize;
            let last = (end.div_ceil(FRAME_SIZE as u64) as usize).min(total_frames);
            for index in first..last {
                allocator.mark_used(index);
            }
        }

        allocator
    }

    /// Mark the whole frames inside [base, end) as free.
    fn free_region(&mut self, base: u64, end: u64) {
        let start_frame = base.div_ceil(FRAME_SIZE as u64) as usize;
        let end_frame = ((end / FRAME_SIZE as u64) as usize).min(self.total_frames);
        for frame_index in start_frame..end_frame {
            if self.is_bit_set(frame_index) {
                self.clear_bit(frame_index);
            }
        }
    }

    /// Bits past `total_frames` in the last word stay set so scans skip them.
    fn seal_tail(&mut self) {
        let used_bits = self.total_frames % BITMAP_ENTRY_SIZE;
        if used_bits != 0 {
            if let Some(last) = self.bitmap.last_mut() {
                *last |= FULL_BITMAP_ENTRY << used_bits;
            }
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    pub fn total_memory(&self) -> usize {
        self.total_frames * FRAME_SIZE
    }

    pub fn used_memory(&self) -> usize {
        self.used_frames() * FRAME_SIZE
    }

    pub fn free_memory(&self) -> usize {
        self.free_frames * FRAME_SIZE
    }

    pub fn frame_index(frame: PhysFrame) -> usize {
        frame.start_address().as_u64() as usize / FRAME_SIZE
    }

    pub fn frame_at(index: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new((index * FRAME_SIZE) as u64))
    }

    /// Claims the lowest free frame.
    pub fn alloc_frame(&mut self) -> Result<PhysFrame, MemoryError> {
        let index = self.first_free_from(0).ok_or(MemoryError::OutOfMemory)?;
        self.set_bit(index);
        Ok(Self::frame_at(index))
    }

    /// Claims the lowest run of `count` consecutive free frames and returns
    /// the first one.
    pub fn alloc_contiguous(&mut self, count: usize) -> Result<PhysFrame, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidOperation);
        }

        let mut start = 0;
        while let Some(candidate) = self.first_free_from(start) {
            if candidate + count > self.total_frames {
                break;
            }
            match (candidate..candidate + count).find(|&index| self.is_bit_set(index)) {
                Some(used) => start = used + 1,
                None => {
                    for index in candidate..candidate + count {
                        self.set_bit(index);
                    }
                    return Ok(Self::frame_at(candidate));
                }
            }
        }

        Err(MemoryError::OutOfMemory)
    }

    /// Returns a frame to the pool.
    ///
    /// Freeing a frame that is already free (or does not exist) is a caller
    /// bug; it is reported and the bitmap is left untouched.
    pub fn free_frame(&mut self, frame: PhysFrame) -> Result<(), MemoryError> {
        let index = Self::frame_index(frame);
        if index >= self.total_frames || !self.is_bit_set(index) {
            log::warn!(
                "free of unallocated frame {:#x}",
                frame.start_address().as_u64()
            );
            return Err(MemoryError::InvalidOperation);
        }
        self.clear_bit(index);
        Ok(())
    }

    /// Check if frame is used. Frames past the end of memory count as used.
    pub fn is_allocated(&self, frame: PhysFrame) -> bool {
        let index = Self::frame_index(frame);
        index >= self.total_frames || self.is_bit_set(index)
    }

    /// Mark a specific frame index as used, if it is not already.
    pub fn mark_used(&mut self, frame_index: usize) {
        if frame_index < self.total_frames && !self.is_bit_set(frame_index) {
            self.set_bit(frame_index);
        }
    }

    /// Index of the first clear bit at or after `from`.
    fn first_free_from(&self, from: usize) -> Option<usize> {
        if from >= self.total_frames {
            return None;
        }
        let first_word = from / BITMAP_ENTRY_SIZE;
        for (word_index, &word) in self.bitmap.iter().enumerate().skip(first_word) {
            let mut word = word;
            if word_index == first_word {
                // pretend the bits below `from` are taken
                word |= !(FULL_BITMAP_ENTRY << (from % BITMAP_ENTRY_SIZE));
            }
            if word != FULL_BITMAP_ENTRY {
                let index = word_index * BITMAP_ENTRY_SIZE + word.trailing_ones() as usize;
                return (index < self.total_frames).then_some(index);
            }
        }
        None
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        self.bitmap[word_index] |= 1 << bit_index;
        self.free_frames -= 1;
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        self.bitmap[word_index] &= !(1 << bit_index);
        self.free_frames += 1;
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        (self.bitmap[word_index] & (1 << bit_index)) != 0
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_frame().ok()
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let _ = self.free_frame(frame);
    }
}

/// Exposed function to allocate a frame from the global allocator
pub fn alloc_frame() -> Result<PhysFrame, MemoryError> {
    with_frame_allocator(|allocator| allocator.alloc_frame())
}

/// Exposed function to return a frame to the global allocator
pub fn dealloc_frame(frame: PhysFrame<Size4KiB>) -> Result<(), MemoryError> {
    with_frame_allocator(|allocator| allocator.free_frame(frame))
}

/// Runs `f` on the global allocator with interrupts masked.
pub fn with_frame_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator) -> R,
{
    without_interrupts(|| {
        let mut guard = FRAME_ALLOCATOR.lock();
        match guard.as_mut() {
            Some(allocator) => f(allocator),
            None => panic!("Frame allocator does not exist."),
        }
    })
}
