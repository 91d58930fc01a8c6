//! The Kernel Heap
//!
//! A first-fit allocator over one pre-mapped arena. Every block starts with
//! a `BlockHeader`; the headers form a doubly linked list in address order
//! that covers the arena exactly. Freed blocks are coalesced with free
//! neighbours immediately, so two adjacent free blocks never exist.

use core::{
    alloc::{GlobalAlloc, Layout},
    mem::size_of,
    ptr::{self, NonNull},
};

use spin::Mutex;

use crate::{
    constants::memory::{HEAP_ALIGN, HEAP_MAGIC},
    interrupts::without_interrupts,
    memory::{KernelLayout, MemoryError},
};

#[repr(C, align(16))]
struct BlockHeader {
    /// Whole block, header included.
    size: usize,
    next: Option<NonNull<BlockHeader>>,
    prev: Option<NonNull<BlockHeader>>,
    magic: u32,
    free: bool,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Smallest block worth splitting off: a header and one granule.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + HEAP_ALIGN;

fn align_up(value: usize) -> Option<usize> {
    Some(value.checked_add(HEAP_ALIGN - 1)? & !(HEAP_ALIGN - 1))
}

/// Reference to a header inside the arena.
///
/// # Safety
/// `block` must point at a header of the arena the caller owns, and the
/// returned reference must not outlive the next access to the same header.
unsafe fn header<'a>(block: NonNull<BlockHeader>) -> &'a mut BlockHeader {
    &mut *block.as_ptr()
}

/// Snapshot of the block list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub arena_size: usize,
    /// Bytes in allocated blocks, headers included.
    pub used_bytes: usize,
    /// Bytes in free blocks, headers included.
    pub free_bytes: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    /// Payload capacity of the largest free block.
    pub largest_free: usize,
}

pub struct HeapAllocator {
    start: usize,
    size: usize,
    head: NonNull<BlockHeader>,
}

// The arena is only reached through the owning allocator.
unsafe impl Send for HeapAllocator {}

impl HeapAllocator {
    /// Installs one free block spanning `[start, start + size)`.
    ///
    /// # Safety
    /// The range must be mapped, writable and used by nothing else for as
    /// long as the allocator lives.
    pub unsafe fn init(start: usize, size: usize) -> Result<Self, MemoryError> {
        let aligned = align_up(start).ok_or(MemoryError::InvalidOperation)?;
        let size = size.saturating_sub(aligned - start) & !(HEAP_ALIGN - 1);
        if size < MIN_BLOCK_SIZE {
            return Err(MemoryError::InvalidOperation);
        }

        let head = NonNull::new(aligned as *mut BlockHeader).ok_or(MemoryError::InvalidOperation)?;
        head.as_ptr().write(BlockHeader {
            size,
            next: None,
            prev: None,
            magic: HEAP_MAGIC,
            free: true,
        });

        Ok(HeapAllocator {
            start: aligned,
            size,
            head,
        })
    }

    pub fn arena(&self) -> (usize, usize) {
        (self.start, self.size)
    }

    fn blocks(&self) -> impl Iterator<Item = NonNull<BlockHeader>> + '_ {
        let mut cursor = Some(self.head);
        core::iter::from_fn(move || {
            let block = cursor?;
            cursor = unsafe { header(block) }.next;
            Some(block)
        })
    }

    /// First-fit allocation of `size` bytes, 16-byte aligned.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidOperation);
        }
        let needed = align_up(size)
            .and_then(|payload| payload.checked_add(HEADER_SIZE))
            .ok_or(MemoryError::OutOfMemory)?;

        let block = self
            .blocks()
            .find(|&block| {
                let block = unsafe { header(block) };
                block.free && block.size >= needed
            })
            .ok_or(MemoryError::OutOfMemory)?;

        unsafe {
            self.split(block, needed);
            let block = header(block);
            block.free = false;
            block.magic = HEAP_MAGIC;
        }
        Ok(Self::payload(block))
    }

    /// Zeroed allocation of `count * size` bytes.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let total = count.checked_mul(size).ok_or(MemoryError::OutOfMemory)?;
        let ptr = self.alloc(total)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Ok(ptr)
    }

    /// Returns an allocation to the heap.
    ///
    /// The pointer, guard and free flag are all checked before the list is
    /// touched, so a double or wild free leaves the heap as it was.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        let block = self.live_block(ptr)?;
        unsafe {
            header(block).free = true;
            self.coalesce(block);
        }
        Ok(())
    }

    /// Resizes an allocation, in place when the block or its free successor
    /// is large enough.
    pub fn realloc(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, MemoryError> {
        let block = self.live_block(ptr)?;
        if new_size == 0 {
            return Err(MemoryError::InvalidOperation);
        }
        let needed = align_up(new_size)
            .and_then(|payload| payload.checked_add(HEADER_SIZE))
            .ok_or(MemoryError::OutOfMemory)?;
        let current = unsafe { header(block) }.size;

        if needed <= current {
            unsafe {
                if let Some(tail) = self.split(block, needed) {
                    self.coalesce(tail);
                }
            }
            return Ok(ptr);
        }

        if let Some(next) = unsafe { header(block) }.next {
            let next = unsafe { header(next) };
            if next.free && current + next.size >= needed {
                unsafe {
                    self.absorb_next(block);
                    self.split(block, needed);
                }
                return Ok(ptr);
            }
        }

        let fresh = self.alloc(new_size)?;
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), current - HEADER_SIZE);
        }
        self.free(ptr)?;
        Ok(fresh)
    }

    /// Payload capacity of a live allocation.
    pub fn allocated_size(&self, ptr: NonNull<u8>) -> Result<usize, MemoryError> {
        let block = self.live_block(ptr)?;
        Ok(unsafe { header(block) }.size - HEADER_SIZE)
    }

    fn payload(block: NonNull<BlockHeader>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }

    /// Header of an allocated block, or `CorruptionDetected`.
    fn live_block(&self, ptr: NonNull<u8>) -> Result<NonNull<BlockHeader>, MemoryError> {
        let addr = ptr.as_ptr() as usize;
        let in_arena = addr >= self.start + HEADER_SIZE && addr < self.start + self.size;
        if !in_arena || (addr - self.start) % HEAP_ALIGN != 0 {
            log::error!("heap: pointer {:#x} is outside the arena", addr);
            return Err(MemoryError::CorruptionDetected);
        }

        let block = unsafe { NonNull::new_unchecked((addr - HEADER_SIZE) as *mut BlockHeader) };
        let current = unsafe { header(block) };
        if current.magic != HEAP_MAGIC {
            log::error!("heap: bad guard {:#x} at block {:#x}", current.magic, addr - HEADER_SIZE);
            return Err(MemoryError::CorruptionDetected);
        }
        if current.free {
            log::error!("heap: double free of {:#x}", addr);
            return Err(MemoryError::CorruptionDetected);
        }
        Ok(block)
    }

    /// Cuts `block` down to `needed` bytes when the rest can stand alone as
    /// a free block, and returns that new block.
    unsafe fn split(
        &mut self,
        block: NonNull<BlockHeader>,
        needed: usize,
    ) -> Option<NonNull<BlockHeader>> {
        let current = header(block);
        if current.size - needed < MIN_BLOCK_SIZE {
            return None;
        }

        let tail = NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(needed).cast::<BlockHeader>());
        tail.as_ptr().write(BlockHeader {
            size: current.size - needed,
            next: current.next,
            prev: Some(block),
            magic: HEAP_MAGIC,
            free: true,
        });
        if let Some(next) = current.next {
            header(next).prev = Some(tail);
        }
        current.next = Some(tail);
        current.size = needed;
        Some(tail)
    }

    /// Merges the successor of `block` into it and wipes its header.
    unsafe fn absorb_next(&mut self, block: NonNull<BlockHeader>) {
        let current = header(block);
        let Some(next) = current.next else {
            return;
        };
        let absorbed = header(next);
        current.size += absorbed.size;
        current.next = absorbed.next;
        if let Some(after) = absorbed.next {
            header(after).prev = Some(block);
        }
        absorbed.magic = 0;
        absorbed.next = None;
        absorbed.prev = None;
    }

    /// Merges a free block with free neighbours on both sides.
    unsafe fn coalesce(&mut self, block: NonNull<BlockHeader>) {
        if let Some(next) = header(block).next {
            if header(next).free {
                self.absorb_next(block);
            }
        }
        if let Some(prev) = header(block).prev {
            if header(prev).free {
                self.absorb_next(prev);
            }
        }
    }

    /// Walks the whole list and verifies every structural invariant.
    pub fn check_corruption(&self) -> Result<HeapStats, MemoryError> {
        let mut stats = HeapStats {
            arena_size: self.size,
            ..HeapStats::default()
        };
        let mut expected = self.start;
        let mut previous: Option<NonNull<BlockHeader>> = None;
        let mut previous_free = false;

        for block in self.blocks() {
            let addr = block.as_ptr() as usize;
            let current = unsafe { header(block) };
            let fault = if addr != expected {
                Some("block is not contiguous with its predecessor")
            } else if current.magic != HEAP_MAGIC {
                Some("bad guard")
            } else if current.prev != previous {
                Some("broken back link")
            } else if current.size < HEADER_SIZE
                || current.size % HEAP_ALIGN != 0
                || addr + current.size > self.start + self.size
            {
                Some("bad block size")
            } else if current.free && previous_free {
                Some("adjacent free blocks")
            } else {
                None
            };
            if let Some(fault) = fault {
                log::error!("heap: {} at {:#x}", fault, addr);
                return Err(MemoryError::CorruptionDetected);
            }

            stats.blocks += 1;
            if current.free {
                stats.free_blocks += 1;
                stats.free_bytes += current.size;
                stats.largest_free = stats.largest_free.max(current.size - HEADER_SIZE);
            } else {
                stats.used_bytes += current.size;
            }
            expected = addr + current.size;
            previous = Some(block);
            previous_free = current.free;
        }

        if expected != self.start + self.size {
            log::error!("heap: blocks cover {:#x} of {:#x} bytes", expected - self.start, self.size);
            return Err(MemoryError::CorruptionDetected);
        }
        Ok(stats)
    }

    /// Block statistics without verification.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_size: self.size,
            ..HeapStats::default()
        };
        for block in self.blocks() {
            let block = unsafe { header(block) };
            stats.blocks += 1;
            if block.free {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                stats.largest_free = stats.largest_free.max(block.size - HEADER_SIZE);
            } else {
                stats.used_bytes += block.size;
            }
        }
        stats
    }

    /// Logs every block at debug level.
    pub fn dump(&self) {
        log::debug!("heap arena {:#x}+{:#x}", self.start, self.size);
        for block in self.blocks() {
            let addr = block.as_ptr() as usize;
            let block = unsafe { header(block) };
            log::debug!(
                "  {:#x} size={:#x} {} magic={:#x}",
                addr,
                block.size,
                if block.free { "free" } else { "used" },
                block.magic
            );
        }
    }
}

/// `HeapAllocator` behind a spin lock, touched only with interrupts masked.
pub struct LockedHeap(Mutex<Option<HeapAllocator>>);

impl LockedHeap {
    pub const fn empty() -> Self {
        LockedHeap(Mutex::new(None))
    }

    /// # Safety
    /// Same contract as `HeapAllocator::init`.
    pub unsafe fn init(&self, start: usize, size: usize) -> Result<(), MemoryError> {
        let heap = HeapAllocator::init(start, size)?;
        without_interrupts(|| *self.0.lock() = Some(heap));
        Ok(())
    }

    pub fn with<F, R>(&self, f: F) -> Result<R, MemoryError>
    where
        F: FnOnce(&mut HeapAllocator) -> Result<R, MemoryError>,
    {
        without_interrupts(|| match self.0.lock().as_mut() {
            Some(heap) => f(heap),
            None => Err(MemoryError::InvalidOperation),
        })
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        self.with(|heap| heap.alloc(layout.size()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Err(error) = self.with(|heap| heap.free(ptr)) {
            panic!("kernel heap: {} while freeing {:p}", error, ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        let Some(ptr) = NonNull::new(ptr) else {
            return self.alloc(Layout::from_size_align_unchecked(new_size, layout.align()));
        };
        match self.with(|heap| heap.realloc(ptr, new_size)) {
            Ok(fresh) => fresh.as_ptr(),
            Err(MemoryError::CorruptionDetected) => {
                panic!("kernel heap: corruption while resizing {:p}", ptr)
            }
            Err(_) => ptr::null_mut(),
        }
    }
}

/// The kernel heap. Backs `alloc` on bare metal.
#[cfg_attr(all(target_os = "none", not(test)), global_allocator)]
pub static HEAP: LockedHeap = LockedHeap::empty();

/// Sets up the kernel heap over the layout's arena.
///
/// # Safety
/// The arena must be mapped (identity) and otherwise unused.
pub unsafe fn init_heap(layout: &KernelLayout) -> Result<(), MemoryError> {
    HEAP.init(layout.heap_start as usize, layout.heap_size as usize)?;
    log::info!(
        "kernel heap at {:#x}, {:#x} bytes",
        layout.heap_start,
        layout.heap_size
    );
    Ok(())
}

pub fn kmalloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
    HEAP.with(|heap| heap.alloc(size))
}

pub fn kcalloc(count: usize, size: usize) -> Result<NonNull<u8>, MemoryError> {
    HEAP.with(|heap| heap.calloc(count, size))
}

/// Frees a `kmalloc` allocation. Corruption is fatal; the block list is
/// logged first.
pub fn kfree(ptr: NonNull<u8>) {
    let result = HEAP.with(|heap| {
        let result = heap.free(ptr);
        if result.is_err() {
            heap.dump();
        }
        result
    });
    if let Err(error) = result {
        panic!("kernel heap: {} while freeing {:p}", error, ptr);
    }
}

pub fn krealloc(ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, MemoryError> {
    HEAP.with(|heap| heap.realloc(ptr, new_size))
}

pub fn heap_stats() -> Result<HeapStats, MemoryError> {
    HEAP.with(|heap| heap.check_corruption())
}
