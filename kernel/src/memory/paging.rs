//! Two-level 32-bit paging.
//!
//! A directory of 1024 entries, each covering 4 MiB through a table of 1024
//! leaf entries. Every table is reached through the kernel's physical
//! memory window (`phys_offset`), never through the address space it
//! describes.
//!
//! The first `KernelLayout::shared_directory_entries` directory slots belong
//! to the kernel. Their tables are allocated once in `Vmm::init` and every
//! new address space copies the slots, so kernel mappings made later are
//! visible everywhere.

use core::ops::{Index, IndexMut};

use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PageTableFlags, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::{ENTRY_COUNT, FRAME_SIZE, PAGE_SIZE},
    memory::{
        phys_to_virt,
        tlb::{HardwareMmu, Mmu},
        KernelLayout, MemoryError,
    },
};

/// Marks a table or leaf frame the address space allocated itself and
/// must give back on unmap or destroy.
pub const OWNED: PageTableFlags = PageTableFlags::BIT_9;

const FLAGS_MASK: u32 = 0xFFF;

/// Kernel-global VMM, installed by `init`.
pub static VMM: Mutex<Option<Vmm<HardwareMmu>>> = Mutex::new(None);

/// One 32-bit directory or table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn new() -> Self {
        PageTableEntry(0)
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(u64::from(self.0 & FLAGS_MASK))
    }

    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(u64::from(self.0 & !FLAGS_MASK))
    }

    /// The frame this entry points at, if present.
    pub fn frame(&self) -> Option<PhysFrame> {
        self.is_present()
            .then(|| PhysFrame::containing_address(self.addr()))
    }

    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        self.0 = (addr.as_u64() as u32 & !FLAGS_MASK) | (flags.bits() as u32 & FLAGS_MASK);
    }

    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.set(self.addr(), flags);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl Default for PageTableEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &self.addr())
            .field("flags", &self.flags())
            .finish()
    }
}

/// A page directory or a page table. Both have the same shape.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

fn directory_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u64() >> 22) & 0x3FF) as usize
}

fn table_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u64() >> 12) & 0x3FF) as usize
}

/// A set of translations rooted at one page directory frame.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    directory: PhysFrame,
}

impl AddressSpace {
    pub fn directory(&self) -> PhysFrame {
        self.directory
    }

    /// Value to load into CR3 for this space.
    pub fn cr3(&self) -> u32 {
        self.directory.start_address().as_u64() as u32
    }
}

/// Virtual memory manager.
pub struct Vmm<M: Mmu> {
    layout: KernelLayout,
    phys_offset: VirtAddr,
    kernel: AddressSpace,
    active: PhysFrame,
    mmu: M,
}

impl<M: Mmu> Vmm<M> {
    /// Builds and activates the kernel address space.
    ///
    /// Every table of the shared kernel region is allocated up front and
    /// `[kernel_start, heap_end)` is identity-mapped as global. Memory below
    /// the kernel image stays unmapped until the kernel maps it explicitly.
    pub fn init<F>(
        layout: KernelLayout,
        phys_offset: VirtAddr,
        frames: &mut F,
        mmu: M,
    ) -> Result<Self, MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let directory = zeroed_frame(phys_offset, frames)?;
        let mut vmm = Vmm {
            layout,
            phys_offset,
            kernel: AddressSpace { directory },
            active: directory,
            mmu,
        };

        for slot in 0..layout.shared_directory_entries() {
            let table = zeroed_frame(phys_offset, frames)?;
            vmm.table_mut(directory)[slot].set(
                table.start_address(),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | OWNED,
            );
        }

        let kernel = vmm.kernel_ref();
        let identity = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;
        for addr in (layout.kernel_start..layout.heap_end()).step_by(PAGE_SIZE as usize) {
            let vaddr = VirtAddr::new(u64::from(addr));
            let table = vmm.page_table(&kernel, vaddr, false, frames)?;
            vmm.table_mut(table)[table_index(vaddr)].set(PhysAddr::new(u64::from(addr)), identity);
        }

        vmm.mmu.load_directory(directory.start_address());
        log::info!(
            "kernel address space at {:#x}, {} shared directory entries",
            directory.start_address().as_u64(),
            layout.shared_directory_entries()
        );
        Ok(vmm)
    }

    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    pub fn phys_offset(&self) -> VirtAddr {
        self.phys_offset
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    /// Directory frame currently loaded in CR3.
    pub fn active(&self) -> PhysFrame {
        self.active
    }

    pub fn is_active(&self, space: &AddressSpace) -> bool {
        space.directory == self.active
    }

    fn kernel_ref(&self) -> AddressSpace {
        AddressSpace {
            directory: self.kernel.directory,
        }
    }

    fn is_shared(&self, vaddr: VirtAddr) -> bool {
        directory_index(vaddr) < self.layout.shared_directory_entries()
    }

    /// The shared region's tables belong to the kernel space; a process
    /// space only borrows its directory entries.
    fn check_private(&self, space: &AddressSpace, vaddr: VirtAddr) -> Result<(), MemoryError> {
        if space.directory != self.kernel.directory && self.is_shared(vaddr) {
            return Err(MemoryError::InvalidOperation);
        }
        Ok(())
    }

    fn table_mut(&mut self, frame: PhysFrame) -> &mut PageTable {
        let virt = phys_to_virt(self.phys_offset, frame.start_address());
        // SAFETY: table frames are owned by the VMM and only reached through
        // the physical window while the VMM is borrowed.
        unsafe { &mut *virt.as_mut_ptr::<PageTable>() }
    }

    fn table(&self, frame: PhysFrame) -> &PageTable {
        let virt = phys_to_virt(self.phys_offset, frame.start_address());
        // SAFETY: see `table_mut`.
        unsafe { &*virt.as_ptr::<PageTable>() }
    }

    /// New address space sharing the kernel region.
    pub fn create_address_space<F>(&mut self, frames: &mut F) -> Result<AddressSpace, MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let directory = zeroed_frame(self.phys_offset, frames)?;
        let kernel_directory = self.kernel.directory;
        for slot in 0..self.layout.shared_directory_entries() {
            let entry = self.table(kernel_directory)[slot];
            self.table_mut(directory)[slot] = entry;
        }
        Ok(AddressSpace { directory })
    }

    /// Frees every frame the space owns outside the shared kernel region,
    /// then its directory.
    pub fn destroy_address_space<F>(
        &mut self,
        space: &AddressSpace,
        frames: &mut F,
    ) -> Result<(), MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        if space.directory == self.kernel.directory || self.is_active(space) {
            return Err(MemoryError::InvalidOperation);
        }

        for slot in self.layout.shared_directory_entries()..ENTRY_COUNT {
            let pde = self.table(space.directory)[slot];
            let Some(table) = pde.frame() else {
                continue;
            };
            for pte in self.table(table).iter() {
                if pte.is_present() && pte.flags().contains(OWNED) {
                    if let Some(frame) = pte.frame() {
                        unsafe { frames.deallocate_frame(frame) };
                    }
                }
            }
            if pde.flags().contains(OWNED) {
                unsafe { frames.deallocate_frame(table) };
            }
        }

        unsafe { frames.deallocate_frame(space.directory) };
        Ok(())
    }

    /// Finds the page table covering `vaddr`, allocating it when `create`
    /// is set. Returns `NotMapped` when it is absent and not created.
    pub fn page_table<F>(
        &mut self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        create: bool,
        frames: &mut F,
    ) -> Result<PhysFrame, MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let slot = directory_index(vaddr);
        if let Some(table) = self.table(space.directory)[slot].frame() {
            return Ok(table);
        }
        if !create {
            return Err(MemoryError::NotMapped);
        }

        let table = zeroed_frame(self.phys_offset, frames)?;
        self.table_mut(space.directory)[slot].set(
            table.start_address(),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | OWNED,
        );
        Ok(table)
    }

    /// Maps `vaddr` to `paddr`. A present mapping is never overwritten;
    /// use `remap` for that.
    pub fn map<F>(
        &mut self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageTableFlags,
        frames: &mut F,
    ) -> Result<(), MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        self.write_leaf(space, vaddr, paddr, (flags & !OWNED) | PageTableFlags::PRESENT, frames)
    }

    fn write_leaf<F>(
        &mut self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageTableFlags,
        frames: &mut F,
    ) -> Result<(), MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        self.check_private(space, vaddr)?;
        let table = self.page_table(space, vaddr, true, frames)?;
        let entry = &mut self.table_mut(table)[table_index(vaddr)];
        if entry.is_present() {
            return Err(MemoryError::AlreadyMapped);
        }
        entry.set(paddr, flags);
        self.grant_user(space, vaddr, flags);
        Ok(())
    }

    /// A user leaf needs a user-accessible directory entry too.
    fn grant_user(&mut self, space: &AddressSpace, vaddr: VirtAddr, flags: PageTableFlags) {
        if !flags.contains(PageTableFlags::USER_ACCESSIBLE) {
            return;
        }
        let pde = &mut self.table_mut(space.directory)[directory_index(vaddr)];
        let pde_flags = pde.flags();
        if !pde_flags.contains(PageTableFlags::USER_ACCESSIBLE) {
            pde.set_flags(pde_flags | PageTableFlags::USER_ACCESSIBLE);
        }
    }

    /// Overwrites the translation for `vaddr`, returning the previous
    /// physical address if one was mapped. A previous frame the space owned
    /// goes back to the allocator.
    pub fn remap<F>(
        &mut self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageTableFlags,
        frames: &mut F,
    ) -> Result<Option<PhysAddr>, MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        self.check_private(space, vaddr)?;
        let flags = (flags & !OWNED) | PageTableFlags::PRESENT;
        let table = self.page_table(space, vaddr, true, frames)?;
        let entry = &mut self.table_mut(table)[table_index(vaddr)];
        let previous = *entry;
        entry.set(paddr, flags);
        self.grant_user(space, vaddr, flags);

        let Some(old_frame) = previous.frame() else {
            return Ok(None);
        };
        if previous.flags().contains(OWNED) {
            unsafe { frames.deallocate_frame(old_frame) };
        }
        self.flush_if_visible(space, vaddr, previous.flags());
        Ok(Some(previous.addr()))
    }

    /// Backs `vaddr` with a fresh zeroed frame owned by the space.
    pub fn allocate_page<F>(
        &mut self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        flags: PageTableFlags,
        frames: &mut F,
    ) -> Result<PhysFrame, MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let frame = zeroed_frame(self.phys_offset, frames)?;
        let flags = flags | PageTableFlags::PRESENT | OWNED;
        if let Err(error) = self.write_leaf(space, vaddr, frame.start_address(), flags, frames) {
            unsafe { frames.deallocate_frame(frame) };
            return Err(error);
        }
        Ok(frame)
    }

    /// Clears the translation for `vaddr`. Unmapping an absent page is a
    /// no-op and returns `None`, and so is unmapping a kernel-region page
    /// through a process space.
    pub fn unmap<F>(
        &mut self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        frames: &mut F,
    ) -> Option<PhysFrame>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        if self.check_private(space, vaddr).is_err() {
            log::warn!("refusing to unmap shared kernel page {:#x}", vaddr.as_u64());
            return None;
        }
        let table = self.page_table(space, vaddr, false, frames).ok()?;
        let entry = &mut self.table_mut(table)[table_index(vaddr)];
        let previous = *entry;
        let frame = previous.frame()?;
        entry.clear();

        if previous.flags().contains(OWNED) {
            unsafe { frames.deallocate_frame(frame) };
        }
        self.flush_if_visible(space, vaddr, previous.flags());
        Some(frame)
    }

    fn flush_if_visible(&mut self, space: &AddressSpace, vaddr: VirtAddr, flags: PageTableFlags) {
        if self.is_active(space) || self.is_shared(vaddr) || flags.contains(PageTableFlags::GLOBAL)
        {
            self.mmu.invalidate(vaddr.align_down(u64::from(PAGE_SIZE)));
        }
    }

    /// Walks both levels; returns the physical address of `vaddr` (page
    /// offset included) and the leaf flags.
    pub fn translate(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
    ) -> Result<(PhysAddr, PageTableFlags), MemoryError> {
        let table = self.table(space.directory)[directory_index(vaddr)]
            .frame()
            .ok_or(MemoryError::NotMapped)?;
        let entry = self.table(table)[table_index(vaddr)];
        if !entry.is_present() {
            return Err(MemoryError::NotMapped);
        }
        let offset = vaddr.as_u64() & u64::from(PAGE_SIZE - 1);
        Ok((entry.addr() + offset, entry.flags()))
    }

    /// Loads `space` into CR3. Non-global translations are flushed by the
    /// reload itself.
    pub fn switch_address_space(&mut self, space: &AddressSpace) {
        self.load(space.directory);
    }

    pub fn switch_to_kernel(&mut self) {
        self.load(self.kernel.directory);
    }

    fn load(&mut self, directory: PhysFrame) {
        self.mmu.load_directory(directory.start_address());
        self.active = directory;
    }

    /// Global translations survive a CR3 reload and must be dropped here.
    pub fn invalidate_global(&mut self, vaddr: VirtAddr) {
        self.mmu.invalidate(vaddr.align_down(u64::from(PAGE_SIZE)));
    }

    #[cfg(test)]
    pub(crate) fn mmu(&self) -> &M {
        &self.mmu
    }
}

fn zeroed_frame<F>(phys_offset: VirtAddr, frames: &mut F) -> Result<PhysFrame, MemoryError>
where
    F: FrameAllocator<Size4KiB>,
{
    let frame = frames.allocate_frame().ok_or(MemoryError::OutOfMemory)?;
    let virt = phys_to_virt(phys_offset, frame.start_address());
    unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, FRAME_SIZE) };
    Ok(frame)
}
