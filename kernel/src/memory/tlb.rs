//! Translation cache and page-directory register access.

use x86_64::{PhysAddr, VirtAddr};

/// The two hardware operations the VMM needs from the MMU.
pub trait Mmu {
    /// Load a page directory (CR3). Flushes every non-global translation.
    fn load_directory(&mut self, directory: PhysAddr);

    /// Drop the cached translation for one page.
    fn invalidate(&mut self, vaddr: VirtAddr);
}

/// The real MMU. Inert unless running on bare-metal 32-bit x86.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareMmu;

impl Mmu for HardwareMmu {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn load_directory(&mut self, directory: PhysAddr) {
        let cr3 = directory.as_u64() as u32;
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn load_directory(&mut self, _directory: PhysAddr) {}

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn invalidate(&mut self, vaddr: VirtAddr) {
        let vaddr = vaddr.as_u64() as u32;
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
        }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn invalidate(&mut self, _vaddr: VirtAddr) {}
}
