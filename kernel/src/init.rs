use x86_64::VirtAddr;

use crate::{
    interrupts,
    logging,
    memory::{
        frame_allocator::{BitmapFrameAllocator, FRAME_ALLOCATOR},
        heap,
        paging::{Vmm, VMM},
        tlb::{HardwareMmu, Mmu},
        KernelLayout, MemoryRegion,
    },
    processes::{ProcessError, ProcessManager, PROCESS_MANAGER},
};

/// The three managers `init` installs as kernel globals.
pub struct KernelCore<M: Mmu> {
    pub frames: BitmapFrameAllocator,
    pub vmm: Vmm<M>,
    pub manager: ProcessManager,
}

/// Builds frames, kernel address space and process table, leaf to root.
///
/// # Safety
/// `phys_offset` must be the kernel's window onto all of physical memory
/// described by `regions`.
pub unsafe fn build_core<M: Mmu>(
    regions: &[MemoryRegion],
    phys_offset: VirtAddr,
    layout: KernelLayout,
    mmu: M,
) -> Result<KernelCore<M>, ProcessError> {
    let mut frames = BitmapFrameAllocator::from_memory_map(regions, layout.reserved_physical());
    log::info!(
        "{} of {} frames free",
        frames.free_frames(),
        frames.total_frames()
    );

    let vmm = Vmm::init(layout, phys_offset, &mut frames, mmu)?;
    let manager = ProcessManager::new(&vmm)?;
    Ok(KernelCore {
        frames,
        vmm,
        manager,
    })
}

/// Brings the resource core up: logger, heap, then [`build_core`].
/// Interrupts stay masked until every global is in place. The caller
/// then continues as the bootstrap process, usually in
/// [`idle_loop`](crate::idle_loop).
///
/// # Safety
/// `layout`'s heap arena must be identity-mapped (or paging still off) and
/// unused, and `phys_offset` must be the kernel's window onto all of
/// physical memory described by `regions`.
pub unsafe fn init(
    regions: &[MemoryRegion],
    phys_offset: VirtAddr,
    layout: KernelLayout,
) -> Result<(), ProcessError> {
    if logging::init().is_err() {
        log::warn!("logger already installed");
    }
    log::info!("Booting kernel core...");

    interrupts::disable();

    heap::init_heap(&layout)?;

    let core = build_core(regions, phys_offset, layout, HardwareMmu)?;

    *FRAME_ALLOCATOR.lock() = Some(core.frames);
    *VMM.lock() = Some(core.vmm);
    *PROCESS_MANAGER.lock() = Some(core.manager);

    log::info!("Kernel core initialized");
    interrupts::enable();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::memory::FRAME_SIZE,
        memory::{
            test_support::PhysicalMemory, tlb::recording::RecordingMmu, MemoryError,
            MemoryRegionKind,
        },
        processes::ProcessState,
    };

    const LAYOUT: KernelLayout = KernelLayout {
        kernel_start: 0,
        heap_start: 0x8000,
        heap_size: 0x8000,
        user_stack_top: 0xC000_0000,
    };

    #[test]
    fn test_core_comes_up_from_memory_map() {
        let memory = PhysicalMemory::new(128);
        let regions = [MemoryRegion::new(
            0,
            (memory.frames() * FRAME_SIZE) as u64,
            MemoryRegionKind::Usable,
        )];

        let core = unsafe { build_core(&regions, memory.offset(), LAYOUT, RecordingMmu::default()) }
            .expect("core");

        assert_eq!(core.frames.total_frames(), memory.frames());
        // 16 reserved frames plus the kernel directory and its shared table
        assert_eq!(core.frames.used_frames(), 16 + 2);

        let kernel = core.vmm.kernel_space();
        let (phys, _) = core.vmm.translate(kernel, VirtAddr::new(0x8000)).expect("heap");
        assert_eq!(phys.as_u64(), 0x8000);
        assert_eq!(
            core.vmm.translate(kernel, VirtAddr::new(0x10_0000)),
            Err(MemoryError::NotMapped)
        );

        assert_eq!(core.manager.len(), 1);
        assert_eq!(core.manager.current(), 1);
        assert_eq!(core.manager.state(1), Some(ProcessState::Running));
    }

    #[test]
    fn test_core_needs_memory_for_the_kernel_directory() {
        let memory = PhysicalMemory::new(16);
        let regions = [MemoryRegion::new(
            0,
            (memory.frames() * FRAME_SIZE) as u64,
            MemoryRegionKind::Usable,
        )];

        let result = unsafe { build_core(&regions, memory.offset(), LAYOUT, RecordingMmu::default()) };
        assert!(matches!(
            result,
            Err(ProcessError::Memory(MemoryError::OutOfMemory))
        ));
    }
}
