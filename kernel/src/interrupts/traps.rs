//! Timer, system call and page fault entry into the core.
//!
//! The assembly stubs only save registers and hand a `TrapFrame` over. Every
//! decision is made by the portable handlers below, which run the same way
//! on bare metal and under `cargo test`.

use x86_64::{
    structures::{
        idt::PageFaultErrorCode,
        paging::{FrameAllocator, FrameDeallocator, Size4KiB},
    },
    VirtAddr,
};

use crate::{
    constants::idt::{PAGE_FAULT_VECTOR, SYSCALL_HANDLER, TIMER_VECTOR},
    events::{InterruptEvents, INTERRUPT_EVENTS},
    interrupts::without_interrupts,
    memory::{
        frame_allocator::{BitmapFrameAllocator, FRAME_ALLOCATOR},
        paging::{Vmm, VMM},
        tlb::{HardwareMmu, Mmu},
    },
    processes::{Context, Pid, ProcessManager, PROCESS_MANAGER},
    syscalls::{dispatch, SyscallRequest},
};

/// Where a trap resumes: the chosen process and the top of its kernel
/// stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resume {
    pub pid: Pid,
    pub kernel_stack_top: u32,
}

/// An IDT gate the boot glue installs for the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapGate {
    pub vector: u8,
    /// Entry stub symbol.
    pub symbol: &'static str,
    /// Gate DPL 3, so ring 3 may raise it with `int`.
    pub user_callable: bool,
}

pub const TRAP_GATES: [TrapGate; 3] = [
    TrapGate {
        vector: PAGE_FAULT_VECTOR,
        symbol: "kyro_page_fault_entry",
        user_callable: false,
    },
    TrapGate {
        vector: TIMER_VECTOR,
        symbol: "kyro_timer_entry",
        user_callable: false,
    },
    TrapGate {
        vector: SYSCALL_HANDLER,
        symbol: "kyro_syscall_entry",
        user_callable: true,
    },
];

/// Timer tick against explicit state. Returns the process to resume.
pub fn on_timer<M, F>(
    events: &InterruptEvents,
    context: &mut Context,
    manager: &mut ProcessManager,
    vmm: &mut Vmm<M>,
    frames: &mut F,
) -> Pid
where
    M: Mmu,
    F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    events.record_tick();
    manager.handle_events(events, context, vmm, frames)
}

/// `int 0x80` against explicit state. Returns the process to resume.
pub fn on_syscall<M, F>(
    events: &InterruptEvents,
    context: &mut Context,
    manager: &mut ProcessManager,
    vmm: &mut Vmm<M>,
    frames: &mut F,
) -> Pid
where
    M: Mmu,
    F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    let request = SyscallRequest::from_context(context);
    dispatch(request, context, manager, vmm, frames);
    // wake-ups posted since the last tick take effect here too
    manager.handle_events(events, context, vmm, frames)
}

/// Runs `f` on the kernel-global managers, locked in the kernel's lock
/// order. `None` until `init` has installed all three.
fn with_kernel<R>(
    f: impl FnOnce(&mut ProcessManager, &mut Vmm<HardwareMmu>, &mut BitmapFrameAllocator) -> R,
) -> Option<R> {
    without_interrupts(|| {
        let mut manager = PROCESS_MANAGER.lock();
        let mut vmm = VMM.lock();
        let mut frames = FRAME_ALLOCATOR.lock();
        match (manager.as_mut(), vmm.as_mut(), frames.as_mut()) {
            (Some(manager), Some(vmm), Some(frames)) => Some(f(manager, vmm, frames)),
            _ => None,
        }
    })
}

fn resume_point(manager: &ProcessManager, pid: Pid) -> Resume {
    Resume {
        pid,
        kernel_stack_top: manager
            .process(pid)
            .map_or(0, |process| process.kernel_stack().top()),
    }
}

/// Timer interrupt on the global kernel state.
pub fn timer_interrupt(context: &mut Context) -> Option<Resume> {
    with_kernel(|manager, vmm, frames| {
        let pid = on_timer(&INTERRUPT_EVENTS, context, manager, vmm, frames);
        resume_point(manager, pid)
    })
}

/// System call on the global kernel state.
pub fn syscall_interrupt(context: &mut Context) -> Option<Resume> {
    with_kernel(|manager, vmm, frames| {
        let pid = on_syscall(&INTERRUPT_EVENTS, context, manager, vmm, frames);
        resume_point(manager, pid)
    })
}

/// Page faults are fatal: there is no demand paging to fall back on.
pub fn page_fault(vaddr: VirtAddr, error_code: PageFaultErrorCode) -> ! {
    let pid = PROCESS_MANAGER
        .try_lock()
        .and_then(|manager| manager.as_ref().map(|manager| manager.current()));
    log::error!(
        "page fault at {:#x} ({:?}) in process {:?}",
        vaddr.as_u64(),
        error_code,
        pid
    );
    panic!("page fault at {:#x}", vaddr.as_u64());
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod entry {
    use core::ptr;

    use super::{page_fault, syscall_interrupt, timer_interrupt, Resume};
    use crate::processes::{Context, TrapFrame};
    use x86_64::{structures::idt::PageFaultErrorCode, VirtAddr};

    extern "C" {
        /// Boot glue: points the TSS ring 0 stack at `top`.
        fn kyro_set_kernel_stack(top: u32);
        /// Boot glue: acknowledges the timer IRQ at the interrupt controller.
        fn kyro_end_of_interrupt();
    }

    // Each stub leaves a `TrapFrame` on the stack, passes its address and
    // resumes from whatever frame address the handler returns.
    core::arch::global_asm!(
        ".global kyro_timer_entry",
        "kyro_timer_entry:",
        "pushad",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "push esp",
        "call kyro_timer_trap",
        "mov esp, eax",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popad",
        "iretd",
        "",
        ".global kyro_syscall_entry",
        "kyro_syscall_entry:",
        "pushad",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "push esp",
        "call kyro_syscall_trap",
        "mov esp, eax",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popad",
        "iretd",
        "",
        ".global kyro_page_fault_entry",
        "kyro_page_fault_entry:",
        "mov eax, [esp]",
        "push eax",
        "mov eax, cr2",
        "push eax",
        "call kyro_page_fault_trap",
    );

    fn cr3() -> u32 {
        let value: u32;
        unsafe { core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack)) };
        value
    }

    /// Writes the chosen context where `iretd` will find it.
    ///
    /// A ring 3 context goes at the top of its own kernel stack; a ring 0
    /// context goes just below the stack pointer it is resumed with.
    unsafe fn place(context: &Context, resume: Resume) -> *mut TrapFrame {
        let frame_addr = if context.is_user() {
            kyro_set_kernel_stack(resume.kernel_stack_top);
            resume.kernel_stack_top - TrapFrame::FULL_LEN as u32
        } else {
            context.esp - TrapFrame::SHORT_LEN as u32
        };
        let frame = context.to_frame();
        let target = frame_addr as *mut u8;
        ptr::copy(
            (&frame as *const TrapFrame).cast::<u8>(),
            target,
            context.frame_len(),
        );
        target.cast()
    }

    unsafe fn handle(
        frame: *mut TrapFrame,
        handler: fn(&mut Context) -> Option<Resume>,
    ) -> *mut TrapFrame {
        let mut context = Context::capture(&*frame, frame as u32, cr3());
        match handler(&mut context) {
            Some(resume) => place(&context, resume),
            None => frame,
        }
    }

    #[no_mangle]
    unsafe extern "C" fn kyro_timer_trap(frame: *mut TrapFrame) -> *mut TrapFrame {
        kyro_end_of_interrupt();
        handle(frame, timer_interrupt)
    }

    #[no_mangle]
    unsafe extern "C" fn kyro_syscall_trap(frame: *mut TrapFrame) -> *mut TrapFrame {
        handle(frame, syscall_interrupt)
    }

    #[no_mangle]
    extern "C" fn kyro_page_fault_trap(cr2: u32, error_code: u32) -> ! {
        page_fault(
            VirtAddr::new(u64::from(cr2)),
            PageFaultErrorCode::from_bits_truncate(u64::from(error_code)),
        )
    }
}
