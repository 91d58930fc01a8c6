use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, Size4KiB};

use crate::{
    constants::syscalls::{
        SYSCALL_ERROR, SYSCALL_EXIT, SYSCALL_GETPID, SYSCALL_GETPPID, SYSCALL_SCHED_YIELD,
    },
    memory::{paging::Vmm, tlb::Mmu},
    processes::{Context, ProcessManager},
};

/// Register bundle handed over by `int 0x80`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRequest {
    pub number: u32,
    pub args: [u32; 5],
}

impl SyscallRequest {
    /// eax holds the call number, ebx, ecx, edx, esi, edi the arguments.
    pub fn from_context(context: &Context) -> Self {
        SyscallRequest {
            number: context.eax,
            args: [
                context.ebx,
                context.ecx,
                context.edx,
                context.esi,
                context.edi,
            ],
        }
    }
}

/// Runs one system call for the current process.
///
/// The result is stored in the caller's eax before any reschedule, so it
/// survives in the saved context even when another process is resumed.
pub fn dispatch<M, F>(
    request: SyscallRequest,
    context: &mut Context,
    manager: &mut ProcessManager,
    vmm: &mut Vmm<M>,
    frames: &mut F,
) -> u32
where
    M: Mmu,
    F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    match request.number {
        SYSCALL_EXIT => sys_exit(request.args[0] as i32, context, manager, vmm, frames),
        SYSCALL_GETPID => complete(context, manager.current()),
        SYSCALL_GETPPID => {
            let parent = manager
                .current_process()
                .and_then(|process| process.parent())
                .unwrap_or(0);
            complete(context, parent)
        }
        SYSCALL_SCHED_YIELD => {
            let result = complete(context, 0);
            manager.yield_now(context, vmm, frames);
            result
        }
        _ => {
            log::warn!(
                "Unknown syscall {} from process {}",
                request.number,
                manager.current()
            );
            complete(context, SYSCALL_ERROR)
        }
    }
}

fn complete(context: &mut Context, result: u32) -> u32 {
    context.eax = result;
    result
}

fn sys_exit<M, F>(
    code: i32,
    context: &mut Context,
    manager: &mut ProcessManager,
    vmm: &mut Vmm<M>,
    frames: &mut F,
) -> u32
where
    M: Mmu,
    F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    match manager.exit_current(code, context, vmm, frames) {
        // the caller is gone; eax now belongs to whoever was resumed
        Ok(_) => 0,
        Err(error) => {
            log::warn!("exit from process {} refused: {}", manager.current(), error);
            complete(context, SYSCALL_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processes::{test_support::Fixture, ProcessState};

    fn call(f: &mut Fixture, number: u32, first_arg: u32) -> u32 {
        f.context.eax = number;
        f.context.ebx = first_arg;
        let request = SyscallRequest::from_context(&f.context);
        dispatch(request, &mut f.context, &mut f.manager, &mut f.vmm, &mut f.frames)
    }

    #[test]
    fn test_request_reads_argument_registers() {
        let context = Context {
            eax: 20,
            ebx: 1,
            ecx: 2,
            edx: 3,
            esi: 4,
            edi: 5,
            ..Context::default()
        };
        let request = SyscallRequest::from_context(&context);
        assert_eq!(request.number, 20);
        assert_eq!(request.args, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_getpid_and_getppid() {
        let mut f = Fixture::new();
        let child = f.spawn("child");
        assert_eq!(f.yield_now(), child);

        assert_eq!(call(&mut f, SYSCALL_GETPID, 0), child);
        assert_eq!(f.context.eax, child);
        assert_eq!(call(&mut f, SYSCALL_GETPPID, 0), 1);
    }

    #[test]
    fn test_bootstrap_has_no_parent() {
        let mut f = Fixture::new();
        assert_eq!(call(&mut f, SYSCALL_GETPPID, 0), 0);
    }

    #[test]
    fn test_unknown_call_returns_error() {
        let mut f = Fixture::new();
        assert_eq!(call(&mut f, 9999, 0), u32::MAX);
        assert_eq!(f.context.eax, u32::MAX);
    }

    #[test]
    fn test_yield_result_lands_in_callers_saved_context() {
        let mut f = Fixture::new();
        let p1 = f.spawn("p1");
        let p2 = f.spawn("p2");
        assert_eq!(f.yield_now(), p1);

        call(&mut f, SYSCALL_SCHED_YIELD, 0);
        assert_eq!(f.manager.current(), p2);
        let saved = f.manager.process(p1).expect("p1").context();
        assert_eq!(saved.eax, 0);
    }

    #[test]
    fn test_exit_terminates_caller() {
        let mut f = Fixture::new();
        let p1 = f.spawn("p1");
        assert_eq!(f.yield_now(), p1);

        call(&mut f, SYSCALL_EXIT, 5);
        assert_eq!(f.manager.current(), 1);
        assert_eq!(f.manager.state(p1), Some(ProcessState::Terminated));
        assert_eq!(f.manager.state(1), Some(ProcessState::Running));

        // released once the scheduler has left its stack
        assert_eq!(f.tick(), 1);
        assert_eq!(f.manager.state(p1), None);
    }

    #[test]
    fn test_exit_from_idle_is_refused() {
        let mut f = Fixture::new();
        assert_eq!(call(&mut f, SYSCALL_EXIT, 0), u32::MAX);
        assert_eq!(f.manager.current(), 1);
    }
}
