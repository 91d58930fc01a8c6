use alloc::{collections::BTreeMap, vec::Vec};
use core::ops::Bound;

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PageTableFlags, Size4KiB},
    VirtAddr,
};

use crate::{
    constants::{
        gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR},
        idt::TIMER_FREQUENCY,
        memory::{PAGE_SIZE, USER_SPACE_START},
        processes::{DEFAULT_PRIORITY, DEFAULT_TIME_SLICE, INITIAL_EFLAGS},
    },
    events::{Event, InterruptEvents},
    memory::{paging::Vmm, tlb::Mmu},
    processes::{
        process::{KernelStack, Process, ProcessSpace, ProcessState},
        registers::Context,
        Pid, ProcessError,
    },
};

const BOOTSTRAP_PID: Pid = 1;

/// Timer ticks covering at least `ms` milliseconds.
pub const fn ms_to_ticks(ms: u32) -> u64 {
    (ms as u64 * TIMER_FREQUENCY as u64).div_ceil(1000)
}

/// Process table plus round-robin dispatch.
///
/// The bootstrap process (pid 1) is also the idle process: it only runs
/// when nothing else is Ready, and it can be neither blocked nor destroyed.
#[derive(Debug)]
pub struct ProcessManager {
    processes: BTreeMap<Pid, Process>,
    current: Pid,
    idle: Pid,
    /// Last non-idle process dispatched; the round-robin scan starts after it.
    cursor: Pid,
    next_pid: Pid,
    /// Timer ticks seen by `tick`.
    clock: u64,
}

fn kernel_context(cr3: u32, esp: u32, eip: u32) -> Context {
    Context {
        esp,
        ebp: esp,
        eip,
        eflags: INITIAL_EFLAGS,
        cs: KERNEL_CODE_SELECTOR,
        ss: KERNEL_DATA_SELECTOR,
        ds: KERNEL_DATA_SELECTOR,
        es: KERNEL_DATA_SELECTOR,
        fs: KERNEL_DATA_SELECTOR,
        gs: KERNEL_DATA_SELECTOR,
        cr3,
        ..Context::default()
    }
}

fn user_context(cr3: u32, esp: u32, eip: u32) -> Context {
    Context {
        esp,
        ebp: esp,
        eip,
        eflags: INITIAL_EFLAGS,
        cs: USER_CODE_SELECTOR,
        ss: USER_DATA_SELECTOR,
        ds: USER_DATA_SELECTOR,
        es: USER_DATA_SELECTOR,
        fs: USER_DATA_SELECTOR,
        gs: USER_DATA_SELECTOR,
        cr3,
        ..Context::default()
    }
}

impl ProcessManager {
    /// Creates the table with the bootstrap "kernel" process Running.
    pub fn new<M: Mmu>(vmm: &Vmm<M>) -> Result<Self, ProcessError> {
        let kernel_stack = KernelStack::new()?;
        let context = kernel_context(vmm.kernel_space().cr3(), kernel_stack.top(), 0);
        let bootstrap = Process::new(
            BOOTSTRAP_PID,
            "kernel",
            ProcessState::Running,
            context,
            ProcessSpace::Kernel,
            kernel_stack,
            DEFAULT_PRIORITY,
            DEFAULT_TIME_SLICE,
            None,
        );

        let mut processes = BTreeMap::new();
        processes.insert(BOOTSTRAP_PID, bootstrap);
        log::info!("bootstrap process {} running", BOOTSTRAP_PID);

        Ok(ProcessManager {
            processes,
            current: BOOTSTRAP_PID,
            idle: BOOTSTRAP_PID,
            cursor: BOOTSTRAP_PID,
            next_pid: BOOTSTRAP_PID + 1,
            clock: 0,
        })
    }

    /// Creates a Ready process that starts at `entry_point`.
    ///
    /// Kernel processes share the kernel space and start on their kernel
    /// stack. User processes get a fresh space with one stack page right
    /// below `user_stack_top`, and must start at or above `USER_SPACE_START`.
    pub fn create_process<M, F>(
        &mut self,
        name: &str,
        entry_point: VirtAddr,
        kernel_mode: bool,
        vmm: &mut Vmm<M>,
        frames: &mut F,
    ) -> Result<Pid, ProcessError>
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let eip = entry_point.as_u64() as u32;
        if !kernel_mode && eip < USER_SPACE_START {
            return Err(ProcessError::InvalidOperation);
        }
        let kernel_stack = KernelStack::new()?;

        let (space, context) = if kernel_mode {
            let context = kernel_context(vmm.kernel_space().cr3(), kernel_stack.top(), eip);
            (ProcessSpace::Kernel, context)
        } else {
            let space = vmm.create_address_space(frames)?;
            let stack_top = vmm.layout().user_stack_top;
            let stack_page = VirtAddr::new(u64::from(stack_top - PAGE_SIZE));
            let flags = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
            if let Err(error) = vmm.allocate_page(&space, stack_page, flags, frames) {
                vmm.destroy_address_space(&space, frames)?;
                return Err(error.into());
            }
            let context = user_context(space.cr3(), stack_top, eip);
            (ProcessSpace::User(space), context)
        };

        let pid = self.next_pid;
        self.next_pid += 1;
        let parent = self.current;

        self.processes.insert(
            pid,
            Process::new(
                pid,
                name,
                ProcessState::Ready,
                context,
                space,
                kernel_stack,
                DEFAULT_PRIORITY,
                DEFAULT_TIME_SLICE,
                Some(parent),
            ),
        );
        if let Some(parent) = self.processes.get_mut(&parent) {
            parent.children.push(pid);
        }

        log::debug!(
            "created process {} ({}) at {:#x}, {} mode",
            pid,
            name,
            eip,
            if kernel_mode { "kernel" } else { "user" }
        );
        Ok(pid)
    }

    /// Unlinks a process and releases its kernel stack and, for user
    /// processes, its address space.
    pub fn destroy_process<M, F>(
        &mut self,
        pid: Pid,
        vmm: &mut Vmm<M>,
        frames: &mut F,
    ) -> Result<(), ProcessError>
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let process = self.processes.get(&pid).ok_or(ProcessError::NoSuchProcess)?;
        if pid == self.current || pid == self.idle || process.state == ProcessState::Running {
            return Err(ProcessError::InvalidOperation);
        }
        if let ProcessSpace::User(space) = process.space() {
            if vmm.is_active(space) {
                return Err(ProcessError::InvalidOperation);
            }
        }

        let Some(process) = self.processes.remove(&pid) else {
            return Err(ProcessError::NoSuchProcess);
        };
        if let Some(parent) = process.parent.and_then(|parent| self.processes.get_mut(&parent)) {
            parent.children.retain(|&child| child != pid);
        }
        for child in process.children.iter() {
            if let Some(child) = self.processes.get_mut(child) {
                child.parent = None;
            }
        }

        log::debug!("destroyed process {} ({})", pid, process.name());
        if let ProcessSpace::User(space) = process.into_space() {
            vmm.destroy_address_space(&space, frames)?;
        }
        Ok(())
    }

    /// Next process to run: the first Ready process after the last one
    /// dispatched in pid order, wrapping around. The idle process is only
    /// chosen when nothing else can run.
    fn pick_next(&self) -> Pid {
        let after = self
            .processes
            .range((Bound::Excluded(self.cursor), Bound::Unbounded));
        let before = self.processes.range(..=self.cursor);

        after
            .chain(before)
            .find(|&(&pid, process)| pid != self.idle && process.state == ProcessState::Ready)
            .map(|(&pid, _)| pid)
            .unwrap_or_else(|| match self.state(self.current) {
                Some(ProcessState::Running) => self.current,
                _ => self.idle,
            })
    }

    /// Picks the next process and switches `context` over to it.
    ///
    /// `context` holds the interrupted register file on entry and the one
    /// to resume on return. Terminated processes are reaped afterwards,
    /// except the one switched away from: the trap that got here is still
    /// running on its kernel stack, so it goes on the next pass.
    pub fn schedule<M, F>(&mut self, context: &mut Context, vmm: &mut Vmm<M>, frames: &mut F) -> Pid
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let outgoing = self.current;
        let next = self.pick_next();
        if next != self.current {
            self.switch_to(next, context, vmm);
        } else if let Some(process) = self.processes.get_mut(&next) {
            if process.remaining == 0 {
                process.remaining = process.time_slice();
            }
        }
        self.reap(outgoing, vmm, frames);
        self.current
    }

    fn switch_to<M: Mmu>(&mut self, next: Pid, context: &mut Context, vmm: &mut Vmm<M>) {
        if let Some(outgoing) = self.processes.get_mut(&self.current) {
            outgoing.context = *context;
            if outgoing.state == ProcessState::Running {
                outgoing.state = ProcessState::Ready;
            }
        }

        let Some(incoming) = self.processes.get_mut(&next) else {
            return;
        };
        incoming.state = ProcessState::Running;
        incoming.remaining = incoming.time_slice();
        *context = incoming.context;

        if vmm.active().start_address().as_u64() != u64::from(context.cr3) {
            match incoming.space() {
                ProcessSpace::Kernel => vmm.switch_to_kernel(),
                ProcessSpace::User(space) => vmm.switch_address_space(space),
            }
        }

        log::trace!("switch {} -> {}", self.current, next);
        self.current = next;
        if next != self.idle {
            self.cursor = next;
        }
    }

    fn reap<M, F>(&mut self, outgoing: Pid, vmm: &mut Vmm<M>, frames: &mut F)
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let terminated: Vec<Pid> = self
            .processes
            .iter()
            .filter(|&(&pid, process)| {
                process.state == ProcessState::Terminated
                    && pid != self.current
                    && pid != outgoing
            })
            .map(|(&pid, _)| pid)
            .collect();

        for pid in terminated {
            if let Err(error) = self.destroy_process(pid, vmm, frames) {
                log::warn!("could not reap process {}: {}", pid, error);
            }
        }
    }

    /// Timer tick: wakes sleepers that are due, charges the running process
    /// and preempts it once its slice is used up. The idle process is
    /// preempted on every tick.
    pub fn tick<M, F>(&mut self, context: &mut Context, vmm: &mut Vmm<M>, frames: &mut F) -> Pid
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        self.clock += 1;
        self.wake_sleepers();

        let expired = match self.processes.get_mut(&self.current) {
            Some(process) => {
                process.ticks_used += 1;
                process.remaining = process.remaining.saturating_sub(1);
                process.remaining == 0
            }
            None => true,
        };

        if expired || self.current == self.idle {
            self.schedule(context, vmm, frames)
        } else {
            self.current
        }
    }

    pub fn yield_now<M, F>(&mut self, context: &mut Context, vmm: &mut Vmm<M>, frames: &mut F) -> Pid
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        self.schedule(context, vmm, frames)
    }

    /// Running -> Blocked, then dispatches something else.
    pub fn block_current<M, F>(
        &mut self,
        context: &mut Context,
        vmm: &mut Vmm<M>,
        frames: &mut F,
    ) -> Result<Pid, ProcessError>
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        if self.current == self.idle {
            return Err(ProcessError::InvalidOperation);
        }
        let process = self
            .processes
            .get_mut(&self.current)
            .ok_or(ProcessError::NoSuchProcess)?;
        process.state = ProcessState::Blocked;
        Ok(self.schedule(context, vmm, frames))
    }

    /// Blocked -> Ready. Cancels a pending sleep.
    pub fn unblock(&mut self, pid: Pid) -> Result<(), ProcessError> {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(ProcessError::NoSuchProcess)?;
        if process.state != ProcessState::Blocked {
            return Err(ProcessError::InvalidOperation);
        }
        process.state = ProcessState::Ready;
        process.wake_at = None;
        Ok(())
    }

    /// Blocks the running process for `ticks` timer ticks (see
    /// [`ms_to_ticks`]). Zero ticks just yields.
    pub fn sleep_current<M, F>(
        &mut self,
        ticks: u64,
        context: &mut Context,
        vmm: &mut Vmm<M>,
        frames: &mut F,
    ) -> Result<Pid, ProcessError>
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        if self.current == self.idle {
            return Err(ProcessError::InvalidOperation);
        }
        if ticks == 0 {
            return Ok(self.yield_now(context, vmm, frames));
        }
        let wake_at = self.clock + ticks;
        let process = self
            .processes
            .get_mut(&self.current)
            .ok_or(ProcessError::NoSuchProcess)?;
        process.wake_at = Some(wake_at);
        log::trace!("process {} sleeps until tick {}", self.current, wake_at);
        self.block_current(context, vmm, frames)
    }

    fn wake_sleepers(&mut self) {
        let clock = self.clock;
        for process in self.processes.values_mut() {
            if process.state == ProcessState::Blocked
                && process.wake_at.is_some_and(|wake_at| wake_at <= clock)
            {
                process.state = ProcessState::Ready;
                process.wake_at = None;
            }
        }
    }

    /// Terminates the running process and wakes its parent if it is
    /// waiting. The process is reaped once something else runs.
    pub fn exit_current<M, F>(
        &mut self,
        code: i32,
        context: &mut Context,
        vmm: &mut Vmm<M>,
        frames: &mut F,
    ) -> Result<Pid, ProcessError>
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        if self.current == self.idle {
            return Err(ProcessError::InvalidOperation);
        }
        let process = self
            .processes
            .get_mut(&self.current)
            .ok_or(ProcessError::NoSuchProcess)?;
        process.state = ProcessState::Terminated;
        process.exit_code = Some(code);
        let parent = process.parent;
        log::debug!("process {} exited with {}", self.current, code);

        if let Some(parent) = parent.and_then(|parent| self.processes.get_mut(&parent)) {
            if parent.state == ProcessState::Blocked {
                parent.state = ProcessState::Ready;
            }
        }
        Ok(self.schedule(context, vmm, frames))
    }

    /// Terminates any process. Others are reaped at once; the running one
    /// is switched away from and reaped on the following pass.
    pub fn terminate<M, F>(
        &mut self,
        pid: Pid,
        context: &mut Context,
        vmm: &mut Vmm<M>,
        frames: &mut F,
    ) -> Result<(), ProcessError>
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        if pid == self.idle {
            return Err(ProcessError::InvalidOperation);
        }
        if pid == self.current {
            return self.exit_current(-1, context, vmm, frames).map(|_| ());
        }
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(ProcessError::NoSuchProcess)?;
        process.state = ProcessState::Terminated;
        process.exit_code = Some(-1);
        self.destroy_process(pid, vmm, frames)
    }

    /// Consumes everything interrupt handlers recorded since the last call.
    pub fn handle_events<M, F>(
        &mut self,
        events: &InterruptEvents,
        context: &mut Context,
        vmm: &mut Vmm<M>,
        frames: &mut F,
    ) -> Pid
    where
        M: Mmu,
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        events.drain(|event| match event {
            Event::Tick => {
                self.tick(context, vmm, frames);
            }
            Event::Wake(pid) => {
                if let Err(error) = self.unblock(pid) {
                    log::debug!("ignoring wake-up for {}: {}", pid, error);
                }
            }
        });
        self.current
    }

    /// Timer ticks since the manager was created.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn current_process(&self) -> Option<&Process> {
        self.processes.get(&self.current)
    }

    pub fn idle(&self) -> Pid {
        self.idle
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn state(&self, pid: Pid) -> Option<ProcessState> {
        self.processes.get(&pid).map(Process::state)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.processes.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processes::test_support::Fixture;
    use alloc::vec;

    #[test]
    fn test_bootstrap_process_is_running_idle() {
        let f = Fixture::new();
        assert_eq!(f.manager.current(), 1);
        assert_eq!(f.manager.idle(), 1);
        assert_eq!(f.manager.len(), 1);
        let bootstrap = f.manager.current_process().expect("bootstrap");
        assert_eq!(bootstrap.name(), "kernel");
        assert_eq!(bootstrap.state(), ProcessState::Running);
        assert!(bootstrap.is_kernel());
        assert_eq!(bootstrap.parent(), None);
    }

    #[test]
    fn test_ticks_dispatch_round_robin() {
        let mut f = Fixture::new();
        let p1 = f.spawn("p1");
        let p2 = f.spawn("p2");
        let p3 = f.spawn("p3");

        let mut dispatched = Vec::new();
        for _ in 0..5 * DEFAULT_TIME_SLICE {
            let before = f.manager.current();
            let after = f.tick();
            if after != before {
                dispatched.push(after);
            }
            assert_eq!(f.running(), [after]);
        }
        assert_eq!(dispatched, [p1, p2, p3, p1, p2]);
    }

    #[test]
    fn test_each_ready_process_runs_once_per_round() {
        let mut f = Fixture::new();
        let pids: Vec<Pid> = (0..4).map(|_| f.spawn("worker")).collect();

        let order: Vec<Pid> = (0..8).map(|_| f.yield_now()).collect();
        let mut expected = pids.clone();
        expected.extend_from_slice(&pids);
        assert_eq!(order, expected);
    }

    #[test]
    fn test_lone_process_keeps_running_on_yield() {
        let mut f = Fixture::new();
        let p1 = f.spawn("solo");
        assert_eq!(f.yield_now(), p1);
        assert_eq!(f.yield_now(), p1);
        assert_eq!(f.manager.state(1), Some(ProcessState::Ready));
    }

    #[test]
    fn test_blocked_process_is_skipped_until_unblocked() {
        let mut f = Fixture::new();
        let p1 = f.spawn("waiter");
        let _p2 = f.spawn("p2");
        let _p3 = f.spawn("p3");

        assert_eq!(f.yield_now(), p1);
        f.block();
        assert_eq!(f.manager.state(p1), Some(ProcessState::Blocked));
        for _ in 0..6 {
            assert_ne!(f.yield_now(), p1);
        }

        f.manager.unblock(p1).expect("unblock");
        assert_eq!(f.manager.state(p1), Some(ProcessState::Ready));
        let next: Vec<Pid> = (0..3).map(|_| f.yield_now()).collect();
        assert!(next.contains(&p1));
        assert_eq!(f.manager.unblock(p1), Err(ProcessError::InvalidOperation));
    }

    #[test]
    fn test_idle_runs_when_nothing_is_ready() {
        let mut f = Fixture::new();
        let p1 = f.spawn("waiter");
        assert_eq!(f.yield_now(), p1);
        assert_eq!(f.block(), 1);
        assert_eq!(f.running(), [1]);

        // the idle process hands over on the very next tick
        f.manager.unblock(p1).expect("unblock");
        assert_eq!(f.tick(), p1);
    }

    #[test]
    fn test_context_is_saved_and_restored() {
        let mut f = Fixture::new();
        let p1 = f.spawn_at("p1", 0x10_1000, true);
        let p2 = f.spawn_at("p2", 0x10_2000, true);

        assert_eq!(f.yield_now(), p1);
        assert_eq!(f.context.eip, 0x10_1000);
        f.context.eax = 0x1234;
        f.context.eip = 0x10_1100;
        let snapshot = f.context;

        assert_eq!(f.yield_now(), p2);
        assert_eq!(f.context.eip, 0x10_2000);
        assert_eq!(f.context.eax, 0);

        assert_eq!(f.yield_now(), p1);
        assert_eq!(f.context, snapshot);
    }

    #[test]
    fn test_initial_contexts() {
        let mut f = Fixture::new();
        let kernel = f.spawn_at("kworker", 0x10_4000, true);
        let user = f.spawn_at("init", 0x4000_0000, false);

        let process = f.manager.process(kernel).expect("kernel process");
        let context = process.context();
        assert_eq!(context.cs, 0x08);
        assert_eq!(context.ss, 0x10);
        assert_eq!(context.ds, 0x10);
        assert_eq!(context.eip, 0x10_4000);
        assert_eq!(context.eflags, 0x202);
        // esp is the 32-bit stack pointer; on 64-bit hosts compare truncated
        assert_eq!(context.esp, process.kernel_stack().top_addr() as u32);
        assert_eq!(context.esp % 16, 0);
        assert_eq!(context.cr3, f.vmm.kernel_space().cr3());
        assert_eq!(process.parent(), Some(1));

        let process = f.manager.process(user).expect("user process");
        let context = process.context();
        assert_eq!(context.cs, 0x1B);
        assert_eq!(context.ss, 0x23);
        assert_eq!(context.ds, 0x23);
        assert_eq!(context.esp, 0xC000_0000);
        assert_eq!(context.eflags, 0x202);
        let ProcessSpace::User(space) = process.space() else {
            panic!("user process without its own space");
        };
        assert_eq!(context.cr3, space.cr3());
        assert_ne!(context.cr3, f.vmm.kernel_space().cr3());

        let (_, flags) = f
            .vmm
            .translate(space, VirtAddr::new(0xBFFF_F000))
            .expect("user stack mapped");
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE | PageTableFlags::WRITABLE));
        assert_eq!(f.manager.process(1).expect("bootstrap").children(), [kernel, user]);
    }

    #[test]
    fn test_user_entry_below_user_space_is_refused() {
        let mut f = Fixture::new();
        let used = f.frames.used_frames();
        assert_eq!(
            f.manager.create_process(
                "bad",
                VirtAddr::new(0x10_0000),
                false,
                &mut f.vmm,
                &mut f.frames
            ),
            Err(ProcessError::InvalidOperation)
        );
        assert_eq!(f.manager.len(), 1);
        assert_eq!(f.frames.used_frames(), used);
    }

    #[test]
    fn test_switches_load_the_incoming_directory() {
        let mut f = Fixture::new();
        let user = f.spawn_at("user", 0x4000_0000, false);
        let kernel = f.spawn("kworker");
        let user_cr3 = f.manager.process(user).expect("user").context().cr3;
        let kernel_cr3 = f.vmm.kernel_space().cr3();

        assert_eq!(f.yield_now(), user);
        assert_eq!(f.vmm.active().start_address().as_u64(), u64::from(user_cr3));
        assert_eq!(f.yield_now(), kernel);
        assert_eq!(f.vmm.active().start_address().as_u64(), u64::from(kernel_cr3));

        let loads: Vec<u64> = f.vmm.mmu().loads.iter().map(|addr| addr.as_u64()).collect();
        assert_eq!(
            loads,
            vec![u64::from(kernel_cr3), u64::from(user_cr3), u64::from(kernel_cr3)]
        );
    }

    #[test]
    fn test_destroy_rules() {
        let mut f = Fixture::new();
        let baseline = f.frames.used_frames();
        let user = f.spawn_at("user", 0x4000_0000, false);
        assert!(f.frames.used_frames() > baseline);

        assert_eq!(
            f.manager.destroy_process(1, &mut f.vmm, &mut f.frames),
            Err(ProcessError::InvalidOperation)
        );
        assert_eq!(
            f.manager.destroy_process(99, &mut f.vmm, &mut f.frames),
            Err(ProcessError::NoSuchProcess)
        );

        assert_eq!(f.yield_now(), user);
        assert_eq!(
            f.manager.destroy_process(user, &mut f.vmm, &mut f.frames),
            Err(ProcessError::InvalidOperation)
        );

        f.manager.block_current(&mut f.context, &mut f.vmm, &mut f.frames).expect("block");
        f.manager
            .destroy_process(user, &mut f.vmm, &mut f.frames)
            .expect("destroy blocked process");
        assert_eq!(f.manager.process(user).map(Process::pid), None);
        assert_eq!(f.frames.used_frames(), baseline);
        assert!(f.manager.process(1).expect("bootstrap").children().is_empty());
    }

    #[test]
    fn test_exit_is_reaped_after_switching_away() {
        let mut f = Fixture::new();
        let baseline = f.frames.used_frames();
        let user = f.spawn_at("user", 0x4000_0000, false);
        let other = f.spawn("other");

        assert_eq!(f.yield_now(), user);
        assert_eq!(f.exit(3), other);
        assert_eq!(f.running(), [other]);

        // still on the exiting process's kernel stack during that pass
        let exited = f.manager.process(user).expect("kept until the next pass");
        assert_eq!(exited.state(), ProcessState::Terminated);
        assert_eq!(exited.exit_code(), Some(3));
        assert!(f.frames.used_frames() > baseline);

        assert_eq!(f.yield_now(), other);
        assert!(f.manager.process(user).is_none());
        assert_eq!(f.frames.used_frames(), baseline);
    }

    #[test]
    fn test_exit_wakes_waiting_parent() {
        let mut f = Fixture::new();
        let parent = f.spawn("parent");
        assert_eq!(f.yield_now(), parent);

        let child = f.spawn("child");
        assert_eq!(f.manager.process(child).expect("child").parent(), Some(parent));
        assert_eq!(f.block(), child);

        assert_eq!(f.exit(0), parent);
        assert_eq!(f.manager.state(child), Some(ProcessState::Terminated));

        assert_eq!(f.yield_now(), parent);
        assert!(f.manager.process(child).is_none());
        assert!(f.manager.process(parent).expect("parent").children().is_empty());
    }

    #[test]
    fn test_terminate() {
        let mut f = Fixture::new();
        let p1 = f.spawn("p1");
        let p2 = f.spawn("p2");

        f.manager
            .terminate(p2, &mut f.context, &mut f.vmm, &mut f.frames)
            .expect("terminate other");
        assert!(f.manager.process(p2).is_none());
        assert_eq!(
            f.manager.terminate(1, &mut f.context, &mut f.vmm, &mut f.frames),
            Err(ProcessError::InvalidOperation)
        );

        assert_eq!(f.yield_now(), p1);
        f.manager
            .terminate(p1, &mut f.context, &mut f.vmm, &mut f.frames)
            .expect("terminate self");
        assert_eq!(f.manager.current(), 1);
        assert_eq!(f.manager.len(), 2);
        f.tick();
        assert_eq!(f.manager.len(), 1);
    }

    #[test]
    fn test_tick_accounting() {
        let mut f = Fixture::new();
        let p1 = f.spawn("p1");
        let _p2 = f.spawn("p2");
        assert_eq!(f.yield_now(), p1);

        for _ in 0..3 {
            assert_eq!(f.tick(), p1);
        }
        let process = f.manager.process(p1).expect("p1");
        assert_eq!(process.ticks_used(), 3);
        assert_eq!(process.remaining_slice(), DEFAULT_TIME_SLICE - 3);
        assert_eq!(process.priority(), DEFAULT_PRIORITY);
    }

    #[test]
    fn test_events_drive_wakeups_and_ticks() {
        let mut f = Fixture::new();
        let p1 = f.spawn("p1");
        assert_eq!(f.yield_now(), p1);
        f.block();

        let events = InterruptEvents::new(8);
        events.post_wake(p1);
        events.post_wake(42);
        events.record_tick();
        let current = f.manager.handle_events(
            &events,
            &mut f.context,
            &mut f.vmm,
            &mut f.frames,
        );
        assert_eq!(current, p1);
        assert_eq!(events.pending(), 0);
    }

    #[test]
    fn test_round_robin_resumes_after_idle() {
        let mut f = Fixture::new();
        let p1 = f.spawn("p1");
        let p2 = f.spawn("p2");
        let p3 = f.spawn("p3");

        assert_eq!(f.yield_now(), p1);
        assert_eq!(f.yield_now(), p2);
        assert_eq!(f.yield_now(), p3);
        assert_eq!(f.block(), p1);
        assert_eq!(f.block(), p2);
        assert_eq!(f.block(), 1);

        f.manager.unblock(p1).expect("unblock p1");
        f.manager.unblock(p3).expect("unblock p3");
        // p2 ran last, so p3 is next rather than the lowest pid
        assert_eq!(f.tick(), p3);
        assert_eq!(f.yield_now(), p1);
    }

    #[test]
    fn test_sleeper_wakes_after_its_ticks() {
        let mut f = Fixture::new();
        let p1 = f.spawn("sleeper");
        let p2 = f.spawn("p2");
        assert_eq!(f.yield_now(), p1);

        let next = f
            .manager
            .sleep_current(3, &mut f.context, &mut f.vmm, &mut f.frames)
            .expect("sleep");
        assert_eq!(next, p2);
        let sleeper = f.manager.process(p1).expect("p1");
        assert_eq!(sleeper.state(), ProcessState::Blocked);
        assert_eq!(sleeper.wake_at(), Some(3));

        f.tick();
        f.tick();
        assert_eq!(f.manager.state(p1), Some(ProcessState::Blocked));
        assert_eq!(f.tick(), p2);
        assert_eq!(f.manager.state(p1), Some(ProcessState::Ready));
        assert_eq!(f.manager.process(p1).expect("p1").wake_at(), None);
        assert_eq!(f.yield_now(), p1);
        assert_eq!(f.manager.clock(), 3);
    }

    #[test]
    fn test_idle_hands_over_to_woken_sleeper() {
        let mut f = Fixture::new();
        let p1 = f.spawn("sleeper");
        assert_eq!(f.yield_now(), p1);

        f.manager
            .sleep_current(2, &mut f.context, &mut f.vmm, &mut f.frames)
            .expect("sleep");
        assert_eq!(f.running(), [1]);
        assert_eq!(f.tick(), 1);
        assert_eq!(f.tick(), p1);
    }

    #[test]
    fn test_sleep_edge_cases() {
        let mut f = Fixture::new();
        assert_eq!(
            f.manager.sleep_current(5, &mut f.context, &mut f.vmm, &mut f.frames),
            Err(ProcessError::InvalidOperation)
        );

        let p1 = f.spawn("p1");
        let p2 = f.spawn("p2");
        assert_eq!(f.yield_now(), p1);
        assert_eq!(
            f.manager.sleep_current(0, &mut f.context, &mut f.vmm, &mut f.frames),
            Ok(p2)
        );
        assert_eq!(f.manager.state(p1), Some(ProcessState::Ready));

        // an explicit wake-up cancels the deadline
        f.manager
            .sleep_current(100, &mut f.context, &mut f.vmm, &mut f.frames)
            .expect("sleep");
        f.manager.unblock(p2).expect("unblock");
        assert_eq!(f.manager.process(p2).expect("p2").wake_at(), None);
    }

    #[test]
    fn test_ms_to_ticks_rounds_up() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(15), 2);
        assert_eq!(ms_to_ticks(1000), 100);
    }
}
