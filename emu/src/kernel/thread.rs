//! # Threads
//!
//! Guest threads are plain records: a saved register file plus bookkeeping.
//! Only the current thread's registers live in the CPU.
//!
//! ```text
//!                 start                 reschedule
//!   ┌─────────┐ ───────▶ ┌───────┐ ─────────────────▶ ┌─────────┐
//!   │ Dormant │          │ Ready │ ◀───────────────── │ Running │
//!   └─────────┘ ◀──┐     └───────┘     preempted      └────┬────┘
//!        ▲         │         ▲  │ suspend                  │ wait
//!        │ exit /  │    wake │  ▼                          ▼
//!        │ terminate   ┌───────────┐  suspend   ┌─────────────┐
//!        └──────── ... │  Waiting  │ ─────────▶ │ WaitSuspend │
//!                      └───────────┘ ◀───────── └─────────────┘
//!                                       resume
//! ```
//!
//! A wait is described by a [`WaitState`]. Its outcome lives in a shared cell
//! so whoever ends the wait can record the result even while the thread is
//! busy running a callback on top of its wait.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::cpu::CpuState;
use crate::cpu::registers::{REG_A0, REG_A1, REG_GP, REG_K0, REG_RA, REG_SP};
use crate::memory::Memory;

use super::callback::Callback;
use super::error;
use super::object::Uid;
use super::timing::{EventHandle, KernelEvent};
use super::{Kernel, THREAD_RETURN_ADDRESS};

pub const MIN_USER_PRIORITY: u32 = 0x08;
pub const MAX_USER_PRIORITY: u32 = 0x77;
pub const MIN_STACK_SIZE: u32 = 0x200;

/// Zero the stack instead of filling it with `0xFF`.
pub const THREAD_ATTR_CLEAR_STACK: u32 = 0x0010_0000;

const STACK_FILL: u8 = 0xFF;
/// Scratch area left free above `sp` at thread entry.
const ENTRY_STACK_RESERVE: u32 = 0x40;
/// Thread context block the kernel keeps at the top of the stack.
const THREAD_CONTEXT_SIZE: u32 = 0x100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    Waiting,
    WaitSuspend,
    Suspended,
    Dormant,
}

/// What a waiting thread is blocked on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitType {
    None,
    Sleep,
    Delay,
    Semaphore,
    EventFlag,
    Mutex,
    ThreadEnd,
    VBlank,
    GeListSync,
    GeDrawSync,
    Callback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Pending,
    Ended { result: u32 },
}

pub type WaitCell = Rc<Cell<WaitOutcome>>;

#[derive(Clone, Debug)]
pub struct WaitState {
    pub kind: WaitType,
    /// Uid of the object waited on, 0 when there is none.
    pub id: Uid,
    pub outcome: WaitCell,
    /// Guest address of the timeout in microseconds, 0 for none.
    pub timeout_ptr: u32,
    pub timeout: Option<EventHandle>,
}

impl WaitState {
    #[must_use]
    pub fn result(&self) -> Option<u32> {
        match self.outcome.get() {
            WaitOutcome::Pending => None,
            WaitOutcome::Ended { result } => Some(result),
        }
    }

    #[must_use]
    pub fn matches(&self, kind: WaitType, id: Uid) -> bool {
        self.kind == kind && self.id == id
    }
}

/// Everything a callback overwrote when it was injected.
#[derive(Clone, Debug)]
pub struct CallbackFrame {
    pub context: CpuState,
    pub wait: Option<WaitState>,
    pub status: ThreadStatus,
    pub callback: Uid,
}

pub struct Thread {
    pub name: String,
    pub entry: u32,
    pub priority: u32,
    pub initial_priority: u32,
    pub attr: u32,
    pub status: ThreadStatus,
    pub context: CpuState,
    pub stack: u32,
    pub stack_size: u32,
    pub gp: u32,
    pub module: Option<Uid>,
    pub wait: Option<WaitState>,
    pub allow_callbacks: bool,
    pub wakeup_count: u32,
    pub exit_status: u32,
    /// Callbacks created by this thread. They die with it.
    pub callbacks: Vec<Uid>,
    pub pending_callbacks: VecDeque<Uid>,
    pub callback_frames: Vec<CallbackFrame>,
    /// Threads blocked in `sceKernelWaitThreadEnd` on this one.
    pub end_waiters: Vec<Uid>,
}

impl Thread {
    fn new(name: &str, entry: u32, priority: u32, attr: u32, stack: u32, stack_size: u32) -> Self {
        Self {
            name: name.to_string(),
            entry,
            priority,
            initial_priority: priority,
            attr,
            status: ThreadStatus::Dormant,
            context: CpuState::default(),
            stack,
            stack_size,
            gp: 0,
            module: None,
            wait: None,
            allow_callbacks: false,
            wakeup_count: 0,
            exit_status: error::DORMANT,
            callbacks: Vec::new(),
            pending_callbacks: VecDeque::new(),
            callback_frames: Vec::new(),
            end_waiters: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_waiting_for(&self, kind: WaitType, id: Uid) -> bool {
        matches!(self.status, ThreadStatus::Waiting | ThreadStatus::WaitSuspend)
            && self.wait.as_ref().is_some_and(|w| w.matches(kind, id))
    }

    #[must_use]
    pub fn wait_type(&self) -> WaitType {
        self.wait.as_ref().map_or(WaitType::None, |w| w.kind)
    }

    #[must_use]
    pub const fn stack_top(&self) -> u32 {
        self.stack + self.stack_size
    }

    #[must_use]
    pub fn in_callback(&self) -> bool {
        !self.callback_frames.is_empty()
    }
}

pub(super) const fn normalize_delay(us: u64) -> u64 {
    if us < 200 { 210 } else { us }
}

impl Kernel {
    /// Creates a DORMANT thread and reserves its stack at the top of user
    /// memory.
    #[allow(clippy::too_many_arguments)]
    pub fn create_thread(
        &mut self,
        memory: &mut Memory,
        name: &str,
        entry: u32,
        priority: u32,
        stack_size: u32,
        attr: u32,
        module: Option<Uid>,
    ) -> Result<Uid, u32> {
        if entry == 0 || !memory.is_valid_address(entry) {
            return Err(error::ILLEGAL_ENTRY);
        }
        if !(MIN_USER_PRIORITY..=MAX_USER_PRIORITY).contains(&priority) {
            return Err(error::ILLEGAL_PRIORITY);
        }
        if stack_size < MIN_STACK_SIZE {
            return Err(error::ILLEGAL_STACK_SIZE);
        }

        let stack_size = stack_size.next_multiple_of(0x100);
        let stack = self
            .user_memory
            .alloc_aligned(stack_size, 0x100, 0x100, true, &format!("stack/{name}"))
            .ok_or(error::NO_MEMORY)?;
        let fill = if attr & THREAD_ATTR_CLEAR_STACK != 0 { 0 } else { STACK_FILL };
        memory.memset(stack, fill, stack_size as usize);

        let mut thread = Thread::new(name, entry, priority, attr, stack, stack_size);
        thread.module = module;
        thread.gp = self.module_gp;
        let Some(uid) = self.objects.create(thread) else {
            self.user_memory.free(stack);
            return Err(error::NO_MEMORY);
        };
        memory.write_u32(stack, uid);
        self.threads.push(uid);
        info!("created thread {name} ({uid:#x}) entry {entry:#010x} priority {priority:#x}");
        Ok(uid)
    }

    /// Moves a DORMANT thread to READY, copying `arglen` bytes at `argp` to
    /// the top of its stack.
    pub fn start_thread(&mut self, memory: &mut Memory, uid: Uid, arglen: u32, argp: u32) -> Result<(), u32> {
        let thread = self.objects.get_mut::<Thread>(uid).ok_or(error::UNKNOWN_THID)?;
        if thread.status != ThreadStatus::Dormant {
            return Err(error::NOT_DORMANT);
        }

        let mut context = CpuState::default();
        let top = thread.stack_top();
        let mut sp = top - THREAD_CONTEXT_SIZE;
        let mut args_address = 0;
        if arglen > 0 && argp != 0 {
            let args = memory.slice(argp, arglen as usize).map(<[u8]>::to_vec);
            if let Some(args) = args {
                sp -= arglen.next_multiple_of(0x10);
                memory.copy_from_slice(sp, &args);
                args_address = sp;
            } else {
                warn!("thread {} argument block {argp:#010x} is unmapped", thread.name);
            }
        }
        sp -= ENTRY_STACK_RESERVE;

        context.set_pc(thread.entry);
        context.set_register(REG_A0, if args_address == 0 { 0 } else { arglen });
        context.set_register(REG_A1, args_address);
        context.set_register(REG_SP, sp);
        context.set_register(REG_K0, top - THREAD_CONTEXT_SIZE);
        context.set_register(REG_GP, thread.gp);
        context.set_register(REG_RA, THREAD_RETURN_ADDRESS);

        thread.context = context;
        thread.priority = thread.initial_priority;
        thread.wait = None;
        thread.allow_callbacks = false;
        thread.wakeup_count = 0;
        thread.exit_status = error::OK;
        thread.status = ThreadStatus::Ready;
        let priority = thread.priority;
        debug!("starting thread {} ({uid:#x})", thread.name);

        self.ready.push_back(priority, uid);
        self.needs_reschedule = true;
        Ok(())
    }

    /// Ends the current thread with `status`. It can be restarted later.
    pub fn exit_thread(&mut self, memory: &mut Memory, status: u32) -> Result<(), u32> {
        let uid = self.running_thread()?;
        self.stop_thread(memory, uid, status);
        Ok(())
    }

    /// Ends the current thread and deletes it.
    pub fn exit_delete_thread(&mut self, memory: &mut Memory, status: u32) -> Result<(), u32> {
        let uid = self.running_thread()?;
        self.stop_thread(memory, uid, status);
        self.destroy_thread(uid);
        Ok(())
    }

    /// Forces another thread to DORMANT.
    pub fn terminate_thread(&mut self, memory: &mut Memory, uid: Uid) -> Result<(), u32> {
        if self.current == Some(uid) {
            return Err(error::ILLEGAL_THID);
        }
        let thread = self.objects.get::<Thread>(uid).ok_or(error::UNKNOWN_THID)?;
        if thread.status == ThreadStatus::Dormant {
            return Err(error::DORMANT);
        }
        self.stop_thread(memory, uid, error::THREAD_TERMINATED);
        Ok(())
    }

    pub fn terminate_delete_thread(&mut self, memory: &mut Memory, uid: Uid) -> Result<(), u32> {
        if self.current == Some(uid) {
            return Err(error::ILLEGAL_THID);
        }
        let thread = self.objects.get::<Thread>(uid).ok_or(error::UNKNOWN_THID)?;
        if thread.status != ThreadStatus::Dormant {
            self.stop_thread(memory, uid, error::THREAD_TERMINATED);
        }
        self.destroy_thread(uid);
        Ok(())
    }

    /// Deletes a DORMANT thread, its stack and its callbacks.
    pub fn delete_thread(&mut self, uid: Uid) -> Result<(), u32> {
        if self.current == Some(uid) {
            return Err(error::ILLEGAL_THID);
        }
        let thread = self.objects.get::<Thread>(uid).ok_or(error::UNKNOWN_THID)?;
        if thread.status != ThreadStatus::Dormant {
            return Err(error::NOT_DORMANT);
        }
        self.destroy_thread(uid);
        Ok(())
    }

    fn running_thread(&self) -> Result<Uid, u32> {
        if self.interrupts.in_interrupt() {
            return Err(error::ILLEGAL_CONTEXT);
        }
        self.current.ok_or(error::ILLEGAL_CONTEXT)
    }

    /// Takes a thread out of whatever queue it is in and makes it DORMANT.
    fn stop_thread(&mut self, memory: &mut Memory, uid: Uid, exit_status: u32) {
        let Some(thread) = self.objects.get_mut::<Thread>(uid) else {
            return;
        };
        let status = thread.status;
        let priority = thread.priority;
        let mut waits: Vec<WaitState> = thread.wait.take().into_iter().collect();
        waits.extend(thread.callback_frames.drain(..).filter_map(|f| f.wait));
        thread.pending_callbacks.clear();
        thread.allow_callbacks = false;
        thread.exit_status = exit_status;
        thread.status = ThreadStatus::Dormant;
        let end_waiters = std::mem::take(&mut thread.end_waiters);
        info!("thread {} ({uid:#x}) stopped with {exit_status:#x}", thread.name);

        if status == ThreadStatus::Ready {
            self.ready.remove(priority, uid);
        }
        for wait in waits {
            if let Some(handle) = wait.timeout {
                self.timer.unschedule(handle);
            }
            self.detach_waiter(memory, uid, wait.kind, wait.id);
            self.process_wait_queue(memory, wait.kind, wait.id);
        }
        self.release_mutexes_owned_by(memory, uid);
        for waiter in end_waiters {
            self.end_wait(memory, waiter, WaitType::ThreadEnd, uid, exit_status);
        }
        self.needs_reschedule = true;
    }

    fn destroy_thread(&mut self, uid: Uid) {
        let Some(thread) = self.objects.destroy_as::<Thread>(uid) else {
            return;
        };
        debug!("deleting thread {} ({uid:#x})", thread.name);
        self.user_memory.free(thread.stack);
        for callback in thread.callbacks {
            self.objects.destroy_as::<Callback>(callback);
        }
        self.threads.retain(|t| *t != uid);
        if self.current == Some(uid) {
            self.current = None;
        }
        self.needs_reschedule = true;
    }

    /// 0 names the current thread for priority and id arguments.
    fn resolve_thread(&self, uid: Uid) -> Result<Uid, u32> {
        if uid == 0 {
            self.current.ok_or(error::ILLEGAL_THID)
        } else if self.objects.get::<Thread>(uid).is_some() {
            Ok(uid)
        } else {
            Err(error::UNKNOWN_THID)
        }
    }

    pub fn change_thread_priority(&mut self, uid: Uid, priority: u32) -> Result<(), u32> {
        let uid = self.resolve_thread(uid)?;
        let priority = if priority == 0 {
            self.current_thread_ref().map_or(priority, |t| t.priority)
        } else {
            priority
        };
        if !(MIN_USER_PRIORITY..=MAX_USER_PRIORITY).contains(&priority) {
            return Err(error::ILLEGAL_PRIORITY);
        }
        let thread = self.objects.get_mut::<Thread>(uid).ok_or(error::UNKNOWN_THID)?;
        if thread.status == ThreadStatus::Dormant {
            return Err(error::DORMANT);
        }
        let old = std::mem::replace(&mut thread.priority, priority);
        if thread.status == ThreadStatus::Ready {
            self.ready.remove(old, uid);
            self.ready.push_back(priority, uid);
        }
        self.needs_reschedule = true;
        Ok(())
    }

    /// Sends the current thread (or the head of `priority`) to the back of
    /// its ready level.
    pub fn rotate_thread_ready_queue(&mut self, priority: u32) -> Result<(), u32> {
        let current = self.running_thread()?;
        let thread = self.objects.get_mut::<Thread>(current).ok_or(error::ILLEGAL_CONTEXT)?;
        let priority = if priority == 0 { thread.priority } else { priority };
        if thread.priority == priority && thread.status == ThreadStatus::Running {
            thread.status = ThreadStatus::Ready;
            self.ready.push_back(priority, current);
        } else {
            self.ready.rotate(priority);
        }
        self.needs_reschedule = true;
        Ok(())
    }

    pub fn suspend_thread(&mut self, uid: Uid) -> Result<(), u32> {
        if self.current == Some(uid) || uid == 0 {
            return Err(error::ILLEGAL_THID);
        }
        let thread = self.objects.get_mut::<Thread>(uid).ok_or(error::UNKNOWN_THID)?;
        match thread.status {
            ThreadStatus::Dormant => Err(error::DORMANT),
            ThreadStatus::Suspended | ThreadStatus::WaitSuspend => Err(error::SUSPEND),
            ThreadStatus::Waiting => {
                thread.status = ThreadStatus::WaitSuspend;
                Ok(())
            }
            ThreadStatus::Ready | ThreadStatus::Running => {
                let priority = thread.priority;
                thread.status = ThreadStatus::Suspended;
                self.ready.remove(priority, uid);
                Ok(())
            }
        }
    }

    pub fn resume_thread(&mut self, uid: Uid) -> Result<(), u32> {
        let thread = self.objects.get_mut::<Thread>(uid).ok_or(error::UNKNOWN_THID)?;
        match thread.status {
            ThreadStatus::Suspended => {
                thread.status = ThreadStatus::Ready;
                let priority = thread.priority;
                self.ready.push_back(priority, uid);
                self.needs_reschedule = true;
                Ok(())
            }
            ThreadStatus::WaitSuspend => {
                thread.status = ThreadStatus::Waiting;
                Ok(())
            }
            _ => Err(error::NOT_SUSPEND),
        }
    }

    /// Sleeps until `wakeup_thread`, consuming a stored wakeup first.
    pub fn sleep_thread(&mut self, allow_callbacks: bool) -> Result<(), u32> {
        let uid = self.running_thread()?;
        let thread = self.objects.get_mut::<Thread>(uid).ok_or(error::ILLEGAL_CONTEXT)?;
        if thread.wakeup_count > 0 {
            thread.wakeup_count -= 1;
            return Ok(());
        }
        self.wait_current_thread(WaitType::Sleep, 0, allow_callbacks)?;
        Ok(())
    }

    pub fn wakeup_thread(&mut self, memory: &mut Memory, uid: Uid) -> Result<(), u32> {
        let uid = self.resolve_thread(uid)?;
        if self.end_wait(memory, uid, WaitType::Sleep, 0, error::OK) {
            return Ok(());
        }
        if let Some(thread) = self.objects.get_mut::<Thread>(uid) {
            thread.wakeup_count += 1;
        }
        Ok(())
    }

    /// Blocks the current thread for at least `us` microseconds.
    pub fn delay_thread(&mut self, us: u32, allow_callbacks: bool) -> Result<(), u32> {
        let uid = self.running_thread()?;
        self.wait_current_thread(WaitType::Delay, 0, allow_callbacks)?;
        let cycles = self.timer.us_to_cycles(normalize_delay(u64::from(us)));
        let handle = self.timer.schedule(cycles, KernelEvent::DelayWake { thread: uid });
        if let Some(wait) = self.objects.get_mut::<Thread>(uid).and_then(|t| t.wait.as_mut()) {
            wait.timeout = Some(handle);
        }
        Ok(())
    }

    /// Blocks until `uid` is DORMANT. Returns its exit status right away if
    /// it already is.
    pub fn wait_thread_end(
        &mut self,
        memory: &Memory,
        uid: Uid,
        timeout_ptr: u32,
        allow_callbacks: bool,
    ) -> Result<u32, u32> {
        if self.current == Some(uid) {
            return Err(error::ILLEGAL_THID);
        }
        let target = self.objects.get::<Thread>(uid).ok_or(error::UNKNOWN_THID)?;
        if target.status == ThreadStatus::Dormant {
            return Ok(target.exit_status);
        }
        let current = self.running_thread()?;
        self.wait_current_thread(WaitType::ThreadEnd, uid, allow_callbacks)?;
        if let Some(target) = self.objects.get_mut::<Thread>(uid) {
            target.end_waiters.push(current);
        }
        self.arm_timeout(memory, WaitType::ThreadEnd, uid, timeout_ptr, normalize_delay);
        Ok(error::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{setup, spawn};
    use crate::memory::USER_PARTITION_BASE;
    use pretty_assertions::assert_eq;

    fn status(kernel: &Kernel, uid: Uid) -> ThreadStatus {
        kernel.objects.get::<Thread>(uid).unwrap().status
    }

    #[test]
    fn create_validates_arguments() {
        let (mut kernel, _cpu, mut memory, _main) = setup();
        let entry = USER_PARTITION_BASE;
        assert_eq!(
            kernel.create_thread(&mut memory, "t", 0, 0x20, 0x1000, 0, None),
            Err(error::ILLEGAL_ENTRY)
        );
        assert_eq!(
            kernel.create_thread(&mut memory, "t", entry, 0x78, 0x1000, 0, None),
            Err(error::ILLEGAL_PRIORITY)
        );
        assert_eq!(
            kernel.create_thread(&mut memory, "t", entry, 0x20, 0x100, 0, None),
            Err(error::ILLEGAL_STACK_SIZE)
        );
        let uid = kernel
            .create_thread(&mut memory, "t", entry, 0x20, 0x1000, 0, None)
            .unwrap();
        assert_eq!(status(&kernel, uid), ThreadStatus::Dormant);
        let stack = kernel.objects.get::<Thread>(uid).unwrap().stack;
        assert_eq!(memory.read_u32(stack), uid);
        assert_eq!(memory.read_u8(stack + 4), STACK_FILL);
    }

    #[test]
    fn start_copies_arguments_to_the_stack() {
        let (mut kernel, _cpu, mut memory, _main) = setup();
        let argp = USER_PARTITION_BASE + 0x100;
        memory.write_cstring(argp, "hello");
        let uid = kernel
            .create_thread(&mut memory, "t", USER_PARTITION_BASE, 0x30, 0x1000, 0, None)
            .unwrap();
        kernel.start_thread(&mut memory, uid, 6, argp).unwrap();

        let thread = kernel.objects.get::<Thread>(uid).unwrap();
        let a1 = thread.context.register(REG_A1);
        assert_eq!(thread.status, ThreadStatus::Ready);
        assert_eq!(thread.context.register(REG_A0), 6);
        assert_eq!(memory.read_cstring(a1, 16), "hello");
        assert_eq!(thread.context.register(REG_RA), THREAD_RETURN_ADDRESS);
        assert!(thread.context.register(REG_SP) < a1);
        assert_eq!(
            kernel.start_thread(&mut memory, uid, 0, 0),
            Err(error::NOT_DORMANT)
        );
    }

    #[test]
    fn suspend_and_resume_follow_the_state_machine() {
        let (mut kernel, _cpu, mut memory, main) = setup();
        let other = spawn(&mut kernel, &mut memory, "other", 0x30);
        assert_eq!(kernel.suspend_thread(main), Err(error::ILLEGAL_THID));
        kernel.suspend_thread(other).unwrap();
        assert_eq!(status(&kernel, other), ThreadStatus::Suspended);
        assert_eq!(kernel.suspend_thread(other), Err(error::SUSPEND));
        kernel.resume_thread(other).unwrap();
        assert_eq!(status(&kernel, other), ThreadStatus::Ready);
        assert_eq!(kernel.resume_thread(other), Err(error::NOT_SUSPEND));
    }

    #[test]
    fn wakeups_are_counted_when_nobody_sleeps() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        kernel.wakeup_thread(&mut memory, main).unwrap();
        kernel.sleep_thread(false).unwrap();
        assert_eq!(status(&kernel, main), ThreadStatus::Running);

        kernel.sleep_thread(false).unwrap();
        assert_eq!(status(&kernel, main), ThreadStatus::Waiting);
        kernel.reschedule(&mut cpu, false);
        kernel.wakeup_thread(&mut memory, main).unwrap();
        assert_eq!(status(&kernel, main), ThreadStatus::Ready);
    }

    #[test]
    fn short_delays_are_rounded_up() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        kernel.delay_thread(10, false).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), None);
        assert!(kernel.idle(&mut memory));
        assert_eq!(kernel.timer.now(), kernel.timer.us_to_cycles(210));
        assert_eq!(status(&kernel, main), ThreadStatus::Ready);
    }

    #[test]
    fn wait_thread_end_returns_exit_status() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let worker = spawn(&mut kernel, &mut memory, "worker", 0x30);
        kernel.wait_thread_end(&memory, worker, 0, false).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(worker));

        kernel.exit_thread(&mut memory, 7).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.state.register(crate::cpu::registers::REG_V0), 7);
        assert_eq!(kernel.wait_thread_end(&memory, worker, 0, false), Ok(7));
    }

    #[test]
    fn delete_frees_stack_and_callbacks() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let free_before = kernel.user_memory.total_free_bytes();
        let worker = spawn(&mut kernel, &mut memory, "worker", 0x10);
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(worker));
        let callback = kernel.create_callback("cb", USER_PARTITION_BASE, 0).unwrap();

        kernel.exit_thread(&mut memory, 0).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        kernel.delete_thread(worker).unwrap();
        assert_eq!(kernel.user_memory.total_free_bytes(), free_before);
        assert!(kernel.objects.get::<Callback>(callback).is_none());
        assert!(!kernel.threads().contains(&worker));
    }

    #[test]
    fn terminating_a_waiting_thread_leaves_the_primitive_clean() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let sema = kernel.create_semaphore("s", 0, 0, 1).unwrap();
        let worker = spawn(&mut kernel, &mut memory, "worker", 0x10);
        kernel.reschedule(&mut cpu, false);
        kernel.wait_semaphore(&memory, sema, 1, 0, false).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));

        kernel.terminate_thread(&mut memory, worker).unwrap();
        assert_eq!(status(&kernel, worker), ThreadStatus::Dormant);
        assert!(kernel.objects.get::<super::super::semaphore::Semaphore>(sema).unwrap().waiters.is_empty());
        assert_eq!(kernel.terminate_thread(&mut memory, worker), Err(error::DORMANT));
    }
}
