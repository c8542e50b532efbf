//! # Scheduler
//!
//! Strict priority scheduling over 128 levels, lower number first, FIFO
//! inside a level:
//!
//! ```text
//!   level  0x08 │ ─ │
//!          0x10 │ A │ B │            <- A runs next
//!          0x20 │ C │
//!           ..
//!          0x7F │ ─ │
//! ```
//!
//! The current thread is never in the ready queue. A preempted thread goes
//! back to the front of its level; a thread that becomes ready any other way
//! goes to the back.
//!
//! Waiting is split in two halves. A primitive first ends the wait by
//! storing a result in the thread's [`WaitCell`], then asks the scheduler to
//! wake the thread. Waking refuses threads whose wait has not ended, so a
//! stray wake can never release a thread early.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::cpu::Cpu;
use crate::cpu::registers::REG_V0;
use crate::memory::Memory;

use super::error;
use super::event_flag::EventFlag;
use super::mutex::Mutex;
use super::object::Uid;
use super::semaphore::Semaphore;
use super::thread::{Thread, ThreadStatus, WaitCell, WaitOutcome, WaitState, WaitType};
use super::timing::KernelEvent;
use super::Kernel;

pub const PRIORITY_LEVELS: usize = 128;

#[derive(Debug)]
pub struct ReadyQueue {
    levels: Vec<VecDeque<Uid>>,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self {
            levels: vec![VecDeque::new(); PRIORITY_LEVELS],
        }
    }
}

const fn level(priority: u32) -> usize {
    let priority = priority as usize;
    if priority < PRIORITY_LEVELS { priority } else { PRIORITY_LEVELS - 1 }
}

impl ReadyQueue {
    pub fn push_back(&mut self, priority: u32, uid: Uid) {
        self.levels[level(priority)].push_back(uid);
    }

    pub fn push_front(&mut self, priority: u32, uid: Uid) {
        self.levels[level(priority)].push_front(uid);
    }

    pub fn remove(&mut self, priority: u32, uid: Uid) -> bool {
        let queue = &mut self.levels[level(priority)];
        let before = queue.len();
        queue.retain(|t| *t != uid);
        queue.len() != before
    }

    /// Head of the best non-empty level.
    #[must_use]
    pub fn first(&self) -> Option<(u32, Uid)> {
        self.levels
            .iter()
            .enumerate()
            .find_map(|(p, queue)| queue.front().map(|uid| (p as u32, *uid)))
    }

    #[must_use]
    pub fn first_priority(&self) -> Option<u32> {
        self.first().map(|(priority, _)| priority)
    }

    pub fn pop_first(&mut self) -> Option<Uid> {
        self.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Moves the head of `priority` to its back.
    pub fn rotate(&mut self, priority: u32) {
        let queue = &mut self.levels[level(priority)];
        if let Some(head) = queue.pop_front() {
            queue.push_back(head);
        }
    }

    #[must_use]
    pub fn contains(&self, priority: u32, uid: Uid) -> bool {
        self.levels[level(priority)].contains(&uid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }
}

impl Kernel {
    /// Puts the current thread to sleep on `(kind, id)`.
    ///
    /// Fails with `ILLEGAL_CONTEXT` inside an interrupt handler or when no
    /// thread is running.
    pub fn wait_current_thread(
        &mut self,
        kind: WaitType,
        id: Uid,
        allow_callbacks: bool,
    ) -> Result<WaitCell, u32> {
        if self.interrupts.in_interrupt() {
            return Err(error::ILLEGAL_CONTEXT);
        }
        let uid = self.current.ok_or(error::ILLEGAL_CONTEXT)?;
        let thread = self.objects.get_mut::<Thread>(uid).ok_or(error::ILLEGAL_CONTEXT)?;
        let outcome = Rc::new(Cell::new(WaitOutcome::Pending));
        thread.wait = Some(WaitState {
            kind,
            id,
            outcome: Rc::clone(&outcome),
            timeout_ptr: 0,
            timeout: None,
        });
        thread.allow_callbacks = allow_callbacks;
        thread.status = ThreadStatus::Waiting;
        trace!("thread {} waits on {kind:?} {id:#x}", thread.name);
        self.needs_reschedule = true;
        Ok(outcome)
    }

    /// Arms a timeout for the wait the current thread just entered. The
    /// guest value at `timeout_ptr` is rounded by `normalize`.
    pub(super) fn arm_timeout(
        &mut self,
        memory: &Memory,
        kind: WaitType,
        id: Uid,
        timeout_ptr: u32,
        normalize: fn(u64) -> u64,
    ) {
        if timeout_ptr == 0 {
            return;
        }
        let Some(uid) = self.current else {
            return;
        };
        let us = normalize(u64::from(memory.read_u32(timeout_ptr)));
        let cycles = self.timer.us_to_cycles(us);
        let Some(wait) = self
            .objects
            .get_mut::<Thread>(uid)
            .and_then(|t| t.wait.as_mut())
            .filter(|w| w.matches(kind, id))
        else {
            return;
        };
        let handle = self.timer.schedule(cycles, KernelEvent::WaitTimeout { thread: uid, wait: kind, id });
        wait.timeout_ptr = timeout_ptr;
        wait.timeout = Some(handle);
    }

    /// Ends the wait of `tid` on `(kind, id)` with `result` and wakes it.
    ///
    /// The wait may be the thread's own or one saved underneath a running
    /// callback; the latter is resolved when the callback returns. Returns
    /// `false` if the thread is not waiting on that object.
    pub fn end_wait(&mut self, memory: &mut Memory, tid: Uid, kind: WaitType, id: Uid, result: u32) -> bool {
        let Some(thread) = self.objects.get_mut::<Thread>(tid) else {
            return false;
        };
        let pending = |w: &&WaitState| w.matches(kind, id) && w.result().is_none();
        if let Some(wait) = thread.wait.as_ref().filter(pending) {
            wait.outcome.set(WaitOutcome::Ended { result });
            return self.wake_up_thread(memory, tid);
        }
        let saved = thread
            .callback_frames
            .iter()
            .rev()
            .filter_map(|f| f.wait.as_ref())
            .find(pending);
        match saved {
            Some(wait) => {
                wait.outcome.set(WaitOutcome::Ended { result });
                true
            }
            None => false,
        }
    }

    /// Makes a thread whose wait has ended runnable again.
    pub fn wake_up_thread(&mut self, memory: &mut Memory, tid: Uid) -> bool {
        let Some(thread) = self.objects.get_mut::<Thread>(tid) else {
            return false;
        };
        let Some(result) = thread.wait.as_ref().and_then(WaitState::result) else {
            warn!("thread {} woken before its wait ended", thread.name);
            return false;
        };
        let Some(wait) = thread.wait.take() else {
            return false;
        };
        thread.allow_callbacks = false;
        thread.context.set_register(REG_V0, result);
        match thread.status {
            ThreadStatus::Waiting => {
                thread.status = ThreadStatus::Ready;
                let priority = thread.priority;
                self.ready.push_back(priority, tid);
            }
            ThreadStatus::WaitSuspend => thread.status = ThreadStatus::Suspended,
            other => warn!("waking thread {} in state {other:?}", thread.name),
        }
        self.cancel_timeout(memory, &wait);
        self.needs_reschedule = true;
        true
    }

    /// Unschedules the timeout of `wait` and reports the time left to the
    /// guest.
    pub(super) fn cancel_timeout(&mut self, memory: &mut Memory, wait: &WaitState) {
        let Some(handle) = wait.timeout else {
            return;
        };
        let Some(remaining) = self.timer.unschedule(handle) else {
            return;
        };
        if wait.timeout_ptr != 0 {
            let us = self.timer.cycles_to_us(remaining);
            memory.write_u32(wait.timeout_ptr, u32::try_from(us).unwrap_or(u32::MAX));
        }
    }

    pub(super) fn handle_wait_timeout(&mut self, memory: &mut Memory, tid: Uid, kind: WaitType, id: Uid) {
        let Some(thread) = self.objects.get_mut::<Thread>(tid) else {
            return;
        };
        let timed_out = thread
            .wait
            .iter_mut()
            .chain(thread.callback_frames.iter_mut().filter_map(|f| f.wait.as_mut()))
            .find(|w| w.matches(kind, id) && w.result().is_none());
        let Some(wait) = timed_out else {
            return;
        };
        debug!("thread {} timed out on {kind:?} {id:#x}", thread.name);
        wait.timeout = None;
        if wait.timeout_ptr != 0 {
            memory.write_u32(wait.timeout_ptr, 0);
        }
        self.detach_waiter(memory, tid, kind, id);
        self.end_wait(memory, tid, kind, id, error::WAIT_TIMEOUT);
        self.process_wait_queue(memory, kind, id);
    }

    /// Drops `tid` from the wait list of the object it waits on.
    pub(super) fn detach_waiter(&mut self, memory: &mut Memory, tid: Uid, kind: WaitType, id: Uid) {
        match kind {
            WaitType::Semaphore => {
                if let Some(sema) = self.objects.get_mut::<Semaphore>(id) {
                    sema.waiters.retain(|w| w.thread != tid);
                }
            }
            WaitType::Mutex => {
                if let Some(mutex) = self.objects.get_mut::<Mutex>(id) {
                    mutex.waiters.retain(|w| w.thread != tid);
                }
            }
            WaitType::EventFlag => {
                if let Some(flag) = self.objects.get_mut::<EventFlag>(id) {
                    let pattern = flag.pattern;
                    flag.waiters.retain(|w| {
                        if w.thread == tid && w.out_bits_ptr != 0 {
                            memory.write_u32(w.out_bits_ptr, pattern);
                        }
                        w.thread != tid
                    });
                }
            }
            WaitType::ThreadEnd => {
                if let Some(target) = self.objects.get_mut::<Thread>(id) {
                    target.end_waiters.retain(|w| *w != tid);
                }
            }
            WaitType::VBlank => self.vblank_waiters.retain(|w| *w != tid),
            _ => {}
        }
    }

    /// Lets a primitive hand itself to whoever can take it now.
    pub(super) fn process_wait_queue(&mut self, memory: &mut Memory, kind: WaitType, id: Uid) {
        match kind {
            WaitType::Semaphore => self.process_semaphore_waiters(memory, id),
            WaitType::Mutex => self.hand_off_mutex(memory, id),
            WaitType::EventFlag => self.process_event_flag_waiters(memory, id),
            _ => {}
        }
    }

    pub(super) fn thread_priority(&self, uid: Uid) -> u32 {
        self.objects
            .get::<Thread>(uid)
            .map_or(u32::MAX, |t| t.priority)
    }

    /// Picks the thread that should own the CPU and switches to it.
    ///
    /// Without `force` the current thread keeps running unless something of
    /// strictly better priority can run. Does nothing inside an interrupt.
    pub fn reschedule(&mut self, cpu: &mut Cpu, force: bool) {
        self.needs_reschedule = false;
        if self.interrupts.in_interrupt() {
            return;
        }
        if !force && self.keep_current(cpu) {
            return;
        }
        if let Some(current) = self.current.take() {
            self.switch_out(cpu, current);
        }
        match self.select_next() {
            Some(next) => self.switch_in(cpu, next),
            None => trace!("no runnable thread"),
        }
    }

    fn keep_current(&mut self, cpu: &mut Cpu) -> bool {
        let Some(uid) = self.current else {
            return false;
        };
        let Some(thread) = self.objects.get::<Thread>(uid) else {
            self.current = None;
            return false;
        };
        if thread.status != ThreadStatus::Running {
            return false;
        }
        let run_callback = thread.allow_callbacks && !thread.pending_callbacks.is_empty();
        let priority = thread.priority;
        if self.best_candidate().is_some_and(|(p, _)| p < priority) {
            return false;
        }
        if run_callback {
            self.inject_callback(cpu, uid);
        }
        true
    }

    /// Best READY thread or WAITING thread with a callback to run, by
    /// priority. Ready threads win ties.
    fn best_candidate(&self) -> Option<(u32, Uid)> {
        let ready = self.ready.first();
        let callback_waiter = self
            .threads
            .iter()
            .filter_map(|uid| {
                let t = self.objects.get::<Thread>(*uid)?;
                let wants = t.status == ThreadStatus::Waiting
                    && t.allow_callbacks
                    && !t.pending_callbacks.is_empty();
                wants.then_some((t.priority, *uid))
            })
            .min_by_key(|(priority, _)| *priority);
        match (ready, callback_waiter) {
            (Some(r), Some(c)) => Some(if c.0 < r.0 { c } else { r }),
            (r, c) => r.or(c),
        }
    }

    fn select_next(&self) -> Option<Uid> {
        self.best_candidate().map(|(_, uid)| uid)
    }

    fn switch_out(&mut self, cpu: &Cpu, uid: Uid) {
        let Some(thread) = self.objects.get_mut::<Thread>(uid) else {
            return;
        };
        thread.context = cpu.state.clone();
        if thread.status == ThreadStatus::Running {
            thread.status = ThreadStatus::Ready;
            let priority = thread.priority;
            self.ready.push_front(priority, uid);
        }
    }

    fn switch_in(&mut self, cpu: &mut Cpu, uid: Uid) {
        let Some(thread) = self.objects.get_mut::<Thread>(uid) else {
            return;
        };
        if thread.status == ThreadStatus::Ready {
            let priority = thread.priority;
            self.ready.remove(priority, uid);
            thread.status = ThreadStatus::Running;
        }
        cpu.state = thread.context.clone();
        let run_callback = thread.allow_callbacks && !thread.pending_callbacks.is_empty();
        trace!("switching to thread {} ({uid:#x}) at {:#010x}", thread.name, cpu.state.pc);
        self.current = Some(uid);
        if run_callback {
            self.inject_callback(cpu, uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{setup, spawn};
    use pretty_assertions::assert_eq;

    /// Every READY thread is queued exactly once at its priority and nothing
    /// else is queued.
    fn assert_ready_queue_consistent(kernel: &Kernel) {
        let mut ready = 0;
        for uid in kernel.threads() {
            let thread = kernel.objects.get::<Thread>(*uid).unwrap();
            let queued = kernel.ready.contains(thread.priority, *uid);
            assert_eq!(queued, thread.status == ThreadStatus::Ready, "{}", thread.name);
            ready += usize::from(queued);
        }
        assert_eq!(kernel.ready.len(), ready);
    }

    #[test]
    fn ready_queue_is_fifo_per_level() {
        let mut queue = ReadyQueue::default();
        queue.push_back(0x20, 1);
        queue.push_back(0x20, 2);
        queue.push_back(0x10, 3);
        assert_eq!(queue.first(), Some((0x10, 3)));
        assert_eq!(queue.pop_first(), Some(3));
        queue.rotate(0x20);
        assert_eq!(queue.first(), Some((0x20, 2)));
        queue.push_front(0x20, 4);
        assert_eq!(queue.pop_first(), Some(4));
        assert!(queue.remove(0x20, 1));
        assert!(!queue.remove(0x20, 1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn higher_priority_thread_preempts() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let low = spawn(&mut kernel, &mut memory, "low", 0x30);
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));

        let high = spawn(&mut kernel, &mut memory, "high", 0x10);
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(high));
        assert_ready_queue_consistent(&kernel);

        // The preempted thread resumes before its older peers.
        kernel.exit_thread(&mut memory, 0).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_ready_queue_consistent(&kernel);
        assert_eq!(kernel.objects.get::<Thread>(low).unwrap().status, ThreadStatus::Ready);
    }

    #[test]
    fn context_survives_a_switch() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        cpu.state.set_register(REG_V0, 0x1234);
        let other = spawn(&mut kernel, &mut memory, "other", 0x20);
        kernel.rotate_thread_ready_queue(0).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(other));
        assert_eq!(cpu.state.register(REG_V0), 0);

        kernel.rotate_thread_ready_queue(0).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.state.register(REG_V0), 0x1234);
        assert_ready_queue_consistent(&kernel);
    }

    #[test]
    fn wake_requires_an_ended_wait() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let cell = kernel.wait_current_thread(WaitType::Sleep, 0, false).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert!(!kernel.wake_up_thread(&mut memory, main));

        cell.set(WaitOutcome::Ended { result: 5 });
        assert!(kernel.wake_up_thread(&mut memory, main));
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.state.register(REG_V0), 5);
        assert_ready_queue_consistent(&kernel);
    }

    #[test]
    fn waiting_inside_an_interrupt_is_illegal() {
        let (mut kernel, mut cpu, _memory, _main) = setup();
        kernel.register_sub_interrupt(30, 0, 0x0880_0000, 0).unwrap();
        kernel.interrupts.set_enabled(30, 0, true).unwrap();
        kernel.interrupts.trigger(30);
        assert!(kernel.deliver_interrupt(&mut cpu));
        assert_eq!(
            kernel.wait_current_thread(WaitType::Sleep, 0, false).err(),
            Some(error::ILLEGAL_CONTEXT)
        );
    }

    #[test]
    fn timeouts_report_remaining_time() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let timeout_ptr = 0x0880_1000;
        memory.write_u32(timeout_ptr, 1000);
        let sema = kernel.create_semaphore("s", 0, 0, 1).unwrap();
        kernel.wait_semaphore(&memory, sema, 1, timeout_ptr, false).unwrap();
        kernel.reschedule(&mut cpu, false);

        kernel.timer.advance(kernel.timer.us_to_cycles(400));
        kernel.signal_semaphore(&mut memory, sema, 1).unwrap();
        assert_eq!(memory.read_u32(timeout_ptr), 600);
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.state.register(REG_V0), error::OK);
    }
}
