//! # Callbacks
//!
//! A callback belongs to the thread that created it and only ever runs on
//! that thread, at a point where the thread allows it: inside a `...CB`
//! wait or in `sceKernelCheckCallback`.
//!
//! Running one borrows the thread's context:
//!
//! ```text
//!   thread registers ──push──▶ CallbackFrame { context, wait, status }
//!   pc = entry, a0 = count, a1 = arg, a2 = common, ra = return stub
//!        ...callback runs...
//!   jr ra ─▶ return stub ─▶ pop frame
//!        wait ended meanwhile? ──yes──▶ resume with its result
//!                              ──no───▶ back to waiting
//! ```

use tracing::{debug, trace, warn};

use crate::cpu::Cpu;
use crate::cpu::registers::{REG_A0, REG_A1, REG_A2, REG_RA, REG_V0};
use crate::memory::Memory;

use super::error;
use super::object::Uid;
use super::thread::{CallbackFrame, Thread, ThreadStatus};
use super::{CALLBACK_RETURN_ADDRESS, Kernel};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Callback {
    pub name: String,
    pub thread: Uid,
    pub entry: u32,
    pub common: u32,
    pub notify_count: u32,
    pub notify_arg: u32,
}

impl Kernel {
    /// Creates a callback owned by the current thread.
    pub fn create_callback(&mut self, name: &str, entry: u32, common: u32) -> Result<Uid, u32> {
        let thread = self.current.ok_or(error::ILLEGAL_CONTEXT)?;
        let callback = Callback {
            name: name.to_string(),
            thread,
            entry,
            common,
            notify_count: 0,
            notify_arg: 0,
        };
        let uid = self.objects.create(callback).ok_or(error::NO_MEMORY)?;
        if let Some(owner) = self.objects.get_mut::<Thread>(thread) {
            owner.callbacks.push(uid);
        }
        debug!("created callback {name} ({uid:#x}) entry {entry:#010x}");
        Ok(uid)
    }

    pub fn delete_callback(&mut self, uid: Uid) -> Result<(), u32> {
        let callback = self.objects.destroy_as::<Callback>(uid).ok_or(error::UNKNOWN_CBID)?;
        if let Some(owner) = self.objects.get_mut::<Thread>(callback.thread) {
            owner.callbacks.retain(|c| *c != uid);
            owner.pending_callbacks.retain(|c| *c != uid);
        }
        if self.exit_callback == Some(uid) {
            self.exit_callback = None;
        }
        Ok(())
    }

    /// Records a notification. The callback runs once its thread allows it.
    pub fn notify_callback(&mut self, uid: Uid, arg: u32) -> Result<(), u32> {
        let callback = self.objects.get_mut::<Callback>(uid).ok_or(error::UNKNOWN_CBID)?;
        callback.notify_count += 1;
        callback.notify_arg = arg;
        let owner = callback.thread;
        if let Some(thread) = self.objects.get_mut::<Thread>(owner) {
            if !thread.pending_callbacks.contains(&uid) {
                thread.pending_callbacks.push_back(uid);
            }
        }
        self.needs_reschedule = true;
        Ok(())
    }

    pub fn cancel_callback(&mut self, uid: Uid) -> Result<(), u32> {
        let callback = self.objects.get_mut::<Callback>(uid).ok_or(error::UNKNOWN_CBID)?;
        callback.notify_count = 0;
        let owner = callback.thread;
        if let Some(thread) = self.objects.get_mut::<Thread>(owner) {
            thread.pending_callbacks.retain(|c| *c != uid);
        }
        Ok(())
    }

    pub fn get_callback_count(&self, uid: Uid) -> Result<u32, u32> {
        self.objects
            .get::<Callback>(uid)
            .map(|c| c.notify_count)
            .ok_or(error::UNKNOWN_CBID)
    }

    /// Lets the current thread run its pending callbacks at the next
    /// reschedule. Returns 1 if there were any.
    pub fn check_callbacks(&mut self) -> u32 {
        let Some(thread) = self.current.and_then(|t| self.objects.get_mut::<Thread>(t)) else {
            return 0;
        };
        if thread.pending_callbacks.is_empty() {
            return 0;
        }
        thread.allow_callbacks = true;
        self.needs_reschedule = true;
        1
    }

    /// Runs the next pending callback of `tid` on top of its live context.
    pub(super) fn inject_callback(&mut self, cpu: &mut Cpu, tid: Uid) -> bool {
        loop {
            let Some(uid) = self
                .objects
                .get::<Thread>(tid)
                .and_then(|t| t.pending_callbacks.front().copied())
            else {
                return false;
            };
            let callback = self.objects.get_mut::<Callback>(uid).map(|c| {
                let taken = (c.entry, c.notify_count, c.notify_arg, c.common);
                c.notify_count = 0;
                c.notify_arg = 0;
                taken
            });
            let Some(thread) = self.objects.get_mut::<Thread>(tid) else {
                return false;
            };
            thread.pending_callbacks.pop_front();
            let Some((entry, count, arg, common)) = callback else {
                warn!("dropping stale callback {uid:#x}");
                continue;
            };

            trace!("running callback {uid:#x} on thread {}", thread.name);
            thread.callback_frames.push(CallbackFrame {
                context: cpu.state.clone(),
                wait: thread.wait.take(),
                status: thread.status,
                callback: uid,
            });
            thread.status = ThreadStatus::Running;
            cpu.state.set_pc(entry);
            cpu.state.set_register(REG_A0, count);
            cpu.state.set_register(REG_A1, arg);
            cpu.state.set_register(REG_A2, common);
            cpu.state.set_register(REG_RA, CALLBACK_RETURN_ADDRESS);
            return true;
        }
    }

    /// Handles a callback reaching the return stub. A non-zero `v0` deletes
    /// the callback.
    pub fn return_from_callback(&mut self, cpu: &mut Cpu, memory: &mut Memory) {
        let Some(tid) = self.current else {
            warn!("callback returned without a current thread");
            return;
        };
        let delete = cpu.state.register(REG_V0) != 0;
        let Some(thread) = self.objects.get_mut::<Thread>(tid) else {
            return;
        };
        let Some(frame) = thread.callback_frames.pop() else {
            warn!("thread {} hit the callback return stub outside a callback", thread.name);
            return;
        };
        cpu.state = frame.context;

        match frame.wait {
            None => thread.status = frame.status,
            Some(wait) => match wait.result() {
                Some(result) => {
                    thread.status = ThreadStatus::Running;
                    thread.allow_callbacks = false;
                    cpu.state.set_register(REG_V0, result);
                    self.cancel_timeout(memory, &wait);
                }
                None => {
                    thread.wait = Some(wait);
                    thread.status = ThreadStatus::Waiting;
                }
            },
        }
        let done = self
            .objects
            .get_mut::<Thread>(tid)
            .filter(|t| t.status == ThreadStatus::Running && t.pending_callbacks.is_empty());
        if let Some(thread) = done {
            thread.allow_callbacks = false;
        }
        if delete {
            debug!("callback {:#x} asked to be deleted", frame.callback);
            if let Err(code) = self.delete_callback(frame.callback) {
                debug!("callback {:#x} already gone ({code:#010x})", frame.callback);
            }
        }
        self.needs_reschedule = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{setup, spawn};
    use crate::kernel::thread::WaitType;
    use pretty_assertions::assert_eq;

    const ENTRY: u32 = 0x0880_4000;

    #[test]
    fn notify_counts_and_cancel() {
        let (mut kernel, ..) = setup();
        let uid = kernel.create_callback("cb", ENTRY, 0x1234).unwrap();
        kernel.notify_callback(uid, 1).unwrap();
        kernel.notify_callback(uid, 2).unwrap();
        assert_eq!(kernel.get_callback_count(uid), Ok(2));
        kernel.cancel_callback(uid).unwrap();
        assert_eq!(kernel.get_callback_count(uid), Ok(0));
        assert_eq!(kernel.check_callbacks(), 0);
        kernel.delete_callback(uid).unwrap();
        assert_eq!(kernel.get_callback_count(uid), Err(error::UNKNOWN_CBID));
    }

    #[test]
    fn check_callback_runs_on_the_current_thread() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let uid = kernel.create_callback("cb", ENTRY, 0x1234).unwrap();
        kernel.notify_callback(uid, 0x55).unwrap();
        cpu.state.set_pc(0x0880_0100);
        assert_eq!(kernel.check_callbacks(), 1);

        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.state.pc, ENTRY);
        assert_eq!(cpu.state.register(REG_A0), 1);
        assert_eq!(cpu.state.register(REG_A1), 0x55);
        assert_eq!(cpu.state.register(REG_A2), 0x1234);
        assert_eq!(cpu.state.register(REG_RA), CALLBACK_RETURN_ADDRESS);
        assert_eq!(kernel.get_callback_count(uid), Ok(0));

        cpu.state.set_register(REG_V0, 0);
        kernel.return_from_callback(&mut cpu, &mut memory);
        assert_eq!(cpu.state.pc, 0x0880_0100);
        assert!(kernel.get_callback_count(uid).is_ok());
    }

    #[test]
    fn callback_deleted_while_running_still_returns() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let uid = kernel.create_callback("cb", ENTRY, 0).unwrap();
        kernel.notify_callback(uid, 0).unwrap();
        cpu.state.set_pc(0x0880_0100);
        assert_eq!(kernel.check_callbacks(), 1);
        kernel.reschedule(&mut cpu, false);
        assert_eq!(cpu.state.pc, ENTRY);

        kernel.delete_callback(uid).unwrap();
        cpu.state.set_register(REG_V0, 1);
        kernel.return_from_callback(&mut cpu, &mut memory);
        assert_eq!(cpu.state.pc, 0x0880_0100);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(kernel.objects.get::<Thread>(main).unwrap().status, ThreadStatus::Running);
        assert_eq!(kernel.get_callback_count(uid), Err(error::UNKNOWN_CBID));
    }

    #[test]
    fn callback_in_a_wait_returns_to_the_wait() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let uid = kernel.create_callback("cb", ENTRY, 0).unwrap();
        kernel.sleep_thread(true).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), None);

        kernel.notify_callback(uid, 0).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.state.pc, ENTRY);

        // A non-zero return value deletes the callback.
        cpu.state.set_register(REG_V0, 1);
        kernel.return_from_callback(&mut cpu, &mut memory);
        let thread = kernel.objects.get::<Thread>(main).unwrap();
        assert_eq!(thread.status, ThreadStatus::Waiting);
        assert_eq!(thread.wait_type(), WaitType::Sleep);
        assert_eq!(kernel.get_callback_count(uid), Err(error::UNKNOWN_CBID));
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), None);
    }

    #[test]
    fn wait_ended_during_callback_wakes_on_return() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let uid = kernel.create_callback("cb", ENTRY, 0).unwrap();
        let other = spawn(&mut kernel, &mut memory, "other", 0x30);
        kernel.sleep_thread(true).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(other));

        kernel.notify_callback(uid, 0).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.state.pc, ENTRY);

        assert!(kernel.end_wait(&mut memory, main, WaitType::Sleep, 0, error::OK));
        cpu.state.set_register(REG_V0, 0);
        kernel.return_from_callback(&mut cpu, &mut memory);
        let thread = kernel.objects.get::<Thread>(main).unwrap();
        assert_eq!(thread.status, ThreadStatus::Running);
        assert_eq!(cpu.state.register(REG_V0), error::OK);
        assert_ne!(cpu.state.pc, ENTRY);
    }
}
