//! # Interrupts
//!
//! Guest code can hook sub-interrupts of a few hardware lines. When a line
//! fires, each enabled handler is queued and later entered on the kernel's
//! interrupt stack, on top of whatever was running:
//!
//! ```text
//!   trigger(line) ──▶ pending (line, sub) ──▶ deliver ──▶ handler(sub, arg)
//!                                               │            │
//!                                    save CpuState ◀──────── jr ra (return stub)
//! ```
//!
//! Only one handler runs at a time and the scheduler stays frozen while it
//! does.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace, warn};

use crate::cpu::registers::{REG_A0, REG_A1, REG_GP, REG_RA, REG_SP};
use crate::cpu::{Cpu, CpuState};
use crate::memory::allocator::BlockAllocator;

use super::error;
use super::object::Uid;
use super::{INTERRUPT_RETURN_ADDRESS, Kernel};

pub const GE_INTERRUPT: u32 = 25;
pub const VBLANK_INTERRUPT: u32 = 30;
pub const MAX_INTERRUPT: u32 = 67;

const INTERRUPT_STACK_SIZE: u32 = 0x4000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubInterruptHandler {
    pub handler: u32,
    pub arg: u32,
    pub gp: u32,
    pub enabled: bool,
}

struct InterruptFrame {
    context: CpuState,
    thread: Option<Uid>,
}

#[derive(Default)]
pub struct InterruptManager {
    handlers: BTreeMap<(u32, u32), SubInterruptHandler>,
    pending: VecDeque<(u32, u32)>,
    frame: Option<InterruptFrame>,
    suspended: bool,
    stack_top: u32,
}

impl InterruptManager {
    /// Reserves the stack handlers run on.
    pub fn allocate_stack(&mut self, allocator: &mut BlockAllocator) {
        match allocator.alloc(INTERRUPT_STACK_SIZE, true, "interrupt stack") {
            Some(address) => self.stack_top = address + INTERRUPT_STACK_SIZE,
            None => warn!("no room for the interrupt stack"),
        }
    }

    pub fn register(&mut self, line: u32, sub: u32, handler: u32, arg: u32, gp: u32) -> Result<(), u32> {
        if line >= MAX_INTERRUPT {
            return Err(error::INTR_ILLEGAL_NUMBER);
        }
        if self.handlers.contains_key(&(line, sub)) {
            return Err(error::INTR_FOUND_HANDLER);
        }
        debug!("sub-interrupt {line}/{sub} -> {handler:#010x}");
        self.handlers.insert(
            (line, sub),
            SubInterruptHandler {
                handler,
                arg,
                gp,
                enabled: false,
            },
        );
        Ok(())
    }

    pub fn release(&mut self, line: u32, sub: u32) -> Result<(), u32> {
        if line >= MAX_INTERRUPT {
            return Err(error::INTR_ILLEGAL_NUMBER);
        }
        self.handlers
            .remove(&(line, sub))
            .map(|_| ())
            .ok_or(error::INTR_NOT_FOUND_HANDLER)
    }

    pub fn set_enabled(&mut self, line: u32, sub: u32, enabled: bool) -> Result<(), u32> {
        if line >= MAX_INTERRUPT {
            return Err(error::INTR_ILLEGAL_NUMBER);
        }
        let handler = self
            .handlers
            .get_mut(&(line, sub))
            .ok_or(error::INTR_NOT_FOUND_HANDLER)?;
        handler.enabled = enabled;
        Ok(())
    }

    /// Queues every enabled handler of `line`.
    pub fn trigger(&mut self, line: u32) {
        let subs = self
            .handlers
            .range((line, 0)..=(line, u32::MAX))
            .filter(|(_, h)| h.enabled)
            .map(|(key, _)| *key);
        self.pending.extend(subs);
    }

    #[must_use]
    pub fn is_registered(&self, line: u32, sub: u32) -> bool {
        self.handlers.contains_key(&(line, sub))
    }

    #[must_use]
    pub fn has_handlers(&self) -> bool {
        self.handlers.values().any(|h| h.enabled)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    #[must_use]
    pub const fn in_interrupt(&self) -> bool {
        self.frame.is_some()
    }

    /// Blocks delivery. Returns the previous state as the flag word
    /// `sceKernelCpuSuspendIntr` hands out: 1 if interrupts were enabled.
    pub fn suspend(&mut self) -> u32 {
        let was_enabled = !self.suspended;
        self.suspended = true;
        u32::from(was_enabled)
    }

    pub fn resume(&mut self, flags: u32) {
        if flags != 0 {
            self.suspended = false;
        }
    }

    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.suspended
    }
}

impl Kernel {
    pub fn register_sub_interrupt(&mut self, line: u32, sub: u32, handler: u32, arg: u32) -> Result<(), u32> {
        let gp = self.module_gp;
        self.interrupts.register(line, sub, handler, arg, gp)
    }

    /// Enters the next pending handler on top of the live context. Returns
    /// `false` when nothing was delivered.
    pub fn deliver_interrupt(&mut self, cpu: &mut Cpu) -> bool {
        let interrupts = &mut self.interrupts;
        if interrupts.in_interrupt() || interrupts.suspended {
            return false;
        }
        while let Some(key) = interrupts.pending.pop_front() {
            let Some(handler) = interrupts.handlers.get(&key).filter(|h| h.enabled).copied() else {
                continue;
            };
            trace!("delivering sub-interrupt {}/{} to {:#010x}", key.0, key.1, handler.handler);
            interrupts.frame = Some(InterruptFrame {
                context: cpu.state.clone(),
                thread: self.current,
            });
            cpu.state.set_pc(handler.handler);
            cpu.state.set_register(REG_A0, key.1);
            cpu.state.set_register(REG_A1, handler.arg);
            cpu.state.set_register(REG_SP, interrupts.stack_top - 0x10);
            cpu.state.set_register(REG_GP, handler.gp);
            cpu.state.set_register(REG_RA, INTERRUPT_RETURN_ADDRESS);
            return true;
        }
        false
    }

    /// Restores the context the handler interrupted.
    pub fn return_from_interrupt(&mut self, cpu: &mut Cpu) {
        let Some(frame) = self.interrupts.frame.take() else {
            warn!("interrupt return stub reached outside an interrupt");
            return;
        };
        cpu.state = frame.context;
        self.current = frame.thread;
        self.needs_reschedule = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::setup;
    use pretty_assertions::assert_eq;

    const HANDLER: u32 = 0x0880_4000;

    #[test]
    fn registration_errors() {
        let mut interrupts = InterruptManager::default();
        assert_eq!(interrupts.register(MAX_INTERRUPT, 0, HANDLER, 0, 0), Err(error::INTR_ILLEGAL_NUMBER));
        interrupts.register(VBLANK_INTERRUPT, 1, HANDLER, 0, 0).unwrap();
        assert_eq!(
            interrupts.register(VBLANK_INTERRUPT, 1, HANDLER, 0, 0),
            Err(error::INTR_FOUND_HANDLER)
        );
        assert_eq!(interrupts.set_enabled(VBLANK_INTERRUPT, 2, true), Err(error::INTR_NOT_FOUND_HANDLER));
        assert!(!interrupts.has_handlers());
        interrupts.set_enabled(VBLANK_INTERRUPT, 1, true).unwrap();
        assert!(interrupts.has_handlers());
        interrupts.release(VBLANK_INTERRUPT, 1).unwrap();
        assert_eq!(interrupts.release(VBLANK_INTERRUPT, 1), Err(error::INTR_NOT_FOUND_HANDLER));
    }

    #[test]
    fn only_enabled_handlers_are_queued() {
        let mut interrupts = InterruptManager::default();
        interrupts.register(VBLANK_INTERRUPT, 0, HANDLER, 0, 0).unwrap();
        interrupts.register(VBLANK_INTERRUPT, 1, HANDLER, 0, 0).unwrap();
        interrupts.register(GE_INTERRUPT, 0, HANDLER, 0, 0).unwrap();
        interrupts.set_enabled(VBLANK_INTERRUPT, 1, true).unwrap();
        interrupts.set_enabled(GE_INTERRUPT, 0, true).unwrap();
        interrupts.trigger(VBLANK_INTERRUPT);
        assert_eq!(interrupts.pending, VecDeque::from([(VBLANK_INTERRUPT, 1)]));
    }

    #[test]
    fn delivery_saves_and_restores_the_context() {
        let (mut kernel, mut cpu, _memory, main) = setup();
        kernel.register_sub_interrupt(VBLANK_INTERRUPT, 3, HANDLER, 0x77).unwrap();
        kernel.interrupts.set_enabled(VBLANK_INTERRUPT, 3, true).unwrap();
        let pc = cpu.state.pc;

        let flags = kernel.interrupts.suspend();
        kernel.interrupts.trigger(VBLANK_INTERRUPT);
        assert!(!kernel.deliver_interrupt(&mut cpu));
        kernel.interrupts.resume(flags);

        assert!(kernel.deliver_interrupt(&mut cpu));
        assert!(kernel.interrupts.in_interrupt());
        assert_eq!(cpu.state.pc, HANDLER);
        assert_eq!(cpu.state.register(REG_A0), 3);
        assert_eq!(cpu.state.register(REG_A1), 0x77);
        assert_eq!(cpu.state.register(REG_RA), INTERRUPT_RETURN_ADDRESS);

        kernel.return_from_interrupt(&mut cpu);
        assert!(!kernel.interrupts.in_interrupt());
        assert_eq!(cpu.state.pc, pc);
        assert_eq!(kernel.current_thread(), Some(main));
        assert!(kernel.reschedule_pending());
    }
}
