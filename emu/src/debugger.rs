//! # Debugger
//!
//! Breakpoints and state inspection on top of a [`System`]. Nothing here
//! reaches into emulator internals: everything goes through the public
//! fields and [`System::step`], so the debugger can be dropped at any time.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::kernel::object::Uid;
use crate::system::{RunOutcome, System};

/// Type of breakpoint condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakpointKind {
    /// Break when PC equals the address.
    Equal,
    /// Break when PC is greater than the address.
    GreaterThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Breakpoint {
    address: u32,
    kind: BreakpointKind,
}

impl Breakpoint {
    const fn matches(&self, pc: u32) -> bool {
        match self.kind {
            BreakpointKind::Equal => pc == self.address,
            BreakpointKind::GreaterThan => pc > self.address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Gpr(usize),
    Pc,
    Hi,
    Lo,
}

/// Registers and counters at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub registers: [u32; 32],
    pub pc: u32,
    pub hi: u32,
    pub lo: u32,
    pub instructions: u64,
    pub frame: u64,
    pub thread: Option<Uid>,
}

#[derive(Debug, Default)]
pub struct Debugger {
    breakpoints: BTreeSet<Breakpoint>,
}

impl Debugger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_breakpoint(&mut self, address: u32, kind: BreakpointKind) {
        debug!("breakpoint {kind:?} {address:#010x}");
        self.breakpoints.insert(Breakpoint { address, kind });
    }

    /// Removes every breakpoint at `address`, whatever its kind.
    pub fn remove_breakpoint(&mut self, address: u32) {
        self.breakpoints.retain(|b| b.address != address);
    }

    /// Active breakpoints sorted by address.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<(u32, BreakpointKind)> {
        self.breakpoints.iter().map(|b| (b.address, b.kind)).collect()
    }

    fn check_breakpoint(&self, pc: u32) -> Option<Breakpoint> {
        self.breakpoints.iter().find(|b| b.matches(pc)).copied()
    }

    #[must_use]
    pub fn read_register(system: &System, register: Register) -> Option<u32> {
        let state = &system.cpu.state;
        match register {
            Register::Gpr(index) => state.gpr.get(index).copied(),
            Register::Pc => Some(state.pc),
            Register::Hi => Some(state.hi),
            Register::Lo => Some(state.lo),
        }
    }

    /// Returns `false` for a register that does not exist. Writing `pc`
    /// drops a pending delay slot.
    pub fn write_register(system: &mut System, register: Register, value: u32) -> bool {
        let state = &mut system.cpu.state;
        match register {
            Register::Gpr(index) if index < state.gpr.len() => state.set_register(index, value),
            Register::Gpr(_) => return false,
            Register::Pc => state.set_pc(value),
            Register::Hi => state.hi = value,
            Register::Lo => state.lo = value,
        }
        true
    }

    /// Copies `len` bytes of guest memory, or `None` if any of them is
    /// unmapped.
    #[must_use]
    pub fn read_memory(system: &System, address: u32, len: usize) -> Option<Vec<u8>> {
        system.memory.slice(address, len).map(<[u8]>::to_vec)
    }

    #[must_use]
    pub fn snapshot(system: &System) -> Snapshot {
        let state = &system.cpu.state;
        Snapshot {
            registers: state.gpr,
            pc: state.pc,
            hi: state.hi,
            lo: state.lo,
            instructions: system.cpu.instructions(),
            frame: system.kernel.frame_count(),
            thread: system.kernel.current_thread(),
        }
    }

    /// Runs `count` steps, ignoring breakpoints. Returns early if the
    /// machine stops.
    pub fn step(&self, system: &mut System, count: u32) -> Option<RunOutcome> {
        (0..count).find_map(|_| system.step())
    }

    /// Runs until a breakpoint matches the next `pc` or the machine stops.
    /// The instruction at `pc` itself never triggers, so continuing from a
    /// breakpoint makes progress.
    pub fn continue_run(&self, system: &mut System, max_instructions: Option<u64>) -> RunOutcome {
        let mut steps = 0;
        loop {
            if max_instructions.is_some_and(|max| steps >= max) {
                return RunOutcome::Limit;
            }
            if let Some(outcome) = system.step() {
                return outcome;
            }
            steps += 1;
            let pc = system.cpu.state.pc;
            if let Some(bp) = self.check_breakpoint(pc) {
                info!("breakpoint {:?} {:#010x} hit at {pc:#010x}", bp.kind, bp.address);
                return RunOutcome::Breakpoint(pc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kernel::module::tests::{BASE, build_elf};
    use pretty_assertions::assert_eq;

    fn counting_loop() -> System {
        let mut system = System::new(Config::default());
        // addiu $t0, $t0, 1 ; beq $zero, $zero, -2 ; nop
        let code = [0x2508_0001, 0x1000_FFFE, 0x0000_0000];
        system.load_executable(&build_elf(&code, false)).unwrap();
        system
    }

    #[test]
    fn breakpoints_stop_before_the_instruction() {
        let mut system = counting_loop();
        let mut debugger = Debugger::new();
        debugger.add_breakpoint(BASE + 4, BreakpointKind::Equal);

        assert_eq!(debugger.continue_run(&mut system, Some(100)), RunOutcome::Breakpoint(BASE + 4));
        assert_eq!(Debugger::read_register(&system, Register::Gpr(8)), Some(1));
        assert_eq!(debugger.continue_run(&mut system, Some(100)), RunOutcome::Breakpoint(BASE + 4));
        assert_eq!(Debugger::read_register(&system, Register::Gpr(8)), Some(2));

        debugger.remove_breakpoint(BASE + 4);
        debugger.add_breakpoint(BASE + 8, BreakpointKind::GreaterThan);
        assert_eq!(debugger.continue_run(&mut system, Some(100)), RunOutcome::Limit);
        assert_eq!(debugger.breakpoints(), vec![(BASE + 8, BreakpointKind::GreaterThan)]);
    }

    #[test]
    fn registers_and_memory_are_editable() {
        let mut system = counting_loop();
        let debugger = Debugger::new();
        assert_eq!(debugger.step(&mut system, 4), None);
        let snapshot = Debugger::snapshot(&system);
        assert_eq!(snapshot.instructions, 4);
        assert!(snapshot.thread.is_some());
        assert_eq!(snapshot.registers[8], 2);

        assert!(Debugger::write_register(&mut system, Register::Gpr(8), 40));
        assert!(Debugger::write_register(&mut system, Register::Gpr(0), 40));
        assert!(!Debugger::write_register(&mut system, Register::Gpr(32), 1));
        assert!(Debugger::write_register(&mut system, Register::Pc, BASE));
        debugger.step(&mut system, 1);
        assert_eq!(Debugger::read_register(&system, Register::Gpr(8)), Some(41));
        assert_eq!(Debugger::read_register(&system, Register::Gpr(0)), Some(0));
        assert_eq!(Debugger::read_register(&system, Register::Gpr(40)), None);

        assert_eq!(
            Debugger::read_memory(&system, BASE, 4),
            Some(0x2508_0001u32.to_le_bytes().to_vec())
        );
        assert_eq!(Debugger::read_memory(&system, 0, 4), None);
    }
}
