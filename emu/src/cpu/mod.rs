//! # Allegrex CPU
//!
//! A straightforward interpreter: fetch the word at `pc`, advance the
//! `pc`/`next_pc` pair (which models the branch delay slot), execute.
//!
//! ```text
//!           step()
//!   ┌──────────────────────┐
//!   │ fetch  mem[pc]       │
//!   │ pc      <- next_pc   │   a taken branch rewrites next_pc,
//!   │ next_pc <- next_pc+4 │   so the delay slot still executes
//!   │ execute(op)          │
//!   └──────────┬───────────┘
//!              │
//!              ▼
//!   Step::Continue | Syscall(code) | Break | InvalidOpcode
//! ```
//!
//! The CPU never calls into the kernel itself: a SYSCALL stops the step and
//! the driver decides what to do with the code.

mod fpu;
mod instruction;
mod interpreter;
pub mod registers;
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
#[allow(clippy::cast_precision_loss)]
pub mod vfpu;

use tracing::error;

use crate::memory::Memory;
use crate::ring_buffer::RingBuffer;

pub use instruction::Instruction;
pub use registers::CpuState;

const TRACE_LENGTH: usize = 32;

/// Result of executing a single instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// SYSCALL with its 20-bit code. `pc` already points past the instruction.
    Syscall(u32),
    Break { pc: u32 },
    /// Unknown encoding. Fatal for the run loop.
    InvalidOpcode { pc: u32, op: u32 },
}

pub struct Cpu {
    pub state: CpuState,
    trace: RingBuffer<u32>,
    instructions: u64,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CpuState::default(),
            trace: RingBuffer::new(TRACE_LENGTH),
            instructions: 0,
        }
    }

    /// Number of instructions executed so far.
    #[must_use]
    pub const fn instructions(&self) -> u64 {
        self.instructions
    }

    #[must_use]
    pub const fn trace(&self) -> &RingBuffer<u32> {
        &self.trace
    }

    pub fn step(&mut self, memory: &mut Memory) -> Step {
        let pc = self.state.pc;
        let op = memory.read_u32(pc);
        self.trace.push(pc);
        self.instructions += 1;

        self.state.pc = self.state.next_pc;
        self.state.next_pc = self.state.next_pc.wrapping_add(4);

        let step = self.execute(Instruction(op), pc, memory);
        if let Step::InvalidOpcode { pc, op } = step {
            error!(
                "invalid opcode {op:#010x} at {pc:#010x}, recent pcs: {}",
                self.trace.join_hex(" ")
            );
        }
        step
    }

    fn execute(&mut self, i: Instruction, pc: u32, memory: &mut Memory) -> Step {
        match i.opcode() {
            0x00 => self.special(i, pc),
            0x01 => self.regimm(i, pc),
            0x02 | 0x03 => self.jump(i, pc),
            0x04..=0x07 | 0x14..=0x17 => self.branch(i, pc),
            0x08..=0x0F => self.immediate(i),
            0x10 => Step::InvalidOpcode { pc, op: i.0 },
            0x11 => self.cop1(i, pc),
            0x12 => self.cop2(i, pc),
            0x1C => self.special2(i, pc),
            0x1F => self.special3(i, pc),
            0x20..=0x26 | 0x28..=0x2B | 0x2E | 0x30 | 0x38 => self.load_store(i, pc, memory),
            0x2F => Step::Continue, // cache
            0x31 | 0x39 => self.fpu_load_store(i, memory),
            0x18 | 0x19 | 0x1B => self.vfpu_arith(i, pc),
            0x32 | 0x36 | 0x3A | 0x3E => self.vfpu_load_store(i, pc, memory),
            0x34 => self.vfpu_unary(i, pc),
            0x37 => self.vfpu_prefix(i, pc),
            0x3F => self.vfpu_special(i, pc),
            _ => Step::InvalidOpcode { pc, op: i.0 },
        }
    }

    /// Executes a taken or not taken conditional branch.
    fn conditional_branch(&mut self, taken: bool, target: u32, likely: bool) {
        if taken {
            self.state.next_pc = target;
        } else if likely {
            // Skip the delay slot.
            self.state.pc = self.state.next_pc;
            self.state.next_pc = self.state.next_pc.wrapping_add(4);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::registers::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    pub(super) const BASE: u32 = 0x0880_0000;

    /// Places `program` at `BASE` and points the CPU at it.
    pub(super) fn setup(program: &[u32]) -> (Cpu, Memory) {
        let mut memory = Memory::new();
        for (i, op) in program.iter().enumerate() {
            memory.write_u32(BASE + 4 * i as u32, *op);
        }
        let mut cpu = Cpu::new();
        cpu.state.set_pc(BASE);
        (cpu, memory)
    }

    pub(super) fn run(cpu: &mut Cpu, memory: &mut Memory, steps: usize) {
        for _ in 0..steps {
            assert_eq!(cpu.step(memory), Step::Continue);
        }
    }

    #[test]
    fn register_zero_survives_random_instructions() {
        let mut rng = rand::thread_rng();
        let (mut cpu, mut memory) = setup(&[]);
        for _ in 0..2000 {
            let op: u32 = rng.r#gen();
            memory.write_u32(BASE, op);
            cpu.state.set_pc(BASE);
            for r in 1..32 {
                cpu.state.set_register(r, rng.r#gen());
            }
            cpu.step(&mut memory);
            assert_eq!(cpu.state.register(REG_ZERO), 0, "op {op:#010x}");
        }
    }

    #[test]
    fn syscall_reports_its_code() {
        let (mut cpu, mut memory) = setup(&[0x0008_054C]);
        assert_eq!(cpu.step(&mut memory), Step::Syscall(0x2015));
        assert_eq!(cpu.state.pc, BASE + 4);
    }

    #[test]
    fn unknown_opcode_is_reported() {
        // Primary opcode 0x27 is unassigned on this core.
        let (mut cpu, mut memory) = setup(&[0x9C00_0000]);
        assert_eq!(
            cpu.step(&mut memory),
            Step::InvalidOpcode {
                pc: BASE,
                op: 0x9C00_0000
            }
        );
        assert_eq!(cpu.trace().last(), Some(&BASE));
    }
}
