//! Field extraction for 32-bit Allegrex instruction words.
//!
//! ```text
//!  31      26 25   21 20   16 15   11 10    6 5       0
//! ┌──────────┬───────┬───────┬───────┬───────┬─────────┐
//! │  opcode  │  rs   │  rt   │  rd   │  sa   │  funct  │  R-type
//! ├──────────┼───────┼───────┼───────┴───────┴─────────┤
//! │  opcode  │  rs   │  rt   │        immediate        │  I-type
//! ├──────────┼───────┴───────┴─────────────────────────┤
//! │  opcode  │              target                     │  J-type
//! └──────────┴─────────────────────────────────────────┘
//! ```
//!
//! The FPU reuses the same positions as `fmt`/`ft`/`fs`/`fd`.

use crate::bitwise::{Bits, sign_extend};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    #[must_use]
    pub fn opcode(self) -> u32 {
        self.0.get_bits(26..=31)
    }

    #[must_use]
    pub fn rs(self) -> usize {
        self.0.get_bits(21..=25) as usize
    }

    #[must_use]
    pub fn rt(self) -> usize {
        self.0.get_bits(16..=20) as usize
    }

    #[must_use]
    pub fn rd(self) -> usize {
        self.0.get_bits(11..=15) as usize
    }

    #[must_use]
    pub fn sa(self) -> u32 {
        self.0.get_bits(6..=10)
    }

    #[must_use]
    pub fn funct(self) -> u32 {
        self.0.get_bits(0..=5)
    }

    #[must_use]
    pub fn imm(self) -> u32 {
        self.0.get_bits(0..=15)
    }

    /// Immediate sign extended to 32 bits.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn simm(self) -> u32 {
        sign_extend(self.0 & 0xFFFF, 16) as u32
    }

    #[must_use]
    pub fn target(self) -> u32 {
        self.0.get_bits(0..=25)
    }

    /// Code field of SYSCALL, used as the HLE function index.
    #[must_use]
    pub fn syscall_code(self) -> u32 {
        self.0.get_bits(6..=25)
    }

    #[must_use]
    pub fn ft(self) -> usize {
        self.rt()
    }

    #[must_use]
    pub fn fs(self) -> usize {
        self.rd()
    }

    #[must_use]
    pub fn fd(self) -> usize {
        self.sa() as usize
    }

    /// Branch destination relative to the delay slot of an instruction at `pc`.
    #[must_use]
    pub const fn branch_target(self, pc: u32) -> u32 {
        pc.wrapping_add(4).wrapping_add(self.simm() << 2)
    }

    /// J/JAL destination: the 256 MiB segment of the delay slot plus target.
    #[must_use]
    pub fn jump_target(self, pc: u32) -> u32 {
        (pc.wrapping_add(4) & 0xF000_0000) | (self.target() << 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn r_type_fields() {
        // addu $v0, $a0, $a1
        let i = Instruction(0x0085_1021);
        assert_eq!(i.opcode(), 0);
        assert_eq!(i.rs(), 4);
        assert_eq!(i.rt(), 5);
        assert_eq!(i.rd(), 2);
        assert_eq!(i.funct(), 0x21);
    }

    #[test]
    fn immediates_and_targets() {
        // beq $zero, $zero, -1
        let i = Instruction(0x1000_FFFF);
        assert_eq!(i.simm(), 0xFFFF_FFFF);
        assert_eq!(i.branch_target(0x0880_0010), 0x0880_0010);
        // jal 0x08800100
        let j = Instruction(0x0E20_0040);
        assert_eq!(j.jump_target(0x0880_0000), 0x0880_0100);
        // syscall 0x2015
        let s = Instruction(0x0008_054C);
        assert_eq!(s.syscall_code(), 0x2015);
    }
}
