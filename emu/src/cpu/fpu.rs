//! COP1: the single precision FPU.

use super::{Cpu, Instruction, Step};
use crate::memory::Memory;

/// Value of the read-only implementation register (`cfc1 $rt, $0`).
const FPU_IMPLEMENTATION: u32 = 0x0000_3351;
/// Writable bits of `fcr31`.
const FCR31_MASK: u32 = 0x0181_FFFF;

/// Converts with the given rounding mode, saturating out of range values.
/// NaN and +inf become `i32::MAX`, -inf becomes `i32::MIN`.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn float_to_int(value: f32, mode: u32) -> i32 {
    if value.is_nan() || value == f32::INFINITY {
        return i32::MAX;
    }
    if value == f32::NEG_INFINITY {
        return i32::MIN;
    }
    let rounded = match mode & 3 {
        0 => value.round_ties_even(),
        1 => value.trunc(),
        2 => value.ceil(),
        _ => value.floor(),
    };
    rounded as i32
}

/// `c.cond.s`: bit 0 selects unordered, bit 1 equal, bit 2 less than. The
/// upper bit (signalling variants) makes no difference here.
#[must_use]
pub fn compare(cond: u32, a: f32, b: f32) -> bool {
    if a.is_nan() || b.is_nan() {
        return cond & 1 != 0;
    }
    (cond & 2 != 0 && a == b) || (cond & 4 != 0 && a < b)
}

impl Cpu {
    pub(super) fn fpu_load_store(&mut self, i: Instruction, memory: &mut Memory) -> Step {
        let address = self.state.register(i.rs()).wrapping_add(i.simm());
        if i.opcode() == 0x31 {
            self.state.fpr[i.ft()] = memory.read_f32(address);
        } else {
            memory.write_f32(address, self.state.fpr[i.ft()]);
        }
        Step::Continue
    }

    pub(super) fn cop1(&mut self, i: Instruction, pc: u32) -> Step {
        match i.rs() {
            0x00 => self.state.set_register(i.rt(), self.state.fpr[i.fs()].to_bits()),
            0x02 => {
                let value = match i.fs() {
                    0 => FPU_IMPLEMENTATION,
                    31 => self.state.fcr31,
                    _ => 0,
                };
                self.state.set_register(i.rt(), value);
            }
            0x04 => self.state.fpr[i.fs()] = f32::from_bits(self.state.register(i.rt())),
            0x06 => {
                if i.fs() == 31 {
                    self.state.fcr31 = self.state.register(i.rt()) & FCR31_MASK;
                }
            }
            0x08 => {
                let cond = self.state.fpcond();
                let (taken, likely) = match i.rt() & 3 {
                    0 => (!cond, false),
                    1 => (cond, false),
                    2 => (!cond, true),
                    _ => (cond, true),
                };
                self.conditional_branch(taken, i.branch_target(pc), likely);
            }
            0x10 => return self.fpu_single(i, pc),
            0x14 => {
                if i.funct() != 0x20 {
                    return Step::InvalidOpcode { pc, op: i.0 };
                }
                #[allow(clippy::cast_possible_wrap)]
                #[allow(clippy::cast_precision_loss)]
                let value = self.state.fpr[i.fs()].to_bits() as i32 as f32;
                self.state.fpr[i.fd()] = value;
            }
            _ => return Step::InvalidOpcode { pc, op: i.0 },
        }
        Step::Continue
    }

    fn fpu_single(&mut self, i: Instruction, pc: u32) -> Step {
        let fs = self.state.fpr[i.fs()];
        let ft = self.state.fpr[i.ft()];
        let fd = i.fd();
        let result = match i.funct() {
            0x00 => fs + ft,
            0x01 => fs - ft,
            0x02 => fs * ft,
            0x03 => fs / ft,
            0x04 => fs.sqrt(),
            0x05 => fs.abs(),
            0x06 => fs,
            0x07 => -fs,
            0x0C..=0x0F => {
                let mode = match i.funct() {
                    0x0C => 0,
                    0x0D => 1,
                    0x0E => 2,
                    _ => 3,
                };
                f32::from_bits(float_to_int(fs, mode).cast_unsigned())
            }
            0x24 => f32::from_bits(float_to_int(fs, self.state.rounding_mode()).cast_unsigned()),
            0x30..=0x3F => {
                self.state.set_fpcond(compare(i.funct() & 7, fs, ft));
                return Step::Continue;
            }
            _ => return Step::InvalidOpcode { pc, op: i.0 },
        };
        self.state.fpr[fd] = result;
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::super::registers::*;
    use super::super::tests::{BASE, run, setup};
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn conversions_saturate() {
        assert_eq!(float_to_int(f32::NAN, 0), i32::MAX);
        assert_eq!(float_to_int(f32::INFINITY, 1), i32::MAX);
        assert_eq!(float_to_int(f32::NEG_INFINITY, 1), i32::MIN);
        assert_eq!(float_to_int(3.0e10, 1), i32::MAX);
        assert_eq!(float_to_int(-3.0e10, 1), i32::MIN);
    }

    #[test]
    fn conversions_follow_the_rounding_mode() {
        assert_eq!(float_to_int(2.5, 0), 2);
        assert_eq!(float_to_int(3.5, 0), 4);
        assert_eq!(float_to_int(-2.7, 1), -2);
        assert_eq!(float_to_int(2.1, 2), 3);
        assert_eq!(float_to_int(-2.1, 3), -3);
    }

    #[test]
    fn compares_treat_nan_as_unordered() {
        // c.eq
        assert!(compare(2, 1.0, 1.0));
        assert!(!compare(2, f32::NAN, f32::NAN));
        // c.ueq
        assert!(compare(3, f32::NAN, 1.0));
        // c.le
        assert!(compare(6, 1.0, 2.0));
        assert!(compare(6, 2.0, 2.0));
        assert!(!compare(6, 3.0, 2.0));
    }

    #[test]
    fn arithmetic_and_condition_branch() {
        // mtc1 $a0, $f0 ; mtc1 $a1, $f1 ; add.s $f2, $f0, $f1 ; c.lt.s $f0, $f1
        // bc1t +1 ; nop ; (skipped) ; target
        let (mut cpu, mut memory) = setup(&[
            0x4484_0000,
            0x4485_0800,
            0x4601_0080,
            0x4601_003C,
            0x4501_0001,
            0x0000_0000,
        ]);
        cpu.state.set_register(REG_A0, 1.5_f32.to_bits());
        cpu.state.set_register(REG_A1, 2.25_f32.to_bits());
        run(&mut cpu, &mut memory, 6);
        assert_eq!(cpu.state.fpr[2], 3.75);
        assert!(cpu.state.fpcond());
        assert_eq!(cpu.state.pc, BASE + 24);
    }

    #[test]
    fn cvt_w_s_uses_fcr31_rounding() {
        // ctc1 $a0, $31 ; cvt.w.s $f2, $f0 ; mfc1 $v0, $f2
        let (mut cpu, mut memory) = setup(&[0x44C4_F800, 0x4600_00A4, 0x4402_1000]);
        cpu.state.set_register(REG_A0, 3);
        cpu.state.fpr[0] = -1.5;
        run(&mut cpu, &mut memory, 3);
        assert_eq!(cpu.state.rounding_mode(), 3);
        assert_eq!(cpu.state.register(REG_V0), (-2_i32).cast_unsigned());
    }
}
