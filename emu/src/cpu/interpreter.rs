//! Integer instruction groups.

use super::registers::REG_RA;
use super::{Cpu, Instruction, Step};
use crate::memory::Memory;

#[allow(clippy::cast_possible_wrap)]
const fn signed(value: u32) -> i32 {
    value as i32
}

#[allow(clippy::cast_sign_loss)]
const fn unsigned(value: i32) -> u32 {
    value as u32
}

impl Cpu {
    fn reg(&self, r: usize) -> u32 {
        self.state.register(r)
    }

    fn set(&mut self, r: usize, value: u32) {
        self.state.set_register(r, value);
    }

    pub(super) fn special(&mut self, i: Instruction, pc: u32) -> Step {
        let (rs, rt, rd) = (i.rs(), i.rt(), i.rd());
        let (a, b) = (self.reg(rs), self.reg(rt));
        match i.funct() {
            0x00 => self.set(rd, b << i.sa()),
            0x02 => {
                let value = if rs == 1 {
                    b.rotate_right(i.sa())
                } else {
                    b >> i.sa()
                };
                self.set(rd, value);
            }
            0x03 => self.set(rd, unsigned(signed(b) >> i.sa())),
            0x04 => self.set(rd, b << (a & 31)),
            0x06 => {
                let value = if i.sa() == 1 {
                    b.rotate_right(a & 31)
                } else {
                    b >> (a & 31)
                };
                self.set(rd, value);
            }
            0x07 => self.set(rd, unsigned(signed(b) >> (a & 31))),
            0x08 => self.state.next_pc = a,
            0x09 => {
                self.state.next_pc = a;
                self.set(rd, pc.wrapping_add(8));
            }
            0x0A => {
                if b == 0 {
                    self.set(rd, a);
                }
            }
            0x0B => {
                if b != 0 {
                    self.set(rd, a);
                }
            }
            0x0C => return Step::Syscall(i.syscall_code()),
            0x0D => return Step::Break { pc },
            0x0F => {} // sync
            0x10 => self.set(rd, self.state.hi),
            0x11 => self.state.hi = a,
            0x12 => self.set(rd, self.state.lo),
            0x13 => self.state.lo = a,
            0x16 => self.set(rd, a.leading_zeros()),
            0x17 => self.set(rd, a.leading_ones()),
            0x18 => {
                let product = i64::from(signed(a)) * i64::from(signed(b));
                #[allow(clippy::cast_sign_loss)]
                self.state.set_hilo(product as u64);
            }
            0x19 => self.state.set_hilo(u64::from(a) * u64::from(b)),
            0x1A => self.divide(a, b),
            0x1B => self.divide_unsigned(a, b),
            0x1C | 0x1D | 0x2E | 0x2F => self.multiply_accumulate(i.funct(), a, b),
            // Overflow traps are not raised.
            0x20 | 0x21 => self.set(rd, a.wrapping_add(b)),
            0x22 | 0x23 => self.set(rd, a.wrapping_sub(b)),
            0x24 => self.set(rd, a & b),
            0x25 => self.set(rd, a | b),
            0x26 => self.set(rd, a ^ b),
            0x27 => self.set(rd, !(a | b)),
            0x2A => self.set(rd, u32::from(signed(a) < signed(b))),
            0x2B => self.set(rd, u32::from(a < b)),
            0x2C => self.set(rd, unsigned(signed(a).max(signed(b)))),
            0x2D => self.set(rd, unsigned(signed(a).min(signed(b)))),
            _ => return Step::InvalidOpcode { pc, op: i.0 },
        }
        Step::Continue
    }

    fn divide(&mut self, a: u32, b: u32) {
        let (x, y) = (signed(a), signed(b));
        if y == 0 {
            self.state.hi = a;
            self.state.lo = if x < 0 { 1 } else { 0xFFFF_FFFF };
        } else if x == i32::MIN && y == -1 {
            self.state.hi = 0;
            self.state.lo = a;
        } else {
            self.state.lo = unsigned(x / y);
            self.state.hi = unsigned(x % y);
        }
    }

    fn divide_unsigned(&mut self, a: u32, b: u32) {
        if b == 0 {
            self.state.hi = a;
            self.state.lo = if a <= 0xFFFF { 0xFFFF } else { 0xFFFF_FFFF };
        } else {
            self.state.lo = a / b;
            self.state.hi = a % b;
        }
    }

    #[allow(clippy::cast_sign_loss)]
    #[allow(clippy::cast_possible_wrap)]
    fn multiply_accumulate(&mut self, funct: u32, a: u32, b: u32) {
        let acc = self.state.hilo();
        let result = match funct {
            0x1C => (acc as i64).wrapping_add(i64::from(signed(a)) * i64::from(signed(b))) as u64,
            0x1D => acc.wrapping_add(u64::from(a) * u64::from(b)),
            0x2E => (acc as i64).wrapping_sub(i64::from(signed(a)) * i64::from(signed(b))) as u64,
            _ => acc.wrapping_sub(u64::from(a) * u64::from(b)),
        };
        self.state.set_hilo(result);
    }

    pub(super) fn regimm(&mut self, i: Instruction, pc: u32) -> Step {
        let value = signed(self.reg(i.rs()));
        let target = i.branch_target(pc);
        let (taken, link, likely) = match i.rt() {
            0x00 => (value < 0, false, false),
            0x01 => (value >= 0, false, false),
            0x02 => (value < 0, false, true),
            0x03 => (value >= 0, false, true),
            0x10 => (value < 0, true, false),
            0x11 => (value >= 0, true, false),
            0x12 => (value < 0, true, true),
            0x13 => (value >= 0, true, true),
            _ => return Step::InvalidOpcode { pc, op: i.0 },
        };
        if link {
            self.set(REG_RA, pc.wrapping_add(8));
        }
        self.conditional_branch(taken, target, likely);
        Step::Continue
    }

    pub(super) fn jump(&mut self, i: Instruction, pc: u32) -> Step {
        if i.opcode() == 0x03 {
            self.set(REG_RA, pc.wrapping_add(8));
        }
        self.state.next_pc = i.jump_target(pc);
        Step::Continue
    }

    pub(super) fn branch(&mut self, i: Instruction, pc: u32) -> Step {
        let (a, b) = (self.reg(i.rs()), self.reg(i.rt()));
        let likely = i.opcode() >= 0x14;
        let taken = match i.opcode() & 0x3 {
            0 => a == b,
            1 => a != b,
            2 => signed(a) <= 0,
            _ => signed(a) > 0,
        };
        self.conditional_branch(taken, i.branch_target(pc), likely);
        Step::Continue
    }

    pub(super) fn immediate(&mut self, i: Instruction) -> Step {
        let a = self.reg(i.rs());
        let rt = i.rt();
        match i.opcode() {
            0x08 | 0x09 => self.set(rt, a.wrapping_add(i.simm())),
            0x0A => self.set(rt, u32::from(signed(a) < signed(i.simm()))),
            0x0B => self.set(rt, u32::from(a < i.simm())),
            0x0C => self.set(rt, a & i.imm()),
            0x0D => self.set(rt, a | i.imm()),
            0x0E => self.set(rt, a ^ i.imm()),
            _ => self.set(rt, i.imm() << 16),
        }
        Step::Continue
    }

    /// Interrupt control (`mfic`/`mtic`) and `halt`; the kernel owns the
    /// interrupt mask, so these only need to be harmless.
    pub(super) fn special2(&mut self, i: Instruction, pc: u32) -> Step {
        match i.funct() {
            0x00 => Step::Continue,
            0x24 => {
                self.set(i.rt(), 0);
                Step::Continue
            }
            0x26 => Step::Continue,
            _ => Step::InvalidOpcode { pc, op: i.0 },
        }
    }

    pub(super) fn special3(&mut self, i: Instruction, pc: u32) -> Step {
        let (rs, rt, rd) = (i.rs(), i.rt(), i.rd());
        match i.funct() {
            0x00 => {
                let position = i.sa();
                let size = rd as u32 + 1;
                let mask = if size >= 32 { u32::MAX } else { (1 << size) - 1 };
                self.set(rt, self.reg(rs).checked_shr(position).unwrap_or(0) & mask);
            }
            0x04 => {
                let position = i.sa();
                let Some(size) = (rd as u32 + 1).checked_sub(position) else {
                    return Step::InvalidOpcode { pc, op: i.0 };
                };
                let field = if size >= 32 { u32::MAX } else { (1 << size) - 1 };
                let mask = field << position;
                let value = (self.reg(rt) & !mask) | ((self.reg(rs) << position) & mask);
                self.set(rt, value);
            }
            0x20 => {
                let b = self.reg(rt);
                #[allow(clippy::cast_possible_truncation)]
                let value = match i.sa() {
                    0x02 => ((b & 0xFF00_FF00) >> 8) | ((b & 0x00FF_00FF) << 8),
                    0x03 => b.swap_bytes(),
                    0x10 => unsigned(i32::from(b as u8 as i8)),
                    0x14 => b.reverse_bits(),
                    0x18 => unsigned(i32::from(b as u16 as i16)),
                    _ => return Step::InvalidOpcode { pc, op: i.0 },
                };
                self.set(rd, value);
            }
            _ => return Step::InvalidOpcode { pc, op: i.0 },
        }
        Step::Continue
    }

    pub(super) fn load_store(&mut self, i: Instruction, pc: u32, memory: &mut Memory) -> Step {
        let address = self.reg(i.rs()).wrapping_add(i.simm());
        let rt = i.rt();
        let value = self.reg(rt);
        let shift = (address & 3) * 8;
        match i.opcode() {
            0x20 => self.set(rt, unsigned(i32::from(memory.read_u8(address).cast_signed()))),
            0x21 => self.set(rt, unsigned(i32::from(memory.read_u16(address).cast_signed()))),
            0x22 => {
                let word = memory.read_u32(address & !3);
                let merged = (value & (0x00FF_FFFF >> shift)) | (word << (24 - shift));
                self.set(rt, merged);
            }
            0x23 => self.set(rt, memory.read_u32(address)),
            0x24 => self.set(rt, u32::from(memory.read_u8(address))),
            0x25 => self.set(rt, u32::from(memory.read_u16(address))),
            0x26 => {
                let word = memory.read_u32(address & !3);
                let merged = (value & (0xFFFF_FF00 << (24 - shift))) | (word >> shift);
                self.set(rt, merged);
            }
            #[allow(clippy::cast_possible_truncation)]
            0x28 => memory.write_u8(address, value as u8),
            #[allow(clippy::cast_possible_truncation)]
            0x29 => memory.write_u16(address, value as u16),
            0x2A => {
                let word = memory.read_u32(address & !3);
                let merged = (value >> (24 - shift)) | (word & (0xFFFF_FF00 << shift));
                memory.write_u32(address & !3, merged);
            }
            0x2B => memory.write_u32(address, value),
            0x2E => {
                let word = memory.read_u32(address & !3);
                let merged = (value << shift) | (word & (0x00FF_FFFF >> (24 - shift)));
                memory.write_u32(address & !3, merged);
            }
            0x30 => {
                self.set(rt, memory.read_u32(address));
                self.state.llbit = true;
            }
            0x38 => {
                if self.state.llbit {
                    memory.write_u32(address, value);
                    self.set(rt, 1);
                } else {
                    self.set(rt, 0);
                }
                self.state.llbit = false;
            }
            _ => return Step::InvalidOpcode { pc, op: i.0 },
        }
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::super::registers::*;
    use super::super::tests::{BASE, run, setup};
    use pretty_assertions::assert_eq;

    const NOP: u32 = 0;

    #[test]
    fn division_edge_cases() {
        // div $a0, $a1 ; divu $a2, $a3
        let (mut cpu, mut memory) = setup(&[0x0085_001A, 0x00C7_001B]);
        cpu.state.set_register(REG_A0, 7);
        cpu.state.set_register(REG_A1, 0);
        cpu.state.set_register(REG_A2, 0x1234);
        cpu.state.set_register(REG_A3, 0);
        run(&mut cpu, &mut memory, 1);
        assert_eq!((cpu.state.hi, cpu.state.lo), (7, 0xFFFF_FFFF));
        run(&mut cpu, &mut memory, 1);
        assert_eq!((cpu.state.hi, cpu.state.lo), (0x1234, 0xFFFF));

        let (mut cpu, mut memory) = setup(&[0x0085_001A, 0x0085_001A]);
        cpu.state.set_register(REG_A0, 0xFFFF_FFF9);
        cpu.state.set_register(REG_A1, 0);
        run(&mut cpu, &mut memory, 1);
        assert_eq!((cpu.state.hi, cpu.state.lo), (0xFFFF_FFF9, 1));
        cpu.state.set_register(REG_A0, 0x8000_0000);
        cpu.state.set_register(REG_A1, 0xFFFF_FFFF);
        run(&mut cpu, &mut memory, 1);
        assert_eq!((cpu.state.hi, cpu.state.lo), (0, 0x8000_0000));
    }

    #[test]
    fn signed_division_truncates() {
        let (mut cpu, mut memory) = setup(&[0x0085_001A]);
        cpu.state.set_register(REG_A0, (-7_i32).cast_unsigned());
        cpu.state.set_register(REG_A1, 2);
        run(&mut cpu, &mut memory, 1);
        assert_eq!(cpu.state.lo, (-3_i32).cast_unsigned());
        assert_eq!(cpu.state.hi, (-1_i32).cast_unsigned());
    }

    #[test]
    fn branch_delay_slot_executes() {
        // beq $zero, $zero, +2 ; addiu $v0, $zero, 1 ; addiu $v0, $v0, 2 ; addiu $v0, $v0, 4
        let (mut cpu, mut memory) = setup(&[0x1000_0002, 0x2402_0001, 0x2442_0002, 0x2442_0004]);
        run(&mut cpu, &mut memory, 3);
        assert_eq!(cpu.state.register(REG_V0), 5);
        assert_eq!(cpu.state.pc, BASE + 16);
    }

    #[test]
    fn likely_branch_skips_delay_slot_when_not_taken() {
        // beql $zero, $a0, +2 ; addiu $v0, $zero, 1 ; addiu $v1, $zero, 1
        let (mut cpu, mut memory) = setup(&[0x5004_0002, 0x2402_0001, 0x2403_0001]);
        cpu.state.set_register(REG_A0, 1);
        run(&mut cpu, &mut memory, 1);
        assert_eq!(cpu.state.pc, BASE + 8);
        run(&mut cpu, &mut memory, 1);
        assert_eq!(cpu.state.register(REG_V0), 0);
        assert_eq!(cpu.state.register(REG_V1), 1);
    }

    #[test]
    fn jal_links_past_the_delay_slot() {
        // jal BASE+0x100 ; nop
        let (mut cpu, mut memory) = setup(&[0x0E20_0040, NOP]);
        run(&mut cpu, &mut memory, 2);
        assert_eq!(cpu.state.register(REG_RA), BASE + 8);
        assert_eq!(cpu.state.pc, BASE + 0x100);
    }

    #[test]
    fn unaligned_load_pair_assembles_a_word() {
        // lwr $v0, 1($a0) ; lwl $v0, 4($a0)
        let (mut cpu, mut memory) = setup(&[0x9882_0001, 0x8882_0004]);
        let data = 0x0880_1000;
        memory.write_u32(data, 0x4433_2211);
        memory.write_u32(data + 4, 0x8877_6655);
        cpu.state.set_register(REG_A0, data);
        run(&mut cpu, &mut memory, 2);
        assert_eq!(cpu.state.register(REG_V0), 0x5544_3322);
    }

    #[test]
    fn unaligned_store_pair_writes_a_word() {
        // swr $a1, 1($a0) ; swl $a1, 4($a0)
        let (mut cpu, mut memory) = setup(&[0xB885_0001, 0xA885_0004]);
        let data = 0x0880_1000;
        cpu.state.set_register(REG_A0, data);
        cpu.state.set_register(REG_A1, 0xDDCC_BBAA);
        run(&mut cpu, &mut memory, 2);
        assert_eq!(memory.read_u32(data), 0xCCBB_AA00);
        assert_eq!(memory.read_u32(data + 4), 0x0000_00DD);
    }

    #[test]
    fn bit_manipulation() {
        // ext $v0, $a0, 4, 8 ; ins $v1, $a0, 8, 4 ; seb $t0, $a1 ; wsbh $t1, $a0 ; clz $t2, $a1
        let (mut cpu, mut memory) = setup(&[
            0x7C82_3900,
            0x7C83_5A04,
            0x7C05_4420,
            0x7C04_48A0,
            0x00A0_5016,
        ]);
        cpu.state.set_register(REG_A0, 0x1234_5678);
        cpu.state.set_register(REG_A1, 0x0000_0080);
        cpu.state.set_register(REG_V1, 0xFFFF_FFFF);
        run(&mut cpu, &mut memory, 5);
        assert_eq!(cpu.state.register(REG_V0), 0x67);
        assert_eq!(cpu.state.register(REG_V1), 0xFFFF_F8FF);
        assert_eq!(cpu.state.register(8), 0xFFFF_FF80);
        assert_eq!(cpu.state.register(9), 0x3412_7856);
        assert_eq!(cpu.state.register(10), 24);
    }

    #[test]
    fn multiply_accumulate_uses_hilo() {
        // mult $a0, $a1 ; madd $a0, $a1
        let (mut cpu, mut memory) = setup(&[0x0085_0018, 0x0085_001C]);
        cpu.state.set_register(REG_A0, (-3_i32).cast_unsigned());
        cpu.state.set_register(REG_A1, 5);
        run(&mut cpu, &mut memory, 2);
        assert_eq!(cpu.state.hilo(), (-30_i64).cast_unsigned());
    }

    #[test]
    fn load_linked_store_conditional() {
        // ll $v0, 0($a0) ; sc $a1, 0($a0) ; sc $a1, 0($a0)
        let (mut cpu, mut memory) = setup(&[0xC082_0000, 0xE085_0000, 0xE085_0000]);
        cpu.state.set_register(REG_A0, 0x0880_2000);
        cpu.state.set_register(REG_A1, 9);
        run(&mut cpu, &mut memory, 1);
        cpu.state.set_register(REG_A1, 9);
        run(&mut cpu, &mut memory, 1);
        assert_eq!(cpu.state.register(REG_A1), 1);
        assert_eq!(memory.read_u32(0x0880_2000), 9);
        cpu.state.set_register(REG_A1, 10);
        run(&mut cpu, &mut memory, 1);
        assert_eq!(cpu.state.register(REG_A1), 0);
        assert_eq!(memory.read_u32(0x0880_2000), 9);
    }
}
