//! # VFPU
//!
//! 128 floats arranged as eight 4x4 matrices. A 7-bit register operand
//! names a matrix, a starting row/column and an orientation:
//!
//! ```text
//!   bit  6   5   4   3   2   1   0
//!      ┌───────┬───┬───────────┬───────┐
//!      │  row  │ T │  matrix   │  col  │   T = transpose (row vector)
//!      └───────┴───┴───────────┴───────┘
//!
//!   storage index = matrix * 4 + col + row * 32
//! ```
//!
//! Single operands use bits 5-6 as the row and are never transposed;
//! pairs and quads take the row from bit 6 only, triples from bit 6 as a
//! 0/1 offset.
//!
//! Every arithmetic instruction passes its sources through the S/T prefix
//! (swizzle, absolute value, constants, negation) and its result through the
//! D prefix (saturation, write mask). Prefixes go back to identity after
//! each instruction that consumes them.

use std::f32::consts::FRAC_PI_2;

use tracing::trace;

use super::registers::{
    VFPU_CTRL_CC, VFPU_CTRL_DPREFIX, VFPU_CTRL_SPREFIX, VFPU_CTRL_TPREFIX, VFPU_PREFIX_IDENTITY,
};
use super::{Cpu, Instruction, Step};
use crate::bitwise::sign_extend;
use crate::memory::Memory;

/// Values selected by the S/T prefix constant bit, indexed by
/// `swizzle + 4 * abs`.
const PREFIX_CONSTANTS: [f32; 8] = [
    0.0,
    1.0,
    2.0,
    0.5,
    3.0,
    1.0 / 3.0,
    0.25,
    1.0 / 6.0,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorSize {
    Single,
    Pair,
    Triple,
    Quad,
}

impl VectorSize {
    #[must_use]
    pub const fn from_op(op: u32) -> Self {
        match ((op >> 7) & 1) | ((op >> 14) & 2) {
            0 => Self::Single,
            1 => Self::Pair,
            2 => Self::Triple,
            _ => Self::Quad,
        }
    }

    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Pair => 2,
            Self::Triple => 3,
            Self::Quad => 4,
        }
    }
}

/// Storage indices of the lanes named by `reg`. Only the first
/// `size.len()` entries are meaningful.
#[must_use]
pub const fn vreg_indices(size: VectorSize, reg: u32) -> [usize; 4] {
    let matrix = ((reg >> 2) & 7) as usize;
    let col = (reg & 3) as usize;
    let (row, transpose) = match size {
        VectorSize::Single => (((reg >> 5) & 3) as usize, false),
        VectorSize::Pair | VectorSize::Quad => (((reg >> 5) & 2) as usize, (reg >> 5) & 1 != 0),
        VectorSize::Triple => (((reg >> 6) & 1) as usize, (reg >> 5) & 1 != 0),
    };
    let mut out = [0; 4];
    let mut i = 0;
    while i < size.len() {
        let r = (row + i) & 3;
        out[i] = if transpose {
            matrix * 4 + r + col * 32
        } else {
            matrix * 4 + col + r * 32
        };
        i += 1;
    }
    out
}

/// Applies an S or T prefix to `source`.
#[must_use]
pub fn apply_source_prefix(prefix: u32, source: [f32; 4], len: usize) -> [f32; 4] {
    if prefix == VFPU_PREFIX_IDENTITY {
        return source;
    }
    let mut out = [0.0; 4];
    for (i, lane) in out.iter_mut().enumerate().take(len) {
        let swizzle = ((prefix >> (i * 2)) & 3) as usize;
        let abs = (prefix >> (8 + i)) & 1 != 0;
        let constant = (prefix >> (12 + i)) & 1 != 0;
        let negate = (prefix >> (16 + i)) & 1 != 0;
        let mut value = if constant {
            PREFIX_CONSTANTS[swizzle + usize::from(abs) * 4]
        } else if abs {
            source[swizzle].abs()
        } else {
            source[swizzle]
        };
        if negate {
            value = -value;
        }
        *lane = value;
    }
    out
}

fn saturate(mode: u32, value: f32) -> f32 {
    match mode {
        1 => {
            if value <= 0.0 {
                0.0
            } else if value > 1.0 {
                1.0
            } else {
                value
            }
        }
        3 => {
            if value < -1.0 {
                -1.0
            } else if value > 1.0 {
                1.0
            } else {
                value
            }
        }
        _ => value,
    }
}

fn compare(cond: u32, s: f32, t: f32) -> bool {
    match cond {
        0 => false,
        1 => s == t,
        2 => s < t,
        3 => s <= t,
        4 => true,
        5 => s != t,
        6 => s >= t,
        7 => s > t,
        8 => s == 0.0,
        9 => s.is_nan(),
        10 => s.is_infinite(),
        11 => !s.is_finite(),
        12 => s != 0.0,
        13 => !s.is_nan(),
        14 => !s.is_infinite(),
        _ => s.is_finite(),
    }
}

/// IEEE half to single precision.
#[must_use]
pub fn half_to_f32(half: u16) -> f32 {
    let sign = u32::from(half >> 15) << 31;
    let exponent = u32::from((half >> 10) & 0x1F);
    let mantissa = u32::from(half & 0x3FF);
    let bits = match exponent {
        0 if mantissa == 0 => sign,
        0 => {
            let mut e = 127 - 15 + 1;
            let mut m = mantissa;
            while m & 0x400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | (e << 23) | ((m & 0x3FF) << 13)
        }
        0x1F => sign | 0x7F80_0000 | (mantissa << 13),
        _ => sign | ((exponent + 127 - 15) << 23) | (mantissa << 13),
    };
    f32::from_bits(bits)
}

/// Write mask of each control register for `mtvc`.
const fn control_write_mask(index: usize) -> u32 {
    match index {
        VFPU_CTRL_SPREFIX | VFPU_CTRL_TPREFIX => 0x000F_FFFF,
        VFPU_CTRL_DPREFIX => 0x0000_0FFF,
        VFPU_CTRL_CC => 0x3F,
        4 => u32::MAX,
        8..=15 => 0x0003_FFFF,
        _ => 0,
    }
}

const fn operands(op: u32) -> (u32, u32, u32) {
    (op & 0x7F, (op >> 8) & 0x7F, (op >> 16) & 0x7F)
}

impl Cpu {
    #[must_use]
    pub fn read_vector(&self, size: VectorSize, reg: u32) -> [f32; 4] {
        let indices = vreg_indices(size, reg);
        let mut out = [0.0; 4];
        for i in 0..size.len() {
            out[i] = self.state.vfpr[indices[i]];
        }
        out
    }

    /// Writes without going through the D prefix.
    pub fn write_vector(&mut self, size: VectorSize, reg: u32, values: [f32; 4]) {
        let indices = vreg_indices(size, reg);
        for i in 0..size.len() {
            self.state.vfpr[indices[i]] = values[i];
        }
    }

    fn read_s(&self, size: VectorSize, reg: u32) -> [f32; 4] {
        let prefix = self.state.vfpu_ctrl[VFPU_CTRL_SPREFIX];
        apply_source_prefix(prefix, self.read_vector(size, reg), size.len())
    }

    fn read_t(&self, size: VectorSize, reg: u32) -> [f32; 4] {
        let prefix = self.state.vfpu_ctrl[VFPU_CTRL_TPREFIX];
        apply_source_prefix(prefix, self.read_vector(size, reg), size.len())
    }

    fn write_d(&mut self, size: VectorSize, reg: u32, values: [f32; 4]) {
        let prefix = self.state.vfpu_ctrl[VFPU_CTRL_DPREFIX];
        let indices = vreg_indices(size, reg);
        for i in 0..size.len() {
            if (prefix >> (8 + i)) & 1 != 0 {
                continue;
            }
            self.state.vfpr[indices[i]] = saturate((prefix >> (i * 2)) & 3, values[i]);
        }
    }

    fn reset_prefixes(&mut self) {
        self.state.vfpu_ctrl[VFPU_CTRL_SPREFIX] = VFPU_PREFIX_IDENTITY;
        self.state.vfpu_ctrl[VFPU_CTRL_TPREFIX] = VFPU_PREFIX_IDENTITY;
        self.state.vfpu_ctrl[VFPU_CTRL_DPREFIX] = 0;
    }

    /// Opcodes 0x18 (VFPU0), 0x19 (VFPU1) and 0x1B (VFPU3).
    pub(super) fn vfpu_arith(&mut self, i: Instruction, pc: u32) -> Step {
        let op = i.0;
        let size = VectorSize::from_op(op);
        let n = size.len();
        let (vd, vs, vt) = operands(op);
        let s = self.read_s(size, vs);
        let selector = (op >> 23) & 7;

        match (i.opcode(), selector) {
            (0x18, 0 | 1 | 7) | (0x19, 0) | (0x1B, 2 | 3 | 6 | 7) => {
                let t = self.read_t(size, vt);
                let mut d = [0.0; 4];
                for lane in 0..n {
                    let (a, b) = (s[lane], t[lane]);
                    d[lane] = match (i.opcode(), selector) {
                        (0x18, 0) => a + b,
                        (0x18, 1) => a - b,
                        (0x18, _) => a / b,
                        (0x19, _) => a * b,
                        (_, 2) => a.min(b),
                        (_, 3) => a.max(b),
                        (_, 6) => f32::from(u8::from(a >= b)),
                        _ => f32::from(u8::from(a < b)),
                    };
                }
                self.write_d(size, vd, d);
            }
            (0x19, 1) => {
                let t = self.read_t(size, vt);
                let dot: f32 = (0..n).map(|lane| s[lane] * t[lane]).sum();
                self.write_d(VectorSize::Single, vd, [dot, 0.0, 0.0, 0.0]);
            }
            (0x19, 2) => {
                let scale = self.read_t(VectorSize::Single, vt)[0];
                let mut d = s;
                for value in d.iter_mut().take(n) {
                    *value *= scale;
                }
                self.write_d(size, vd, d);
            }
            (0x19, 4) => {
                let t = self.read_t(size, vt);
                let partial: f32 = (0..n - 1).map(|lane| s[lane] * t[lane]).sum();
                let result = partial + t[n - 1];
                self.write_d(VectorSize::Single, vd, [result, 0.0, 0.0, 0.0]);
            }
            (0x1B, 0) => {
                let t = self.read_t(size, vt);
                let cond = op & 0xF;
                let mut cc = 0;
                let mut any = false;
                let mut all = true;
                let mut affected = 0x30;
                for lane in 0..n {
                    let c = compare(cond, s[lane], t[lane]);
                    cc |= u32::from(c) << lane;
                    any |= c;
                    all &= c;
                    affected |= 1 << lane;
                }
                cc |= (u32::from(any) << 4) | (u32::from(all) << 5);
                let old = self.state.vfpu_ctrl[VFPU_CTRL_CC];
                self.state.vfpu_ctrl[VFPU_CTRL_CC] = (old & !affected) | (cc & affected);
            }
            _ => return Step::InvalidOpcode { pc, op },
        }
        self.reset_prefixes();
        Step::Continue
    }

    /// Opcode 0x34, the single-source group.
    pub(super) fn vfpu_unary(&mut self, i: Instruction, pc: u32) -> Step {
        let op = i.0;
        if (op >> 21) & 0x1F != 0 {
            return Step::InvalidOpcode { pc, op };
        }
        let size = VectorSize::from_op(op);
        let n = size.len();
        let (vd, vs, _) = operands(op);
        let s = self.read_s(size, vs);
        let mut d = [0.0; 4];
        for lane in 0..n {
            let v = s[lane];
            d[lane] = match (op >> 16) & 0x1F {
                0 => v,
                1 => v.abs(),
                2 => -v,
                3 => f32::from(u8::from(lane == (vd & 3) as usize)),
                4 => saturate(1, v),
                5 => saturate(3, v),
                6 => 0.0,
                7 => 1.0,
                16 => 1.0 / v,
                17 => 1.0 / v.sqrt(),
                18 => (v * FRAC_PI_2).sin(),
                19 => (v * FRAC_PI_2).cos(),
                20 => v.exp2(),
                21 => v.log2(),
                22 => v.sqrt(),
                23 => v.asin() / FRAC_PI_2,
                24 => -1.0 / v,
                26 => -(v * FRAC_PI_2).sin(),
                28 => 1.0 / v.exp2(),
                _ => return Step::InvalidOpcode { pc, op },
            };
        }
        self.write_d(size, vd, d);
        self.reset_prefixes();
        Step::Continue
    }

    /// Opcode 0x37: prefix setup and immediate loads.
    pub(super) fn vfpu_prefix(&mut self, i: Instruction, _pc: u32) -> Step {
        let op = i.0;
        match (op >> 24) & 3 {
            0 => self.state.vfpu_ctrl[VFPU_CTRL_SPREFIX] = op & 0x000F_FFFF,
            1 => self.state.vfpu_ctrl[VFPU_CTRL_TPREFIX] = op & 0x000F_FFFF,
            2 => self.state.vfpu_ctrl[VFPU_CTRL_DPREFIX] = op & 0x0000_0FFF,
            _ => {
                let vt = (op >> 16) & 0x7F;
                #[allow(clippy::cast_possible_wrap)]
                let value = if (op >> 23) & 1 == 0 {
                    f32::from((op & 0xFFFF) as u16 as i16)
                } else {
                    half_to_f32((op & 0xFFFF) as u16)
                };
                self.write_d(VectorSize::Single, vt, [value, 0.0, 0.0, 0.0]);
                self.reset_prefixes();
            }
        }
        Step::Continue
    }

    /// Opcode 0x3F: `vnop`, `vsync`, `vflush`.
    pub(super) fn vfpu_special(&mut self, i: Instruction, pc: u32) -> Step {
        if i.0 >> 16 == 0xFFFF {
            Step::Continue
        } else {
            Step::InvalidOpcode { pc, op: i.0 }
        }
    }

    /// COP2: register moves and condition branches.
    pub(super) fn cop2(&mut self, i: Instruction, pc: u32) -> Step {
        let op = i.0;
        let imm = (op & 0xFF) as usize;
        match i.rs() {
            0x03 => {
                let value = match imm {
                    0..=127 => self.state.vfpr[vreg_indices(VectorSize::Single, imm as u32)[0]]
                        .to_bits(),
                    128..=143 => self.state.vfpu_ctrl[imm - 128],
                    _ => return Step::InvalidOpcode { pc, op },
                };
                self.state.set_register(i.rt(), value);
            }
            0x07 => {
                let value = self.state.register(i.rt());
                match imm {
                    0..=127 => {
                        let index = vreg_indices(VectorSize::Single, imm as u32)[0];
                        self.state.vfpr[index] = f32::from_bits(value);
                    }
                    128..=143 => {
                        let index = imm - 128;
                        let mask = control_write_mask(index);
                        let old = self.state.vfpu_ctrl[index];
                        self.state.vfpu_ctrl[index] = (old & !mask) | (value & mask);
                    }
                    _ => return Step::InvalidOpcode { pc, op },
                }
            }
            0x08 => {
                let bit = (op >> 18) & 7;
                let cond = (self.state.vfpu_ctrl[VFPU_CTRL_CC] >> bit) & 1 != 0;
                let (taken, likely) = match (op >> 16) & 3 {
                    0 => (!cond, false),
                    1 => (cond, false),
                    2 => (!cond, true),
                    _ => (cond, true),
                };
                self.conditional_branch(taken, i.branch_target(pc), likely);
            }
            _ => return Step::InvalidOpcode { pc, op },
        }
        Step::Continue
    }

    /// `lv.s`, `sv.s`, `lv.q`, `sv.q`. These ignore the prefixes.
    pub(super) fn vfpu_load_store(&mut self, i: Instruction, pc: u32, memory: &mut Memory) -> Step {
        let op = i.0;
        #[allow(clippy::cast_sign_loss)]
        let offset = sign_extend(op & 0xFFFC, 16) as u32;
        let address = self.state.register(i.rs()).wrapping_add(offset);
        match i.opcode() {
            0x32 | 0x3A => {
                let vt = ((op >> 16) & 0x1F) | ((op & 3) << 5);
                let index = vreg_indices(VectorSize::Single, vt)[0];
                if i.opcode() == 0x32 {
                    self.state.vfpr[index] = memory.read_f32(address);
                } else {
                    memory.write_f32(address, self.state.vfpr[index]);
                }
            }
            0x36 | 0x3E => {
                let vt = ((op >> 16) & 0x1F) | ((op & 1) << 5);
                if address & 0xF != 0 {
                    trace!("unaligned quad access at {address:#010x} from {pc:#010x}");
                }
                if i.opcode() == 0x36 {
                    let mut values = [0.0; 4];
                    for (lane, value) in values.iter_mut().enumerate() {
                        *value = memory.read_f32(address.wrapping_add(lane as u32 * 4));
                    }
                    self.write_vector(VectorSize::Quad, vt, values);
                } else {
                    let values = self.read_vector(VectorSize::Quad, vt);
                    for (lane, value) in values.iter().enumerate() {
                        memory.write_f32(address.wrapping_add(lane as u32 * 4), *value);
                    }
                }
            }
            _ => return Step::InvalidOpcode { pc, op },
        }
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::super::registers::*;
    use super::super::tests::{BASE, run, setup};
    use super::*;
    use pretty_assertions::assert_eq;

    const C000: u32 = 0;
    const C010: u32 = 1;
    const C020: u32 = 2;

    const VADD_Q: u32 = 0x6002_8180; // vadd.q C000, C010, C020
    const VDOT_Q: u32 = 0x6482_8180; // vdot.q S000, C010, C020

    fn load(cpu: &mut Cpu) {
        cpu.write_vector(VectorSize::Quad, C010, [1.0, 2.0, 3.0, 4.0]);
        cpu.write_vector(VectorSize::Quad, C020, [10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn register_permutation() {
        assert_eq!(vreg_indices(VectorSize::Single, 0)[0], 0);
        assert_eq!(vreg_indices(VectorSize::Quad, C000), [0, 32, 64, 96]);
        // R000.q
        assert_eq!(vreg_indices(VectorSize::Quad, 0x20), [0, 1, 2, 3]);
        // C130.q
        assert_eq!(vreg_indices(VectorSize::Quad, 7), [7, 39, 71, 103]);
        // C002.p
        assert_eq!(vreg_indices(VectorSize::Pair, 0x40)[..2], [64, 96]);
        // C001.t
        assert_eq!(vreg_indices(VectorSize::Triple, 0x40)[..3], [32, 64, 96]);
    }

    #[test]
    fn source_prefix_swizzles_and_negates() {
        // vpfxs [-y, x, w, z] ; vadd.q
        let (mut cpu, mut memory) = setup(&[0xDC01_00B1, VADD_Q]);
        load(&mut cpu);
        run(&mut cpu, &mut memory, 2);
        assert_eq!(cpu.read_vector(VectorSize::Quad, C000), [8.0, 21.0, 34.0, 43.0]);
        assert_eq!(cpu.state.vfpu_ctrl[VFPU_CTRL_SPREFIX], VFPU_PREFIX_IDENTITY);
    }

    #[test]
    fn source_prefix_constants() {
        // vpfxt [1/2, 3, 0, 1/6] as constants ; vadd.q
        let prefix = 0x3 | (3 << 6) | (0b1010 << 8) | (0b1111 << 12);
        let (mut cpu, mut memory) = setup(&[0xDD00_0000 | prefix, VADD_Q]);
        load(&mut cpu);
        run(&mut cpu, &mut memory, 2);
        let d = cpu.read_vector(VectorSize::Quad, C000);
        assert_eq!(d[0], 1.5);
        assert_eq!(d[1], 5.0);
        assert_eq!(d[2], 3.0);
        assert_eq!(d[3], 4.0 + 1.0 / 6.0);
    }

    #[test]
    fn destination_prefix_saturates_and_masks() {
        // vpfxd [0:1, masked, -, -] ; vadd.q
        let (mut cpu, mut memory) = setup(&[0xDE00_0201, VADD_Q]);
        load(&mut cpu);
        cpu.write_vector(VectorSize::Quad, C000, [0.0, 7.0, 0.0, 0.0]);
        run(&mut cpu, &mut memory, 2);
        assert_eq!(cpu.read_vector(VectorSize::Quad, C000), [1.0, 7.0, 33.0, 44.0]);
        assert_eq!(cpu.state.vfpu_ctrl[VFPU_CTRL_DPREFIX], 0);
    }

    #[test]
    fn dot_product_writes_a_single_lane() {
        let (mut cpu, mut memory) = setup(&[VDOT_Q]);
        load(&mut cpu);
        run(&mut cpu, &mut memory, 1);
        assert_eq!(cpu.state.vfpr[0], 300.0);
        assert_eq!(cpu.state.vfpr[32], 0.0);
    }

    #[test]
    fn compare_sets_lane_any_and_all_bits() {
        // vcmp.q LT, C010, C020 ; bvt any, +1 ; nop
        let (mut cpu, mut memory) = setup(&[0x6C02_8182, 0x4911_0001, 0]);
        load(&mut cpu);
        cpu.state.vfpr[vreg_indices(VectorSize::Quad, C020)[2]] = 0.0;
        run(&mut cpu, &mut memory, 3);
        assert_eq!(cpu.state.vfpu_ctrl[VFPU_CTRL_CC], 0b01_1011);
        assert_eq!(cpu.state.pc, BASE + 12);
    }

    #[test]
    fn quad_load_and_store() {
        // lv.q R000, 0($a0) ; sv.q C000, 16($a0)
        let (mut cpu, mut memory) = setup(&[0xD880_0001, 0xF880_0010]);
        let data = 0x0880_1000;
        for (lane, value) in [1.0_f32, 2.0, 3.0, 4.0].iter().enumerate() {
            memory.write_f32(data + lane as u32 * 4, *value);
        }
        cpu.state.set_register(REG_A0, data);
        run(&mut cpu, &mut memory, 2);
        assert_eq!(&cpu.state.vfpr[..4], &[1.0, 2.0, 3.0, 4.0]);
        // Column 0 only shares its first lane with row 0.
        assert_eq!(memory.read_f32(data + 16), 1.0);
        assert_eq!(memory.read_f32(data + 20), 0.0);
    }

    #[test]
    fn immediate_loads_and_moves() {
        // viim.s S000, -5 ; vfim.s S010, 1.0 ; mfv $v0, S010
        let (mut cpu, mut memory) = setup(&[0xDF00_FFFB, 0xDF81_3C00, 0x4862_0001]);
        run(&mut cpu, &mut memory, 3);
        assert_eq!(cpu.state.vfpr[0], -5.0);
        assert_eq!(cpu.state.vfpr[1], 1.0);
        assert_eq!(cpu.state.register(REG_V0), 1.0_f32.to_bits());
    }

    #[test]
    fn sine_takes_quarter_turns() {
        // vsin.s S000, S010
        let (mut cpu, mut memory) = setup(&[0xD012_0100]);
        cpu.state.vfpr[1] = 1.0;
        run(&mut cpu, &mut memory, 1);
        assert!((cpu.state.vfpr[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn half_floats() {
        assert_eq!(half_to_f32(0x3C00), 1.0);
        assert_eq!(half_to_f32(0xC000), -2.0);
        assert_eq!(half_to_f32(0x0001), 2.0_f32.powi(-24));
        assert!(half_to_f32(0x7E00).is_nan());
    }
}
