//! # Allegrex Register File
//!
//! - **r0**: hardwired to zero, writes are discarded
//! - **r1-r31**: general purpose (see the ABI aliases below)
//! - **HI/LO**: multiply/divide results, combined as a 64-bit accumulator
//! - **f0-f31**: single precision FPU registers, `fcr31` control/status
//! - **VFPU**: 128 single precision registers arranged as 8 4x4 matrices,
//!   plus 16 control registers (prefixes, condition codes, ...)
//!
//! The whole state is cloned on every guest thread switch.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

pub const REG_ZERO: usize = 0;
pub const REG_AT: usize = 1;
pub const REG_V0: usize = 2;
pub const REG_V1: usize = 3;
pub const REG_A0: usize = 4;
pub const REG_A1: usize = 5;
pub const REG_A2: usize = 6;
pub const REG_A3: usize = 7;
pub const REG_T0: usize = 8;
pub const REG_T3: usize = 11;
pub const REG_S0: usize = 16;
pub const REG_K0: usize = 26;
pub const REG_GP: usize = 28;
pub const REG_SP: usize = 29;
pub const REG_FP: usize = 30;
pub const REG_RA: usize = 31;

/// Bit of `fcr31` holding the FPU condition flag.
pub const FCR31_CONDITION_BIT: u8 = 23;

pub const VFPU_CTRL_SPREFIX: usize = 0;
pub const VFPU_CTRL_TPREFIX: usize = 1;
pub const VFPU_CTRL_DPREFIX: usize = 2;
pub const VFPU_CTRL_CC: usize = 3;
pub const VFPU_CTRL_REV: usize = 7;

/// Identity swizzle for the S and T prefixes.
pub const VFPU_PREFIX_IDENTITY: u32 = 0xE4;

#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CpuState {
    pub gpr: [u32; 32],
    pub fpr: [f32; 32],
    #[serde_as(as = "[_; 128]")]
    pub vfpr: [f32; 128],
    pub vfpu_ctrl: [u32; 16],
    pub hi: u32,
    pub lo: u32,
    pub pc: u32,
    pub next_pc: u32,
    pub fcr31: u32,
    pub llbit: bool,
}

impl Default for CpuState {
    fn default() -> Self {
        let mut vfpu_ctrl = [0; 16];
        vfpu_ctrl[VFPU_CTRL_SPREFIX] = VFPU_PREFIX_IDENTITY;
        vfpu_ctrl[VFPU_CTRL_TPREFIX] = VFPU_PREFIX_IDENTITY;
        vfpu_ctrl[VFPU_CTRL_CC] = 0x3F;
        vfpu_ctrl[VFPU_CTRL_REV] = 0x7772_CEAB;
        Self {
            gpr: [0; 32],
            fpr: [0.0; 32],
            vfpr: [0.0; 128],
            vfpu_ctrl,
            hi: 0,
            lo: 0,
            pc: 0,
            next_pc: 4,
            fcr31: 0,
            llbit: false,
        }
    }
}

impl CpuState {
    #[must_use]
    pub const fn register(&self, reg: usize) -> u32 {
        self.gpr[reg]
    }

    /// Writes `value` into `reg`; r0 stays zero.
    pub const fn set_register(&mut self, reg: usize, value: u32) {
        self.gpr[reg] = value;
        self.gpr[REG_ZERO] = 0;
    }

    /// Jumps to `address` without a delay slot.
    pub const fn set_pc(&mut self, address: u32) {
        self.pc = address;
        self.next_pc = address.wrapping_add(4);
    }

    #[must_use]
    pub const fn hilo(&self) -> u64 {
        ((self.hi as u64) << 32) | self.lo as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    pub const fn set_hilo(&mut self, value: u64) {
        self.hi = (value >> 32) as u32;
        self.lo = value as u32;
    }

    #[must_use]
    pub const fn fpcond(&self) -> bool {
        (self.fcr31 >> FCR31_CONDITION_BIT) & 1 == 1
    }

    pub const fn set_fpcond(&mut self, value: bool) {
        if value {
            self.fcr31 |= 1 << FCR31_CONDITION_BIT;
        } else {
            self.fcr31 &= !(1 << FCR31_CONDITION_BIT);
        }
    }

    /// Rounding mode used by `cvt.w.s`: 0 nearest, 1 zero, 2 +inf, 3 -inf.
    #[must_use]
    pub const fn rounding_mode(&self) -> u32 {
        self.fcr31 & 3
    }
}
