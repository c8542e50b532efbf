//! # High Level Emulation
//!
//! Imported kernel functions never run guest code. The loader rewrites each
//! import stub into `jr ra; syscall code`, where `code` indexes this
//! registry:
//!
//! ```text
//!   stub ──SYSCALL code──▶ HleRegistry[code] ──▶ HleFunction::func(&mut Hle)
//!                                                      │
//!               v0 (v1) ◀── HleReturn ◀────────────────┘
//!               a0..t3  ◀── 0xDEADBEEF unless preserve_args
//! ```
//!
//! Imports nobody implemented still get a code, so calling them only logs a
//! warning and returns 0.

mod display;
mod ge;
mod intrman;
mod io;
mod loadexec;
mod sysmem;
mod threadman;

pub use ge::run_display_lists;

use std::collections::HashMap;

use tracing::{trace, warn};

use crate::cpu::Cpu;
use crate::cpu::registers::{REG_A0, REG_T3, REG_V0, REG_V1};
use crate::gpu::Gpu;
use crate::memory::Memory;

use super::Kernel;
use super::filesystem::MetaFileSystem;

/// Pseudo library holding the kernel's own return stubs.
pub const FAKE_MODULE: &str = "FakeSysCalls";
pub const FAKE_CALLBACK_RETURN: &str = "_sceKernelReturnFromCallback";
pub const FAKE_THREAD_RETURN: &str = "_sceKernelReturnFromThread";
pub const FAKE_INTERRUPT_RETURN: &str = "_sceKernelReturnFromInterrupt";

const POISON: u32 = 0xDEAD_BEEF;
const MAX_STRING: usize = 256;

/// Value an HLE function leaves in the return registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HleReturn {
    U32(u32),
    U64(u64),
    /// Leave `v0` alone.
    Void,
}

impl From<Result<(), u32>> for HleReturn {
    fn from(result: Result<(), u32>) -> Self {
        Self::U32(result.err().unwrap_or(super::error::OK))
    }
}

impl From<Result<u32, u32>> for HleReturn {
    fn from(result: Result<u32, u32>) -> Self {
        Self::U32(result.unwrap_or_else(|code| code))
    }
}

pub type HleFn = fn(&mut Hle) -> HleReturn;

#[derive(Clone, Copy)]
pub struct HleFunction {
    pub name: &'static str,
    pub func: HleFn,
    /// Skip argument poisoning. Needed by calls that swap in another context.
    pub preserve_args: bool,
}

impl HleFunction {
    const fn new(name: &'static str, func: HleFn) -> Self {
        Self {
            name,
            func,
            preserve_args: false,
        }
    }

    const fn preserving(name: &'static str, func: HleFn) -> Self {
        Self {
            name,
            func,
            preserve_args: true,
        }
    }
}

pub struct HleEntry {
    pub module: String,
    pub nid: u32,
    pub function: Option<HleFunction>,
}

/// `(module, nid)` to host function table. A function's syscall code is its
/// index.
#[derive(Default)]
pub struct HleRegistry {
    entries: Vec<HleEntry>,
    codes: HashMap<(String, u32), u32>,
}

impl HleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: &str, nid: u32, function: HleFunction) -> u32 {
        let key = (module.to_string(), nid);
        if let Some(&code) = self.codes.get(&key) {
            self.entries[code as usize].function = Some(function);
            return code;
        }
        let code = self.entries.len() as u32;
        self.entries.push(HleEntry {
            module: key.0.clone(),
            nid,
            function: Some(function),
        });
        self.codes.insert(key, code);
        code
    }

    /// Code for an import, creating an empty entry for unknown NIDs.
    pub fn import(&mut self, module: &str, nid: u32) -> u32 {
        if let Some(&code) = self.codes.get(&(module.to_string(), nid)) {
            return code;
        }
        warn!("unimplemented import {module}:{nid:#010x}");
        let code = self.entries.len() as u32;
        self.entries.push(HleEntry {
            module: module.to_string(),
            nid,
            function: None,
        });
        self.codes.insert((module.to_string(), nid), code);
        code
    }

    /// Looks a function up by name, for stubs the kernel writes itself.
    #[must_use]
    pub fn code_for(&self, module: &str, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| e.module == module && e.function.is_some_and(|f| f.name == name))
            .map(|i| i as u32)
    }

    #[must_use]
    pub fn entry(&self, code: u32) -> Option<&HleEntry> {
        self.entries.get(code as usize)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encodes `syscall code`.
#[must_use]
pub const fn syscall_instruction(code: u32) -> u32 {
    ((code & 0x000F_FFFF) << 6) | 0x0C
}

/// Binds every implemented library.
pub fn register_all(registry: &mut HleRegistry) {
    registry.register(
        FAKE_MODULE,
        0x0000_0001,
        HleFunction::preserving(FAKE_CALLBACK_RETURN, return_from_callback),
    );
    registry.register(
        FAKE_MODULE,
        0x0000_0002,
        HleFunction::preserving(FAKE_THREAD_RETURN, return_from_thread),
    );
    registry.register(
        FAKE_MODULE,
        0x0000_0003,
        HleFunction::preserving(FAKE_INTERRUPT_RETURN, return_from_interrupt),
    );
    threadman::register(registry);
    intrman::register(registry);
    sysmem::register(registry);
    loadexec::register(registry);
    display::register(registry);
    ge::register(registry);
    io::register(registry);
}

/// Everything an HLE function may touch.
pub struct Hle<'a> {
    pub cpu: &'a mut Cpu,
    pub memory: &'a mut Memory,
    pub kernel: &'a mut Kernel,
    pub gpu: &'a mut Gpu,
    pub fs: &'a mut MetaFileSystem,
}

impl Hle<'_> {
    /// Argument `n` of the call (`a0..a3`, then `t0..t3`).
    #[must_use]
    pub fn arg(&self, n: usize) -> u32 {
        self.cpu.state.register(REG_A0 + n)
    }

    #[must_use]
    pub fn arg_i32(&self, n: usize) -> i32 {
        self.arg(n) as i32
    }

    /// 64-bit argument occupying the register pair starting at `n`.
    #[must_use]
    pub fn arg_u64(&self, n: usize) -> u64 {
        u64::from(self.arg(n)) | (u64::from(self.arg(n + 1)) << 32)
    }

    /// NUL terminated guest string behind argument `n`.
    #[must_use]
    pub fn arg_string(&self, n: usize) -> String {
        let address = self.arg(n);
        if address == 0 {
            return String::new();
        }
        self.memory.read_cstring(address, MAX_STRING)
    }

    /// Writes `value` to the guest pointer in argument `n` if it is set.
    pub fn write_out(&mut self, n: usize, value: u32) {
        let address = self.arg(n);
        if address != 0 {
            self.memory.write_u32(address, value);
        }
    }
}

/// Runs syscall `code` and stores its result.
pub fn execute(hle: &mut Hle, code: u32) {
    let function = hle.kernel.hle.entry(code).map(|e| (e.module.clone(), e.nid, e.function));
    let Some((module, nid, function)) = function else {
        warn!("syscall with unknown code {code:#x}");
        hle.cpu.state.set_register(REG_V0, 0);
        return;
    };
    let Some(function) = function else {
        warn!("unimplemented {module}:{nid:#010x} called");
        hle.cpu.state.set_register(REG_V0, 0);
        return;
    };

    trace!(
        "{}({:#x}, {:#x}, {:#x}, {:#x})",
        function.name,
        hle.arg(0),
        hle.arg(1),
        hle.arg(2),
        hle.arg(3)
    );
    match (function.func)(hle) {
        HleReturn::U32(value) => hle.cpu.state.set_register(REG_V0, value),
        HleReturn::U64(value) => {
            hle.cpu.state.set_register(REG_V0, value as u32);
            hle.cpu.state.set_register(REG_V1, (value >> 32) as u32);
        }
        HleReturn::Void => {}
    }

    if !function.preserve_args && hle.kernel.poison_hle_args() {
        for reg in REG_A0..=REG_T3 {
            hle.cpu.state.set_register(reg, POISON);
        }
    }
}

fn return_from_callback(hle: &mut Hle) -> HleReturn {
    hle.kernel.return_from_callback(hle.cpu, hle.memory);
    HleReturn::Void
}

fn return_from_thread(hle: &mut Hle) -> HleReturn {
    let status = hle.cpu.state.register(REG_V0);
    if let Err(code) = hle.kernel.exit_thread(hle.memory, status) {
        warn!("thread return stub outside a thread: {code:#x}");
    }
    HleReturn::Void
}

fn return_from_interrupt(hle: &mut Hle) -> HleReturn {
    hle.kernel.return_from_interrupt(hle.cpu);
    HleReturn::Void
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kernel::tests::setup;
    use pretty_assertions::assert_eq;

    /// Calls `module:nid` with `args` on the running thread and returns `v0`.
    pub(crate) fn call(
        kernel: &mut Kernel,
        cpu: &mut Cpu,
        memory: &mut Memory,
        module: &str,
        nid: u32,
        args: &[u32],
    ) -> u32 {
        let mut gpu = Gpu::new(&Config::default());
        let mut fs = MetaFileSystem::new();
        let mut hle = Hle {
            cpu,
            memory,
            kernel,
            gpu: &mut gpu,
            fs: &mut fs,
        };
        call_with(&mut hle, module, nid, args)
    }

    /// Same as [`call`] against a GE and filesystem owned by the test.
    pub(crate) fn call_with(hle: &mut Hle, module: &str, nid: u32, args: &[u32]) -> u32 {
        for (i, value) in args.iter().enumerate() {
            hle.cpu.state.set_register(REG_A0 + i, *value);
        }
        let code = hle.kernel.hle.import(module, nid);
        execute(hle, code);
        hle.cpu.state.register(REG_V0)
    }

    #[test]
    fn syscall_encoding() {
        assert_eq!(syscall_instruction(0x2015), 0x0008_054C);
        assert_eq!(syscall_instruction(0) & 0x3F, 0x0C);
    }

    #[test]
    fn imports_share_codes() {
        let mut registry = HleRegistry::new();
        register_all(&mut registry);
        let known = registry.import("ThreadManForUser", 0x293B_45B8);
        assert_eq!(registry.import("ThreadManForUser", 0x293B_45B8), known);
        assert!(registry.entry(known).and_then(|e| e.function).is_some());

        let unknown = registry.import("sceFoo", 0x1234_5678);
        assert_eq!(unknown as usize, registry.len() - 1);
        assert!(registry.entry(unknown).unwrap().function.is_none());
        assert!(registry.code_for(FAKE_MODULE, FAKE_THREAD_RETURN).is_some());
    }

    #[test]
    fn unknown_calls_return_zero_and_poison_arguments() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        cpu.state.set_register(REG_V0, 77);
        let v0 = call(&mut kernel, &mut cpu, &mut memory, "sceFoo", 1, &[1, 2, 3]);
        assert_eq!(v0, 0);

        let tid = call(&mut kernel, &mut cpu, &mut memory, "ThreadManForUser", 0x293B_45B8, &[]);
        assert_eq!(Some(tid), kernel.current_thread());
        for reg in REG_A0..=REG_T3 {
            assert_eq!(cpu.state.register(reg), POISON);
        }
    }

    #[test]
    fn system_time_wide_uses_both_return_registers() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        kernel.timer.advance(kernel.timer.us_to_cycles(0x1_0000_0005));
        let low = call(&mut kernel, &mut cpu, &mut memory, "ThreadManForUser", 0x82BC_5777, &[]);
        assert_eq!(low, 5);
        assert_eq!(cpu.state.register(REG_V1), 1);
    }
}
