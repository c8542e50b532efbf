//! # System
//!
//! Owns every component and drives them one instruction at a time:
//!
//! ```text
//! loop {
//!   exited?             ──▶ Exited
//!   reschedule pending  ──▶ Kernel::reschedule
//!   nothing running     ──▶ deliver an interrupt, or idle to the next event
//!   Cpu::step           ──▶ SYSCALL: hle::execute
//!                           BREAK / bad opcode: Halted
//!   timer += 1 cycle    ──▶ due events (vblank, timeouts, delays)
//!   new frame           ──▶ run display lists, age texture caches
//! }
//! ```

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cpu::{Cpu, Step};
use crate::error::{LoadError, Result};
use crate::gpu::Gpu;
use crate::kernel::Kernel;
use crate::kernel::filesystem::{MemoryFileSystem, MetaFileSystem};
use crate::kernel::hle::{self, Hle};
use crate::kernel::object::Uid;
use crate::memory::Memory;

const MAIN_THREAD_PRIORITY: u32 = 0x20;
const MAIN_THREAD_STACK_SIZE: u32 = 0x0004_0000;

/// Why [`System::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest asked to exit.
    Exited,
    /// No thread can run and no event could ever wake one.
    Idle,
    /// `BREAK` or an instruction the interpreter cannot decode.
    Halted { pc: u32, op: u32 },
    Breakpoint(u32),
    /// The instruction limit was reached.
    Limit,
}

pub struct System {
    pub cpu: Cpu,
    pub memory: Memory,
    pub kernel: Kernel,
    pub gpu: Gpu,
    pub fs: MetaFileSystem,
    pub config: Config,
    last_frame: u64,
}

impl System {
    /// Builds a powered-on console with an empty memory stick at `ms0:`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mut memory = Memory::new();
        let kernel = Kernel::new(&config, &mut memory);
        let gpu = Gpu::new(&config);
        let mut fs = MetaFileSystem::new();
        fs.mount("ms0:", Box::new(MemoryFileSystem::new()));
        fs.alias("fatms0:", "ms0:");
        fs.alias("host0:", "ms0:");
        if let Err(e) = fs.change_directory("ms0:/") {
            warn!("could not enter ms0: {e}");
        }
        info!("system ready, {} renderer", gpu.backend_name());

        Self {
            cpu: Cpu::new(),
            memory,
            kernel,
            gpu,
            fs,
            config,
            last_frame: 0,
        }
    }

    /// Loads an ELF executable and starts its main thread.
    pub fn load_executable(&mut self, data: &[u8]) -> Result<Uid> {
        let module = self.kernel.load_module(&mut self.memory, data)?;
        let thread = self
            .kernel
            .start_module(
                &mut self.memory,
                module,
                MAIN_THREAD_PRIORITY,
                MAIN_THREAD_STACK_SIZE,
            )
            .map_err(LoadError::MainThread)?;
        Ok(thread)
    }

    /// Advances the machine by one instruction, or by one idle skip when
    /// nothing can run. Returns `Some` when the run has to stop.
    pub fn step(&mut self) -> Option<RunOutcome> {
        if self.kernel.has_exited() {
            return Some(RunOutcome::Exited);
        }
        if self.kernel.reschedule_pending() {
            self.kernel.reschedule(&mut self.cpu, false);
        }

        if self.kernel.interrupts.has_pending() {
            self.kernel.deliver_interrupt(&mut self.cpu);
        }
        let running = self.kernel.current_thread().is_some() || self.kernel.interrupts.in_interrupt();
        if !running {
            if !self.kernel.idle(&mut self.memory) {
                return Some(RunOutcome::Idle);
            }
            self.sync_frame();
            return None;
        }

        match self.cpu.step(&mut self.memory) {
            Step::Continue => {}
            Step::Syscall(code) => {
                let mut hle = Hle {
                    cpu: &mut self.cpu,
                    memory: &mut self.memory,
                    kernel: &mut self.kernel,
                    gpu: &mut self.gpu,
                    fs: &mut self.fs,
                };
                hle::execute(&mut hle, code);
            }
            Step::Break { pc } => {
                return Some(RunOutcome::Halted {
                    pc,
                    op: self.memory.read_u32(pc),
                });
            }
            Step::InvalidOpcode { pc, op } => return Some(RunOutcome::Halted { pc, op }),
        }

        self.kernel.timer.advance(1);
        self.kernel.process_events(&mut self.memory);
        self.sync_frame();
        None
    }

    /// Steps until something stops the machine or `max_instructions` steps
    /// went by.
    pub fn run(&mut self, max_instructions: Option<u64>) -> RunOutcome {
        let mut steps = 0;
        let outcome = loop {
            if max_instructions.is_some_and(|max| steps >= max) {
                break RunOutcome::Limit;
            }
            if let Some(outcome) = self.step() {
                break outcome;
            }
            steps += 1;
        };
        info!(
            "stopped after {steps} steps ({} instructions, frame {}): {outcome:?}",
            self.cpu.instructions(),
            self.kernel.frame_count()
        );
        outcome
    }

    /// Frame boundary work once the kernel saw a new vblank.
    fn sync_frame(&mut self) {
        let frame = self.kernel.frame_count();
        if frame == self.last_frame {
            return;
        }
        self.last_frame = frame;
        debug!("frame {frame}");
        hle::run_display_lists(&mut self.gpu, &mut self.kernel, &mut self.memory);
        self.gpu.end_frame(frame);
    }
}
