//! # Kernel
//!
//! High level replacement for the console's operating system. The guest never
//! runs real kernel code: imported functions are patched into SYSCALL
//! instructions and served by host functions (see [`hle`]). The kernel owns:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Kernel                                                           │
//! │  ├─ objects     ObjectTable (threads, semaphores, mutexes, ...)  │
//! │  ├─ ready       128 priority levels of READY thread uids         │
//! │  ├─ timer       cycle counter + pending KernelEvents             │
//! │  ├─ interrupts  sub-interrupt handlers and the active frame      │
//! │  ├─ hle         (module, nid) -> host function registry          │
//! │  └─ memory      user and kernel partition allocators             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The CPU and guest memory are not owned here; every operation that needs
//! them receives them as arguments.
//!
//! A few fixed addresses at the bottom of RAM hold return stubs. Guest code
//! "returns" into them from callbacks, thread entry points and interrupt
//! handlers, and the SYSCALL they contain hands control back to the kernel.

pub mod callback;
pub mod error;
pub mod event_flag;
pub mod filesystem;
pub mod hle;
pub mod interrupt;
pub mod module;
pub mod mutex;
pub mod object;
pub mod scheduler;
pub mod semaphore;
pub mod thread;
pub mod timing;

use tracing::{debug, info, trace};

use crate::config::Config;
use crate::memory::allocator::{BlockAllocator, DEFAULT_GRAIN};
use crate::memory::{KERNEL_PARTITION_BASE, KERNEL_PARTITION_SIZE, Memory, USER_PARTITION_BASE};

use hle::HleRegistry;
use interrupt::{GE_INTERRUPT, InterruptManager, VBLANK_INTERRUPT};
use object::{ObjectTable, Uid};
use scheduler::ReadyQueue;
use thread::{Thread, ThreadStatus, WaitType};
use timing::{EventTimer, KernelEvent};

/// `ra` of an injected callback.
pub const CALLBACK_RETURN_ADDRESS: u32 = 0x0800_0000;
/// `ra` of every thread entry point.
pub const THREAD_RETURN_ADDRESS: u32 = 0x0800_0008;
/// `ra` of an interrupt handler.
pub const INTERRUPT_RETURN_ADDRESS: u32 = 0x0800_0010;

const VBLANK_PER_SECOND: u64 = 60;

pub struct Kernel {
    pub objects: ObjectTable,
    pub timer: EventTimer,
    pub interrupts: InterruptManager,
    pub hle: HleRegistry,
    pub user_memory: BlockAllocator,
    pub kernel_memory: BlockAllocator,
    ready: ReadyQueue,
    threads: Vec<Uid>,
    current: Option<Uid>,
    needs_reschedule: bool,
    vblank_waiters: Vec<Uid>,
    vblank_cycles: u64,
    frame_count: u64,
    exited: bool,
    poison_hle_args: bool,
    module_gp: u32,
    exit_callback: Option<Uid>,
}

impl Kernel {
    /// Creates a kernel with empty object tables and writes the return
    /// stubs into `memory`.
    #[must_use]
    pub fn new(config: &Config, memory: &mut Memory) -> Self {
        let mut hle = HleRegistry::new();
        hle::register_all(&mut hle);

        let mut kernel = Self {
            objects: ObjectTable::new(),
            timer: EventTimer::new(config.cpu_hz),
            interrupts: InterruptManager::default(),
            hle,
            user_memory: BlockAllocator::new(
                USER_PARTITION_BASE,
                config.user_memory_size,
                DEFAULT_GRAIN,
            ),
            kernel_memory: BlockAllocator::new(
                KERNEL_PARTITION_BASE,
                KERNEL_PARTITION_SIZE,
                DEFAULT_GRAIN,
            ),
            ready: ReadyQueue::default(),
            threads: Vec::new(),
            current: None,
            needs_reschedule: false,
            vblank_waiters: Vec::new(),
            vblank_cycles: config.cpu_hz / VBLANK_PER_SECOND,
            frame_count: 0,
            exited: false,
            poison_hle_args: config.poison_hle_args,
            module_gp: 0,
            exit_callback: None,
        };
        kernel.write_return_stubs(memory);
        kernel.interrupts.allocate_stack(&mut kernel.kernel_memory);
        let vblank = kernel.vblank_cycles;
        kernel.timer.schedule(vblank, KernelEvent::VBlank);
        kernel
    }

    fn write_return_stubs(&self, memory: &mut Memory) {
        for (address, name) in [
            (CALLBACK_RETURN_ADDRESS, hle::FAKE_CALLBACK_RETURN),
            (THREAD_RETURN_ADDRESS, hle::FAKE_THREAD_RETURN),
            (INTERRUPT_RETURN_ADDRESS, hle::FAKE_INTERRUPT_RETURN),
        ] {
            let code = self
                .hle
                .code_for(hle::FAKE_MODULE, name)
                .unwrap_or_default();
            memory.write_u32(address, hle::syscall_instruction(code));
            memory.write_u32(address + 4, 0);
        }
    }

    #[must_use]
    pub const fn current_thread(&self) -> Option<Uid> {
        self.current
    }

    #[must_use]
    pub fn current_thread_ref(&self) -> Option<&Thread> {
        self.current.and_then(|uid| self.objects.get::<Thread>(uid))
    }

    /// Every live thread, in creation order.
    #[must_use]
    pub fn threads(&self) -> &[Uid] {
        &self.threads
    }

    #[must_use]
    pub const fn has_exited(&self) -> bool {
        self.exited
    }

    /// Marks the process as finished. The driver stops at the next step.
    pub fn exit_game(&mut self) {
        info!("guest requested exit");
        self.exited = true;
        self.needs_reschedule = true;
    }

    #[must_use]
    pub const fn frame_count(&self) -> u64 {
        self.frame_count
    }

    #[must_use]
    pub const fn poison_hle_args(&self) -> bool {
        self.poison_hle_args
    }

    #[must_use]
    pub const fn module_gp(&self) -> u32 {
        self.module_gp
    }

    pub const fn set_module_gp(&mut self, gp: u32) {
        self.module_gp = gp;
    }

    pub const fn set_exit_callback(&mut self, callback: Uid) {
        self.exit_callback = Some(callback);
    }

    #[must_use]
    pub const fn exit_callback(&self) -> Option<Uid> {
        self.exit_callback
    }

    /// Asks the driver to run the scheduler before the next instruction.
    pub const fn request_reschedule(&mut self) {
        self.needs_reschedule = true;
    }

    #[must_use]
    pub const fn reschedule_pending(&self) -> bool {
        self.needs_reschedule
    }

    /// Fires every event that is due.
    pub fn process_events(&mut self, memory: &mut Memory) {
        while let Some(event) = self.timer.pop_due() {
            trace!("event {event:?} at cycle {}", self.timer.now());
            match event {
                KernelEvent::WaitTimeout { thread, wait, id } => {
                    self.handle_wait_timeout(memory, thread, wait, id);
                }
                KernelEvent::DelayWake { thread } => {
                    self.end_wait(memory, thread, WaitType::Delay, 0, error::OK);
                }
                KernelEvent::VBlank => self.vblank(memory),
            }
        }
    }

    fn vblank(&mut self, memory: &mut Memory) {
        self.frame_count += 1;
        debug!("vblank {}", self.frame_count);
        for thread in std::mem::take(&mut self.vblank_waiters) {
            self.end_wait(memory, thread, WaitType::VBlank, 0, error::OK);
        }
        self.interrupts.trigger(VBLANK_INTERRUPT);
        let vblank = self.vblank_cycles;
        self.timer.schedule(vblank, KernelEvent::VBlank);
    }

    /// Blocks the current thread until the next vblank.
    pub fn wait_vblank(&mut self, allow_callbacks: bool) -> Result<(), u32> {
        self.wait_current_thread(WaitType::VBlank, 0, allow_callbacks)?;
        if let Some(current) = self.current {
            self.vblank_waiters.push(current);
        }
        Ok(())
    }

    /// Spends idle time: jumps to the next scheduled event and fires it.
    /// Returns `false` when nothing is scheduled that could wake a thread.
    pub fn idle(&mut self, memory: &mut Memory) -> bool {
        if !self.has_waiting_threads() && !self.interrupts.has_handlers() {
            return false;
        }
        let Some(next) = self.timer.next_event_time() else {
            return false;
        };
        self.timer.advance_to(next);
        self.process_events(memory);
        true
    }

    /// Wakes the threads synchronizing on display lists that completed and
    /// raises the GE interrupt for each. Draw-sync waiters wake once the GE
    /// is `idle`.
    pub fn finish_display_lists(&mut self, memory: &mut Memory, completed: &[u32], idle: bool) {
        for &list in completed {
            for tid in self.threads.clone() {
                self.end_wait(memory, tid, WaitType::GeListSync, list, error::OK);
            }
            self.interrupts.trigger(GE_INTERRUPT);
        }
        if idle && !completed.is_empty() {
            for tid in self.threads.clone() {
                self.end_wait(memory, tid, WaitType::GeDrawSync, 0, error::OK);
            }
        }
    }

    fn has_waiting_threads(&self) -> bool {
        self.threads.iter().any(|uid| {
            self.objects.get::<Thread>(*uid).is_some_and(|t| {
                matches!(t.status, ThreadStatus::Waiting | ThreadStatus::WaitSuspend)
            })
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use pretty_assertions::assert_eq;

    /// Kernel, CPU and memory with one running thread at priority 0x20.
    pub(crate) fn setup() -> (Kernel, Cpu, Memory, Uid) {
        let mut memory = Memory::new();
        let mut cpu = Cpu::new();
        let mut kernel = Kernel::new(&Config::default(), &mut memory);
        let main = spawn(&mut kernel, &mut memory, "main", 0x20);
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        (kernel, cpu, memory, main)
    }

    /// Creates and starts a thread whose entry point is an infinite loop.
    pub(crate) fn spawn(kernel: &mut Kernel, memory: &mut Memory, name: &str, priority: u32) -> Uid {
        let entry = 0x0880_0000;
        // beq $zero, $zero, -1 ; nop
        memory.write_u32(entry, 0x1000_FFFF);
        memory.write_u32(entry + 4, 0);
        let uid = kernel
            .create_thread(memory, name, entry, priority, 0x4000, 0, None)
            .unwrap();
        kernel.start_thread(memory, uid, 0, 0).unwrap();
        uid
    }

    #[test]
    fn return_stubs_are_syscalls() {
        let mut memory = Memory::new();
        let kernel = Kernel::new(&Config::default(), &mut memory);
        for address in [
            CALLBACK_RETURN_ADDRESS,
            THREAD_RETURN_ADDRESS,
            INTERRUPT_RETURN_ADDRESS,
        ] {
            assert_eq!(memory.read_u32(address) & 0xFC00_003F, 0x0000_000C);
        }
        assert!(kernel.timer.next_event_time().is_some());
    }

    #[test]
    fn vblank_wakes_waiters() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        kernel.wait_vblank(false).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), None);
        assert!(kernel.idle(&mut memory));
        assert_eq!(kernel.frame_count(), 1);
        assert_eq!(
            kernel.objects.get::<Thread>(main).unwrap().status,
            ThreadStatus::Ready
        );
    }
}
