//! `sceGe_user`: display list submission and synchronization.
//!
//! Lists run as soon as they are queued or their stall address moves, so a
//! sync call usually finds them finished. When a list is stalled the caller
//! blocks until the main loop completes it.

use tracing::debug;

use crate::gpu::state::MAX_BONES;
use crate::gpu::{Gpu, ListStatus};
use crate::kernel::interrupt::GE_INTERRUPT;
use crate::kernel::thread::WaitType;
use crate::kernel::{Kernel, error};
use crate::memory::{Memory, VRAM_BASE, VRAM_SIZE};

use super::{Hle, HleFunction, HleRegistry, HleReturn};

const MODULE: &str = "sceGe_user";
const MAX_CALLBACKS: u32 = 16;
const CONTEXT_WORDS: u32 = 512;

const FUNCTIONS: &[(u32, HleFunction)] = &[
    (0xE47E_40E4, HleFunction::new("sceGeEdramGetAddr", edram_get_addr)),
    (0x1F67_52AD, HleFunction::new("sceGeEdramGetSize", edram_get_size)),
    (0xAB49_E76A, HleFunction::new("sceGeListEnQueue", list_enqueue)),
    (0x1C0D_95A6, HleFunction::new("sceGeListEnQueueHead", list_enqueue_head)),
    (0x5FB8_6AB0, HleFunction::new("sceGeListDeQueue", list_dequeue)),
    (0xE0D6_8148, HleFunction::new("sceGeListUpdateStallAddr", list_update_stall_addr)),
    (0x0344_4EB4, HleFunction::new("sceGeListSync", list_sync)),
    (0xB287_BD61, HleFunction::new("sceGeDrawSync", draw_sync)),
    (0xA4FC_06A4, HleFunction::new("sceGeSetCallback", set_callback)),
    (0x05DB_22CE, HleFunction::new("sceGeUnsetCallback", unset_callback)),
    (0xDC93_CFD4, HleFunction::new("sceGeGetCmd", get_cmd)),
    (0x57C8_945B, HleFunction::new("sceGeGetMtx", get_mtx)),
    (0x438A_385A, HleFunction::new("sceGeSaveContext", save_context)),
    (0x0BF6_08FB, HleFunction::new("sceGeRestoreContext", restore_context)),
];

pub(super) fn register(registry: &mut HleRegistry) {
    for (nid, function) in FUNCTIONS {
        registry.register(MODULE, *nid, *function);
    }
}

/// Runs whatever the GE can make progress on and lets the kernel wake the
/// threads synchronizing on it.
pub fn run_display_lists(gpu: &mut Gpu, kernel: &mut Kernel, memory: &mut Memory) {
    if gpu.is_idle() {
        return;
    }
    let completed = gpu.process(memory);
    kernel.finish_display_lists(memory, &completed, gpu.is_idle());
}

fn edram_get_addr(_hle: &mut Hle) -> HleReturn {
    HleReturn::U32(VRAM_BASE)
}

fn edram_get_size(_hle: &mut Hle) -> HleReturn {
    HleReturn::U32(VRAM_SIZE)
}

fn enqueue(hle: &mut Hle, head: bool) -> HleReturn {
    let (start, stall) = (hle.arg(0), hle.arg(1));
    if start & 3 != 0 || !hle.memory.is_valid_address(start) {
        return HleReturn::U32(error::ILLEGAL_ADDR);
    }
    let id = if head {
        hle.gpu.enqueue_head(start, stall)
    } else {
        hle.gpu.enqueue(start, stall)
    };
    let Some(id) = id else {
        return HleReturn::U32(error::GE_LIST_FULL);
    };
    run_display_lists(hle.gpu, hle.kernel, hle.memory);
    HleReturn::U32(id)
}

fn list_enqueue(hle: &mut Hle) -> HleReturn {
    enqueue(hle, false)
}

fn list_enqueue_head(hle: &mut Hle) -> HleReturn {
    enqueue(hle, true)
}

fn list_dequeue(hle: &mut Hle) -> HleReturn {
    if hle.gpu.dequeue(hle.arg(0)) {
        HleReturn::U32(error::OK)
    } else {
        HleReturn::U32(error::GE_INVALID_ID)
    }
}

fn list_update_stall_addr(hle: &mut Hle) -> HleReturn {
    if !hle.gpu.update_stall(hle.arg(0), hle.arg(1)) {
        return HleReturn::U32(error::GE_INVALID_ID);
    }
    run_display_lists(hle.gpu, hle.kernel, hle.memory);
    HleReturn::U32(error::OK)
}

fn list_sync(hle: &mut Hle) -> HleReturn {
    let (id, mode) = (hle.arg(0), hle.arg(1));
    let Some(status) = hle.gpu.list_status(id) else {
        return HleReturn::U32(error::GE_INVALID_ID);
    };
    match mode {
        1 => HleReturn::U32(status.code()),
        0 if status == ListStatus::Completed => HleReturn::U32(error::OK),
        0 => hle
            .kernel
            .wait_current_thread(WaitType::GeListSync, id, false)
            .map(|_| ())
            .into(),
        _ => HleReturn::U32(error::GE_INVALID_MODE),
    }
}

fn draw_sync(hle: &mut Hle) -> HleReturn {
    let status = hle.gpu.draw_status();
    match hle.arg(0) {
        1 => HleReturn::U32(status.code()),
        0 if status == ListStatus::Completed => HleReturn::U32(error::OK),
        0 => hle
            .kernel
            .wait_current_thread(WaitType::GeDrawSync, 0, false)
            .map(|_| ())
            .into(),
        _ => HleReturn::U32(error::GE_INVALID_MODE),
    }
}

/// Registers the finish handler of a `PspGeCallbackData` as a GE
/// sub-interrupt. The callback id is the sub-interrupt number.
fn set_callback(hle: &mut Hle) -> HleReturn {
    let data = hle.arg(0);
    if data == 0 {
        return HleReturn::U32(error::ILLEGAL_ARGUMENT);
    }
    let signal = hle.memory.read_u32(data);
    let finish = hle.memory.read_u32(data + 8);
    let finish_arg = hle.memory.read_u32(data + 12);
    let Some(id) = (0..MAX_CALLBACKS).find(|&sub| !hle.kernel.interrupts.is_registered(GE_INTERRUPT, sub)) else {
        return HleReturn::U32(error::GE_LIST_FULL);
    };
    if signal != 0 {
        debug!("GE signal handler {signal:#010x} is never called");
    }
    let registered = hle
        .kernel
        .register_sub_interrupt(GE_INTERRUPT, id, finish, finish_arg)
        .and_then(|()| hle.kernel.interrupts.set_enabled(GE_INTERRUPT, id, finish != 0));
    match registered {
        Ok(()) => HleReturn::U32(id),
        Err(code) => HleReturn::U32(code),
    }
}

fn unset_callback(hle: &mut Hle) -> HleReturn {
    hle.kernel.interrupts.release(GE_INTERRUPT, hle.arg(0)).into()
}

fn get_cmd(hle: &mut Hle) -> HleReturn {
    let command = hle.arg(0);
    match hle.gpu.state.regs.get(command as usize) {
        Some(data) => HleReturn::U32((command << 24) | data),
        None => HleReturn::U32(error::ILLEGAL_ARGUMENT),
    }
}

fn get_mtx(hle: &mut Hle) -> HleReturn {
    let (kind, out) = (hle.arg(0) as usize, hle.arg(1));
    let state = &hle.gpu.state;
    let matrix: &[f32] = match kind {
        0..MAX_BONES => &state.bones[kind],
        8 => &state.world,
        9 => &state.view,
        10 => &state.projection,
        11 => &state.tgen,
        _ => return HleReturn::U32(error::ILLEGAL_ARGUMENT),
    };
    let matrix = matrix.to_vec();
    for (i, value) in matrix.into_iter().enumerate() {
        hle.memory.write_f32(out + 4 * i as u32, value);
    }
    HleReturn::U32(error::OK)
}

fn save_context(hle: &mut Hle) -> HleReturn {
    let out = hle.arg(0);
    if !hle.memory.is_valid_address(out + CONTEXT_WORDS * 4 - 1) {
        return HleReturn::U32(error::ILLEGAL_ADDR);
    }
    for (i, data) in hle.gpu.state.regs.iter().enumerate() {
        hle.memory.write_u32(out + 4 * i as u32, *data);
    }
    HleReturn::U32(error::OK)
}

/// Reapplies a saved register file. Matrices are not part of it.
fn restore_context(hle: &mut Hle) -> HleReturn {
    let from = hle.arg(0);
    if !hle.memory.is_valid_address(from + CONTEXT_WORDS * 4 - 1) {
        return HleReturn::U32(error::ILLEGAL_ADDR);
    }
    for command in 0..=u8::MAX {
        let data = hle.memory.read_u32(from + 4 * u32::from(command));
        hle.gpu.state.regs[usize::from(command)] = data;
    }
    hle.gpu.invalidate_texture(0, u32::MAX);
    HleReturn::U32(error::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::cpu::Cpu;
    use crate::gpu::commands as cmd;
    use crate::kernel::filesystem::MetaFileSystem;
    use crate::kernel::hle::tests::call_with;
    use crate::kernel::tests::setup;
    use crate::memory::RAM_BASE;
    use pretty_assertions::assert_eq;

    const LIST: u32 = RAM_BASE + 0x0010_0000;

    /// Calls into `sceGe_user` against a GE that survives between calls.
    fn ge_call(kernel: &mut Kernel, cpu: &mut Cpu, memory: &mut Memory, gpu: &mut Gpu, nid: u32, args: &[u32]) -> u32 {
        let mut fs = MetaFileSystem::new();
        let mut hle = Hle {
            cpu,
            memory,
            kernel,
            gpu,
            fs: &mut fs,
        };
        call_with(&mut hle, MODULE, nid, args)
    }

    fn write_list(memory: &mut Memory) -> u32 {
        let words = [
            (u32::from(cmd::MINZ) << 24) | 3,
            u32::from(cmd::FINISH) << 24,
            u32::from(cmd::END) << 24,
        ];
        for (i, w) in words.iter().enumerate() {
            memory.write_u32(LIST + 4 * i as u32, *w);
        }
        LIST + 12
    }

    #[test]
    fn stalled_lists_block_sync_until_updated() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        let mut gpu = Gpu::new(&Config::default());
        let end = write_list(&mut memory);

        let id = ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0xAB49_E76A, &[LIST, LIST + 4, 0, 0]);
        assert_eq!(id, 0);
        assert_eq!(
            ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0x0344_4EB4, &[id, 1]),
            ListStatus::Stalled.code()
        );
        ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0x0344_4EB4, &[id, 0]);
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), None);

        // another thread would move the stall; do it directly
        gpu.update_stall(id, end);
        run_display_lists(&mut gpu, &mut kernel, &mut memory);
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(gpu.state.depth_range().0, 3);
    }

    #[test]
    fn finished_lists_raise_the_callback() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        let mut gpu = Gpu::new(&Config::default());
        let end = write_list(&mut memory);
        let data = RAM_BASE + 0x0020_0000;
        memory.write_u32(data + 8, 0x0880_1000);
        memory.write_u32(data + 12, 0x55);

        let cb = ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0xA4FC_06A4, &[data]);
        assert_eq!(cb, 0);
        assert!(kernel.interrupts.is_registered(GE_INTERRUPT, 0));
        let second = ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0xA4FC_06A4, &[data]);
        assert_eq!(second, 1);

        ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0xAB49_E76A, &[LIST, end, 0, 0]);
        assert!(gpu.is_idle());
        assert!(kernel.interrupts.has_pending());
        assert_eq!(ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0xB287_BD61, &[0]), error::OK);

        assert_eq!(ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0x05DB_22CE, &[cb]), error::OK);
        assert!(!kernel.interrupts.is_registered(GE_INTERRUPT, 0));
    }

    #[test]
    fn bad_arguments() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        let mut gpu = Gpu::new(&Config::default());
        assert_eq!(
            ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0xAB49_E76A, &[LIST + 2, 0, 0, 0]),
            error::ILLEGAL_ADDR
        );
        assert_eq!(
            ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0x0344_4EB4, &[200, 0]),
            error::GE_INVALID_ID
        );
        assert_eq!(
            ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0xB287_BD61, &[5]),
            error::GE_INVALID_MODE
        );
    }

    #[test]
    fn context_and_matrices_are_readable() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        let mut gpu = Gpu::new(&Config::default());
        gpu.state.apply(cmd::MAXZ, 0x1234);
        let out = RAM_BASE + 0x0030_0000;

        assert_eq!(ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0x57C8_945B, &[8, out]), error::OK);
        assert_eq!(memory.read_f32(out), 1.0);
        assert_eq!(
            ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0xDC93_CFD4, &[u32::from(cmd::MAXZ)]),
            (u32::from(cmd::MAXZ) << 24) | 0x1234
        );

        ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0x438A_385A, &[out]);
        gpu.state.apply(cmd::MAXZ, 0);
        ge_call(&mut kernel, &mut cpu, &mut memory, &mut gpu, 0x0BF6_08FB, &[out]);
        assert_eq!(gpu.state.depth_range().1, 0x1234);
    }
}
