//! `ThreadManForUser`: threads, synchronization primitives, callbacks and
//! the system clock.

use crate::kernel::error;
use crate::kernel::thread::{Thread, ThreadStatus};

use super::{Hle, HleFunction, HleRegistry, HleReturn};

const MODULE: &str = "ThreadManForUser";

const FUNCTIONS: &[(u32, HleFunction)] = &[
    (0x446D_8DE6, HleFunction::new("sceKernelCreateThread", create_thread)),
    (0xF475_845D, HleFunction::new("sceKernelStartThread", start_thread)),
    (0xAA73_C935, HleFunction::new("sceKernelExitThread", exit_thread)),
    (0x809C_E29B, HleFunction::new("sceKernelExitDeleteThread", exit_delete_thread)),
    (0x6164_03BA, HleFunction::new("sceKernelTerminateThread", terminate_thread)),
    (0x383F_7BCC, HleFunction::new("sceKernelTerminateDeleteThread", terminate_delete_thread)),
    (0x9FA0_3CD3, HleFunction::new("sceKernelDeleteThread", delete_thread)),
    (0x71BC_9871, HleFunction::new("sceKernelChangeThreadPriority", change_thread_priority)),
    (0x9123_54A7, HleFunction::new("sceKernelRotateThreadReadyQueue", rotate_thread_ready_queue)),
    (0x9944_F31F, HleFunction::new("sceKernelSuspendThread", suspend_thread)),
    (0x7515_6E8F, HleFunction::new("sceKernelResumeThread", resume_thread)),
    (0x9ACE_131E, HleFunction::new("sceKernelSleepThread", sleep_thread)),
    (0x8282_6F70, HleFunction::new("sceKernelSleepThreadCB", sleep_thread_cb)),
    (0xD59E_AD2F, HleFunction::new("sceKernelWakeupThread", wakeup_thread)),
    (0xCEAD_EB47, HleFunction::new("sceKernelDelayThread", delay_thread)),
    (0x68DA_9E36, HleFunction::new("sceKernelDelayThreadCB", delay_thread_cb)),
    (0x278C_0DF5, HleFunction::new("sceKernelWaitThreadEnd", wait_thread_end)),
    (0x840E_8133, HleFunction::new("sceKernelWaitThreadEndCB", wait_thread_end_cb)),
    (0x293B_45B8, HleFunction::new("sceKernelGetThreadId", get_thread_id)),
    (0x94AA_61EE, HleFunction::new("sceKernelGetThreadCurrentPriority", get_thread_current_priority)),
    (0x3B18_3E26, HleFunction::new("sceKernelGetThreadExitStatus", get_thread_exit_status)),
    (0xD6DA_4BA1, HleFunction::new("sceKernelCreateSema", create_sema)),
    (0x28B6_489C, HleFunction::new("sceKernelDeleteSema", delete_sema)),
    (0x3F53_E640, HleFunction::new("sceKernelSignalSema", signal_sema)),
    (0x4E3A_1105, HleFunction::new("sceKernelWaitSema", wait_sema)),
    (0x6D21_2BAC, HleFunction::new("sceKernelWaitSemaCB", wait_sema_cb)),
    (0x58B1_F936, HleFunction::new("sceKernelPollSema", poll_sema)),
    (0x8FFD_F9A4, HleFunction::new("sceKernelCancelSema", cancel_sema)),
    (0xBC6F_EBC5, HleFunction::new("sceKernelReferSemaStatus", refer_sema_status)),
    (0xB7D0_98C6, HleFunction::new("sceKernelCreateMutex", create_mutex)),
    (0xF817_0FBE, HleFunction::new("sceKernelDeleteMutex", delete_mutex)),
    (0xB011_B11F, HleFunction::new("sceKernelLockMutex", lock_mutex)),
    (0x5BF4_DD27, HleFunction::new("sceKernelLockMutexCB", lock_mutex_cb)),
    (0x0DDC_D2C9, HleFunction::new("sceKernelTryLockMutex", try_lock_mutex)),
    (0x6B30_100F, HleFunction::new("sceKernelUnlockMutex", unlock_mutex)),
    (0x87D9_223C, HleFunction::new("sceKernelCancelMutex", cancel_mutex)),
    (0xA9C2_CB9A, HleFunction::new("sceKernelReferMutexStatus", refer_mutex_status)),
    (0x55C2_0A00, HleFunction::new("sceKernelCreateEventFlag", create_event_flag)),
    (0xEF9E_4C70, HleFunction::new("sceKernelDeleteEventFlag", delete_event_flag)),
    (0x1FB1_5A32, HleFunction::new("sceKernelSetEventFlag", set_event_flag)),
    (0x8123_46E4, HleFunction::new("sceKernelClearEventFlag", clear_event_flag)),
    (0x402F_CF22, HleFunction::new("sceKernelWaitEventFlag", wait_event_flag)),
    (0x328C_546A, HleFunction::new("sceKernelWaitEventFlagCB", wait_event_flag_cb)),
    (0x30FD_48F0, HleFunction::new("sceKernelPollEventFlag", poll_event_flag)),
    (0xCD20_3292, HleFunction::new("sceKernelCancelEventFlag", cancel_event_flag)),
    (0xA66B_0120, HleFunction::new("sceKernelReferEventFlagStatus", refer_event_flag_status)),
    (0xE81C_AF8F, HleFunction::new("sceKernelCreateCallback", create_callback)),
    (0xEDBA_5844, HleFunction::new("sceKernelDeleteCallback", delete_callback)),
    (0xC11B_A8C4, HleFunction::new("sceKernelNotifyCallback", notify_callback)),
    (0xBA40_51D6, HleFunction::new("sceKernelCancelCallback", cancel_callback)),
    (0x2A3D_44FF, HleFunction::new("sceKernelGetCallbackCount", get_callback_count)),
    (0x349D_6D6C, HleFunction::new("sceKernelCheckCallback", check_callback)),
    (0x369E_D59D, HleFunction::new("sceKernelGetSystemTimeLow", get_system_time_low)),
    (0x82BC_5777, HleFunction::new("sceKernelGetSystemTimeWide", get_system_time_wide)),
    (0xDB73_8F35, HleFunction::new("sceKernelGetSystemTime", get_system_time)),
];

pub(super) fn register(registry: &mut HleRegistry) {
    for (nid, function) in FUNCTIONS {
        registry.register(MODULE, *nid, *function);
    }
}

fn create_thread(hle: &mut Hle) -> HleReturn {
    let name = hle.arg_string(0);
    let (entry, priority, stack_size, attr) = (hle.arg(1), hle.arg(2), hle.arg(3), hle.arg(4));
    let module = hle.kernel.current_thread_ref().and_then(|t| t.module);
    hle.kernel
        .create_thread(hle.memory, &name, entry, priority, stack_size, attr, module)
        .into()
}

fn start_thread(hle: &mut Hle) -> HleReturn {
    let (uid, arglen, argp) = (hle.arg(0), hle.arg(1), hle.arg(2));
    hle.kernel.start_thread(hle.memory, uid, arglen, argp).into()
}

fn exit_thread(hle: &mut Hle) -> HleReturn {
    let status = hle.arg(0);
    hle.kernel.exit_thread(hle.memory, status).into()
}

fn exit_delete_thread(hle: &mut Hle) -> HleReturn {
    let status = hle.arg(0);
    hle.kernel.exit_delete_thread(hle.memory, status).into()
}

fn terminate_thread(hle: &mut Hle) -> HleReturn {
    let uid = hle.arg(0);
    hle.kernel.terminate_thread(hle.memory, uid).into()
}

fn terminate_delete_thread(hle: &mut Hle) -> HleReturn {
    let uid = hle.arg(0);
    hle.kernel.terminate_delete_thread(hle.memory, uid).into()
}

fn delete_thread(hle: &mut Hle) -> HleReturn {
    hle.kernel.delete_thread(hle.arg(0)).into()
}

fn change_thread_priority(hle: &mut Hle) -> HleReturn {
    hle.kernel.change_thread_priority(hle.arg(0), hle.arg(1)).into()
}

fn rotate_thread_ready_queue(hle: &mut Hle) -> HleReturn {
    hle.kernel.rotate_thread_ready_queue(hle.arg(0)).into()
}

fn suspend_thread(hle: &mut Hle) -> HleReturn {
    hle.kernel.suspend_thread(hle.arg(0)).into()
}

fn resume_thread(hle: &mut Hle) -> HleReturn {
    hle.kernel.resume_thread(hle.arg(0)).into()
}

fn sleep_thread(hle: &mut Hle) -> HleReturn {
    hle.kernel.sleep_thread(false).into()
}

fn sleep_thread_cb(hle: &mut Hle) -> HleReturn {
    hle.kernel.sleep_thread(true).into()
}

fn wakeup_thread(hle: &mut Hle) -> HleReturn {
    let uid = hle.arg(0);
    hle.kernel.wakeup_thread(hle.memory, uid).into()
}

fn delay_thread(hle: &mut Hle) -> HleReturn {
    hle.kernel.delay_thread(hle.arg(0), false).into()
}

fn delay_thread_cb(hle: &mut Hle) -> HleReturn {
    hle.kernel.delay_thread(hle.arg(0), true).into()
}

fn wait_thread_end(hle: &mut Hle) -> HleReturn {
    let (uid, timeout_ptr) = (hle.arg(0), hle.arg(1));
    hle.kernel.wait_thread_end(hle.memory, uid, timeout_ptr, false).into()
}

fn wait_thread_end_cb(hle: &mut Hle) -> HleReturn {
    let (uid, timeout_ptr) = (hle.arg(0), hle.arg(1));
    hle.kernel.wait_thread_end(hle.memory, uid, timeout_ptr, true).into()
}

fn get_thread_id(hle: &mut Hle) -> HleReturn {
    HleReturn::U32(hle.kernel.current_thread().unwrap_or(error::ILLEGAL_CONTEXT))
}

fn get_thread_current_priority(hle: &mut Hle) -> HleReturn {
    HleReturn::U32(
        hle.kernel
            .current_thread_ref()
            .map_or(error::ILLEGAL_CONTEXT, |t| t.priority),
    )
}

fn get_thread_exit_status(hle: &mut Hle) -> HleReturn {
    let status = match hle.kernel.objects.get::<Thread>(hle.arg(0)) {
        None => error::UNKNOWN_THID,
        Some(t) if t.status != ThreadStatus::Dormant => error::NOT_DORMANT,
        Some(t) => t.exit_status,
    };
    HleReturn::U32(status)
}

fn create_sema(hle: &mut Hle) -> HleReturn {
    let name = hle.arg_string(0);
    let (attr, init, max) = (hle.arg(1), hle.arg_i32(2), hle.arg_i32(3));
    hle.kernel.create_semaphore(&name, attr, init, max).into()
}

fn delete_sema(hle: &mut Hle) -> HleReturn {
    let uid = hle.arg(0);
    hle.kernel.delete_semaphore(hle.memory, uid).into()
}

fn signal_sema(hle: &mut Hle) -> HleReturn {
    let (uid, count) = (hle.arg(0), hle.arg_i32(1));
    hle.kernel.signal_semaphore(hle.memory, uid, count).into()
}

fn wait_sema(hle: &mut Hle) -> HleReturn {
    let (uid, need, timeout_ptr) = (hle.arg(0), hle.arg_i32(1), hle.arg(2));
    hle.kernel
        .wait_semaphore(hle.memory, uid, need, timeout_ptr, false)
        .into()
}

fn wait_sema_cb(hle: &mut Hle) -> HleReturn {
    let (uid, need, timeout_ptr) = (hle.arg(0), hle.arg_i32(1), hle.arg(2));
    hle.kernel
        .wait_semaphore(hle.memory, uid, need, timeout_ptr, true)
        .into()
}

fn poll_sema(hle: &mut Hle) -> HleReturn {
    hle.kernel.poll_semaphore(hle.arg(0), hle.arg_i32(1)).into()
}

fn cancel_sema(hle: &mut Hle) -> HleReturn {
    let (uid, count, num_wait_ptr) = (hle.arg(0), hle.arg_i32(1), hle.arg(2));
    hle.kernel
        .cancel_semaphore(hle.memory, uid, count, num_wait_ptr)
        .into()
}

fn refer_sema_status(hle: &mut Hle) -> HleReturn {
    let (uid, info_ptr) = (hle.arg(0), hle.arg(1));
    hle.kernel.refer_semaphore(hle.memory, uid, info_ptr).into()
}

fn create_mutex(hle: &mut Hle) -> HleReturn {
    let name = hle.arg_string(0);
    let (attr, init) = (hle.arg(1), hle.arg_i32(2));
    hle.kernel.create_mutex(&name, attr, init).into()
}

fn delete_mutex(hle: &mut Hle) -> HleReturn {
    let uid = hle.arg(0);
    hle.kernel.delete_mutex(hle.memory, uid).into()
}

fn lock_mutex(hle: &mut Hle) -> HleReturn {
    let (uid, count, timeout_ptr) = (hle.arg(0), hle.arg_i32(1), hle.arg(2));
    hle.kernel
        .lock_mutex(hle.memory, uid, count, timeout_ptr, false)
        .into()
}

fn lock_mutex_cb(hle: &mut Hle) -> HleReturn {
    let (uid, count, timeout_ptr) = (hle.arg(0), hle.arg_i32(1), hle.arg(2));
    hle.kernel
        .lock_mutex(hle.memory, uid, count, timeout_ptr, true)
        .into()
}

fn try_lock_mutex(hle: &mut Hle) -> HleReturn {
    hle.kernel.try_lock_mutex(hle.arg(0), hle.arg_i32(1)).into()
}

fn unlock_mutex(hle: &mut Hle) -> HleReturn {
    let (uid, count) = (hle.arg(0), hle.arg_i32(1));
    hle.kernel.unlock_mutex(hle.memory, uid, count).into()
}

fn cancel_mutex(hle: &mut Hle) -> HleReturn {
    let (uid, count, num_wait_ptr) = (hle.arg(0), hle.arg_i32(1), hle.arg(2));
    hle.kernel
        .cancel_mutex(hle.memory, uid, count, num_wait_ptr)
        .into()
}

fn refer_mutex_status(hle: &mut Hle) -> HleReturn {
    let (uid, info_ptr) = (hle.arg(0), hle.arg(1));
    hle.kernel.refer_mutex(hle.memory, uid, info_ptr).into()
}

fn create_event_flag(hle: &mut Hle) -> HleReturn {
    let name = hle.arg_string(0);
    let (attr, bits) = (hle.arg(1), hle.arg(2));
    hle.kernel.create_event_flag(&name, attr, bits).into()
}

fn delete_event_flag(hle: &mut Hle) -> HleReturn {
    let uid = hle.arg(0);
    hle.kernel.delete_event_flag(hle.memory, uid).into()
}

fn set_event_flag(hle: &mut Hle) -> HleReturn {
    let (uid, bits) = (hle.arg(0), hle.arg(1));
    hle.kernel.set_event_flag(hle.memory, uid, bits).into()
}

fn clear_event_flag(hle: &mut Hle) -> HleReturn {
    hle.kernel.clear_event_flag(hle.arg(0), hle.arg(1)).into()
}

fn wait_event_flag(hle: &mut Hle) -> HleReturn {
    let (uid, bits, mode, out, timeout_ptr) = (hle.arg(0), hle.arg(1), hle.arg(2), hle.arg(3), hle.arg(4));
    hle.kernel
        .wait_event_flag(hle.memory, uid, bits, mode, out, timeout_ptr, false)
        .into()
}

fn wait_event_flag_cb(hle: &mut Hle) -> HleReturn {
    let (uid, bits, mode, out, timeout_ptr) = (hle.arg(0), hle.arg(1), hle.arg(2), hle.arg(3), hle.arg(4));
    hle.kernel
        .wait_event_flag(hle.memory, uid, bits, mode, out, timeout_ptr, true)
        .into()
}

fn poll_event_flag(hle: &mut Hle) -> HleReturn {
    let (uid, bits, mode, out) = (hle.arg(0), hle.arg(1), hle.arg(2), hle.arg(3));
    hle.kernel
        .poll_event_flag(hle.memory, uid, bits, mode, out)
        .into()
}

fn cancel_event_flag(hle: &mut Hle) -> HleReturn {
    let (uid, pattern, num_wait_ptr) = (hle.arg(0), hle.arg(1), hle.arg(2));
    hle.kernel
        .cancel_event_flag(hle.memory, uid, pattern, num_wait_ptr)
        .into()
}

fn refer_event_flag_status(hle: &mut Hle) -> HleReturn {
    let (uid, info_ptr) = (hle.arg(0), hle.arg(1));
    hle.kernel.refer_event_flag(hle.memory, uid, info_ptr).into()
}

fn create_callback(hle: &mut Hle) -> HleReturn {
    let name = hle.arg_string(0);
    let (entry, common) = (hle.arg(1), hle.arg(2));
    hle.kernel.create_callback(&name, entry, common).into()
}

fn delete_callback(hle: &mut Hle) -> HleReturn {
    hle.kernel.delete_callback(hle.arg(0)).into()
}

fn notify_callback(hle: &mut Hle) -> HleReturn {
    hle.kernel.notify_callback(hle.arg(0), hle.arg(1)).into()
}

fn cancel_callback(hle: &mut Hle) -> HleReturn {
    hle.kernel.cancel_callback(hle.arg(0)).into()
}

fn get_callback_count(hle: &mut Hle) -> HleReturn {
    hle.kernel.get_callback_count(hle.arg(0)).into()
}

fn check_callback(hle: &mut Hle) -> HleReturn {
    HleReturn::U32(hle.kernel.check_callbacks())
}

fn get_system_time_low(hle: &mut Hle) -> HleReturn {
    HleReturn::U32(hle.kernel.timer.now_us() as u32)
}

fn get_system_time_wide(hle: &mut Hle) -> HleReturn {
    HleReturn::U64(hle.kernel.timer.now_us())
}

/// Fills a `SceKernelSysClock` (two words, low first).
fn get_system_time(hle: &mut Hle) -> HleReturn {
    let address = hle.arg(0);
    if address == 0 {
        return HleReturn::U32(error::ILLEGAL_ADDR);
    }
    let now = hle.kernel.timer.now_us();
    hle.memory.write_u32(address, now as u32);
    hle.memory.write_u32(address + 4, (now >> 32) as u32);
    HleReturn::U32(error::OK)
}

#[cfg(test)]
mod tests {
    use crate::cpu::registers::REG_V0;
    use crate::kernel::error;
    use crate::kernel::hle::tests::call;
    use crate::kernel::semaphore::Semaphore;
    use crate::kernel::tests::setup;
    use crate::kernel::thread::{Thread, ThreadStatus};
    use pretty_assertions::assert_eq;

    const NAME: u32 = 0x0880_8000;

    #[test]
    fn semaphore_wait_blocks_and_signal_wakes() {
        let (mut kernel, mut cpu, mut memory, main) = setup();
        memory.write_cstring(NAME, "sema");
        let sema = call(&mut kernel, &mut cpu, &mut memory, "ThreadManForUser", 0xD6DA_4BA1, &[NAME, 0, 0, 1, 0]);
        assert_eq!(kernel.objects.get::<Semaphore>(sema).unwrap().name, "sema");

        let v0 = call(&mut kernel, &mut cpu, &mut memory, "ThreadManForUser", 0x4E3A_1105, &[sema, 1, 0]);
        assert_eq!(v0, error::OK);
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), None);
        assert_eq!(kernel.objects.get::<Thread>(main).unwrap().status, ThreadStatus::Waiting);

        kernel.signal_semaphore(&mut memory, sema, 1).unwrap();
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.state.register(REG_V0), error::OK);
    }

    #[test]
    fn bad_uids_surface_as_status_codes() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        let v0 = call(&mut kernel, &mut cpu, &mut memory, "ThreadManForUser", 0x3F53_E640, &[0x999, 1]);
        assert_eq!(v0, error::UNKNOWN_SEMID);
        let v0 = call(&mut kernel, &mut cpu, &mut memory, "ThreadManForUser", 0x3B18_3E26, &[0x999]);
        assert_eq!(v0, error::UNKNOWN_THID);
    }
}
