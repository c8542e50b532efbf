//! Counting semaphores.

use tracing::debug;

use crate::memory::Memory;

use super::Kernel;
use super::error;
use super::object::Uid;
use super::thread::WaitType;

/// Waiters are served by thread priority instead of arrival.
pub const SEMA_ATTR_PRIORITY: u32 = 0x100;
const SEMA_INFO_SIZE: u32 = 56;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaWaiter {
    pub thread: Uid,
    pub need: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Semaphore {
    pub name: String,
    pub attr: u32,
    pub init_count: i32,
    pub count: i32,
    pub max_count: i32,
    pub waiters: Vec<SemaWaiter>,
}

pub(super) const fn normalize_timeout(us: u64) -> u64 {
    match us {
        0..=3 => 24,
        4..=249 => 245,
        _ => us,
    }
}

/// Writes the first 31 bytes of `name` plus a NUL into a 32-byte field.
pub(super) fn write_name(memory: &mut Memory, address: u32, name: &str) {
    let mut field = [0u8; 32];
    let len = name.len().min(31);
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
    memory.copy_from_slice(address, &field);
}

impl Kernel {
    pub fn create_semaphore(&mut self, name: &str, attr: u32, init: i32, max: i32) -> Result<Uid, u32> {
        if attr >= 0x200 {
            return Err(error::ILLEGAL_ATTR);
        }
        if init < 0 || max <= 0 || init > max {
            return Err(error::ILLEGAL_COUNT);
        }
        let sema = Semaphore {
            name: name.to_string(),
            attr,
            init_count: init,
            count: init,
            max_count: max,
            waiters: Vec::new(),
        };
        let uid = self.objects.create(sema).ok_or(error::NO_MEMORY)?;
        debug!("created semaphore {name} ({uid:#x}) {init}/{max}");
        Ok(uid)
    }

    pub fn delete_semaphore(&mut self, memory: &mut Memory, uid: Uid) -> Result<(), u32> {
        let sema = self.objects.destroy_as::<Semaphore>(uid).ok_or(error::UNKNOWN_SEMID)?;
        for waiter in sema.waiters {
            self.end_wait(memory, waiter.thread, WaitType::Semaphore, uid, error::WAIT_DELETE);
        }
        self.needs_reschedule = true;
        Ok(())
    }

    /// Adds `count` and grants every waiter that can now be satisfied.
    pub fn signal_semaphore(&mut self, memory: &mut Memory, uid: Uid, count: i32) -> Result<(), u32> {
        let sema = self.objects.get_mut::<Semaphore>(uid).ok_or(error::UNKNOWN_SEMID)?;
        let waiting = i32::try_from(sema.waiters.len()).unwrap_or(i32::MAX);
        if i64::from(sema.count) + i64::from(count) - i64::from(waiting) > i64::from(sema.max_count) {
            return Err(error::SEMA_OVF);
        }
        sema.count += count;
        self.process_semaphore_waiters(memory, uid);
        Ok(())
    }

    pub(super) fn process_semaphore_waiters(&mut self, memory: &mut Memory, uid: Uid) {
        let Some(sema) = self.objects.get::<Semaphore>(uid) else {
            return;
        };
        let mut order = sema.waiters.clone();
        if sema.attr & SEMA_ATTR_PRIORITY != 0 {
            order.sort_by_key(|w| self.thread_priority(w.thread));
        }

        let mut granted = Vec::new();
        if let Some(sema) = self.objects.get_mut::<Semaphore>(uid) {
            for waiter in order {
                if sema.count >= waiter.need {
                    sema.count -= waiter.need;
                    granted.push(waiter.thread);
                }
            }
            sema.waiters.retain(|w| !granted.contains(&w.thread));
        }
        for thread in granted {
            self.end_wait(memory, thread, WaitType::Semaphore, uid, error::OK);
        }
    }

    /// Takes `need` units, blocking the current thread while there are not
    /// enough or others are already queued.
    pub fn wait_semaphore(
        &mut self,
        memory: &Memory,
        uid: Uid,
        need: i32,
        timeout_ptr: u32,
        allow_callbacks: bool,
    ) -> Result<(), u32> {
        if need <= 0 {
            return Err(error::ILLEGAL_COUNT);
        }
        let sema = self.objects.get_mut::<Semaphore>(uid).ok_or(error::UNKNOWN_SEMID)?;
        if need > sema.max_count {
            return Err(error::ILLEGAL_COUNT);
        }
        if sema.count >= need && sema.waiters.is_empty() {
            sema.count -= need;
            return Ok(());
        }

        let thread = self.current.ok_or(error::ILLEGAL_CONTEXT)?;
        self.wait_current_thread(WaitType::Semaphore, uid, allow_callbacks)?;
        if let Some(sema) = self.objects.get_mut::<Semaphore>(uid) {
            sema.waiters.push(SemaWaiter { thread, need });
        }
        self.arm_timeout(memory, WaitType::Semaphore, uid, timeout_ptr, normalize_timeout);
        Ok(())
    }

    pub fn poll_semaphore(&mut self, uid: Uid, need: i32) -> Result<(), u32> {
        if need <= 0 {
            return Err(error::ILLEGAL_COUNT);
        }
        let sema = self.objects.get_mut::<Semaphore>(uid).ok_or(error::UNKNOWN_SEMID)?;
        if sema.count >= need && sema.waiters.is_empty() {
            sema.count -= need;
            Ok(())
        } else {
            Err(error::SEMA_ZERO)
        }
    }

    /// Releases every waiter with `WAIT_CANCEL` and resets the count. A
    /// negative `new_count` restores the initial count.
    pub fn cancel_semaphore(
        &mut self,
        memory: &mut Memory,
        uid: Uid,
        new_count: i32,
        num_wait_ptr: u32,
    ) -> Result<(), u32> {
        let sema = self.objects.get_mut::<Semaphore>(uid).ok_or(error::UNKNOWN_SEMID)?;
        if new_count > sema.max_count {
            return Err(error::ILLEGAL_COUNT);
        }
        if num_wait_ptr != 0 {
            memory.write_u32(num_wait_ptr, sema.waiters.len() as u32);
        }
        sema.count = if new_count < 0 { sema.init_count } else { new_count };
        let waiters = std::mem::take(&mut sema.waiters);
        for waiter in waiters {
            self.end_wait(memory, waiter.thread, WaitType::Semaphore, uid, error::WAIT_CANCEL);
        }
        self.needs_reschedule = true;
        Ok(())
    }

    /// Fills a `SceKernelSemaInfo` at `info_ptr`.
    pub fn refer_semaphore(&self, memory: &mut Memory, uid: Uid, info_ptr: u32) -> Result<(), u32> {
        let sema = self.objects.get::<Semaphore>(uid).ok_or(error::UNKNOWN_SEMID)?;
        if info_ptr == 0 {
            return Err(error::ILLEGAL_ADDR);
        }
        memory.write_u32(info_ptr, SEMA_INFO_SIZE);
        write_name(memory, info_ptr + 4, &sema.name);
        memory.write_u32(info_ptr + 36, sema.attr);
        memory.write_u32(info_ptr + 40, sema.init_count.cast_unsigned());
        memory.write_u32(info_ptr + 44, sema.count.cast_unsigned());
        memory.write_u32(info_ptr + 48, sema.max_count.cast_unsigned());
        memory.write_u32(info_ptr + 52, sema.waiters.len() as u32);
        Ok(())
    }
}
