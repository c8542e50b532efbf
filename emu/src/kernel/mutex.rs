//! Owned, optionally recursive locks.
//!
//! A mutex remembers its owner and a lock count. The owner may lock again
//! only when the mutex was created recursive; anybody else queues up. When
//! the count drops to zero the mutex passes straight to the next waiter.

use tracing::debug;

use crate::memory::Memory;

use super::Kernel;
use super::error;
use super::object::Uid;
use super::semaphore::write_name;
use super::thread::WaitType;

pub const MUTEX_ATTR_PRIORITY: u32 = 0x100;
pub const MUTEX_ATTR_RECURSIVE: u32 = 0x200;
const MUTEX_INFO_SIZE: u32 = 56;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutexWaiter {
    pub thread: Uid,
    pub count: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutex {
    pub name: String,
    pub attr: u32,
    pub init_count: i32,
    pub lock_count: i32,
    pub owner: Option<Uid>,
    pub waiters: Vec<MutexWaiter>,
}

impl Mutex {
    #[must_use]
    pub const fn is_recursive(&self) -> bool {
        self.attr & MUTEX_ATTR_RECURSIVE != 0
    }
}

pub(super) const fn normalize_timeout(us: u64) -> u64 {
    match us {
        0..=3 => 25,
        4..=249 => 250,
        _ => us,
    }
}

/// What a lock attempt found.
enum Acquire {
    Taken,
    Contended,
}

impl Kernel {
    pub fn create_mutex(&mut self, name: &str, attr: u32, init_count: i32) -> Result<Uid, u32> {
        if attr >= 0xC00 {
            return Err(error::ILLEGAL_ATTR);
        }
        let recursive = attr & MUTEX_ATTR_RECURSIVE != 0;
        if init_count < 0 || (!recursive && init_count > 1) {
            return Err(error::ILLEGAL_COUNT);
        }
        let owner = if init_count > 0 { self.current } else { None };
        let mutex = Mutex {
            name: name.to_string(),
            attr,
            init_count,
            lock_count: init_count,
            owner,
            waiters: Vec::new(),
        };
        let uid = self.objects.create(mutex).ok_or(error::NO_MEMORY)?;
        debug!("created mutex {name} ({uid:#x})");
        Ok(uid)
    }

    pub fn delete_mutex(&mut self, memory: &mut Memory, uid: Uid) -> Result<(), u32> {
        let mutex = self.objects.destroy_as::<Mutex>(uid).ok_or(error::MUTEX_NOT_FOUND)?;
        for waiter in mutex.waiters {
            self.end_wait(memory, waiter.thread, WaitType::Mutex, uid, error::WAIT_DELETE);
        }
        self.needs_reschedule = true;
        Ok(())
    }

    /// Shared validation and fast path of lock and try-lock.
    fn try_acquire(&mut self, uid: Uid, count: i32) -> Result<Acquire, u32> {
        if count <= 0 {
            return Err(error::ILLEGAL_COUNT);
        }
        let current = self.current.ok_or(error::ILLEGAL_CONTEXT)?;
        let mutex = self.objects.get_mut::<Mutex>(uid).ok_or(error::MUTEX_NOT_FOUND)?;
        if count > 1 && !mutex.is_recursive() {
            return Err(error::ILLEGAL_COUNT);
        }
        if mutex.lock_count == 0 {
            mutex.owner = Some(current);
            mutex.lock_count = count;
            return Ok(Acquire::Taken);
        }
        if mutex.owner == Some(current) {
            if !mutex.is_recursive() {
                return Err(error::MUTEX_RECURSIVE_NOT_ALLOWED);
            }
            mutex.lock_count = mutex
                .lock_count
                .checked_add(count)
                .ok_or(error::MUTEX_LOCK_OVERFLOW)?;
            return Ok(Acquire::Taken);
        }
        Ok(Acquire::Contended)
    }

    pub fn lock_mutex(
        &mut self,
        memory: &Memory,
        uid: Uid,
        count: i32,
        timeout_ptr: u32,
        allow_callbacks: bool,
    ) -> Result<(), u32> {
        match self.try_acquire(uid, count)? {
            Acquire::Taken => Ok(()),
            Acquire::Contended => {
                let thread = self.current.ok_or(error::ILLEGAL_CONTEXT)?;
                self.wait_current_thread(WaitType::Mutex, uid, allow_callbacks)?;
                if let Some(mutex) = self.objects.get_mut::<Mutex>(uid) {
                    mutex.waiters.push(MutexWaiter { thread, count });
                }
                self.arm_timeout(memory, WaitType::Mutex, uid, timeout_ptr, normalize_timeout);
                Ok(())
            }
        }
    }

    pub fn try_lock_mutex(&mut self, uid: Uid, count: i32) -> Result<(), u32> {
        match self.try_acquire(uid, count)? {
            Acquire::Taken => Ok(()),
            Acquire::Contended => Err(error::MUTEX_TRYLOCK_FAILED),
        }
    }

    pub fn unlock_mutex(&mut self, memory: &mut Memory, uid: Uid, count: i32) -> Result<(), u32> {
        let mutex = self.objects.get_mut::<Mutex>(uid).ok_or(error::MUTEX_NOT_FOUND)?;
        if count <= 0 || (count > 1 && !mutex.is_recursive()) {
            return Err(error::ILLEGAL_COUNT);
        }
        if mutex.lock_count == 0 || mutex.owner != self.current {
            return Err(error::MUTEX_NOT_LOCKED);
        }
        if mutex.lock_count < count {
            return Err(error::MUTEX_UNLOCK_UNDERFLOW);
        }
        mutex.lock_count -= count;
        if mutex.lock_count == 0 {
            mutex.owner = None;
            self.hand_off_mutex(memory, uid);
        }
        Ok(())
    }

    /// Gives an unlocked mutex to the first eligible waiter.
    pub(super) fn hand_off_mutex(&mut self, memory: &mut Memory, uid: Uid) {
        let Some(mutex) = self.objects.get::<Mutex>(uid) else {
            return;
        };
        if mutex.lock_count != 0 || mutex.waiters.is_empty() {
            return;
        }
        let index = if mutex.attr & MUTEX_ATTR_PRIORITY == 0 {
            0
        } else {
            mutex
                .waiters
                .iter()
                .enumerate()
                .min_by_key(|(i, w)| (self.thread_priority(w.thread), *i))
                .map_or(0, |(i, _)| i)
        };
        let Some(mutex) = self.objects.get_mut::<Mutex>(uid) else {
            return;
        };
        let next = mutex.waiters.remove(index);
        mutex.owner = Some(next.thread);
        mutex.lock_count = next.count;
        debug!("mutex {} handed to {:#x}", mutex.name, next.thread);
        self.end_wait(memory, next.thread, WaitType::Mutex, uid, error::OK);
    }

    /// Wakes all waiters with `WAIT_CANCEL` and forces the lock count. A
    /// positive count makes the caller the owner.
    pub fn cancel_mutex(
        &mut self,
        memory: &mut Memory,
        uid: Uid,
        new_count: i32,
        num_wait_ptr: u32,
    ) -> Result<(), u32> {
        let current = self.current;
        let mutex = self.objects.get_mut::<Mutex>(uid).ok_or(error::MUTEX_NOT_FOUND)?;
        if new_count > 1 && !mutex.is_recursive() {
            return Err(error::ILLEGAL_COUNT);
        }
        if num_wait_ptr != 0 {
            memory.write_u32(num_wait_ptr, mutex.waiters.len() as u32);
        }
        if new_count <= 0 {
            mutex.owner = None;
            mutex.lock_count = 0;
        } else {
            mutex.owner = current;
            mutex.lock_count = new_count;
        }
        let waiters = std::mem::take(&mut mutex.waiters);
        for waiter in waiters {
            self.end_wait(memory, waiter.thread, WaitType::Mutex, uid, error::WAIT_CANCEL);
        }
        self.needs_reschedule = true;
        Ok(())
    }

    /// Fills a `SceKernelMutexInfo` at `info_ptr`.
    pub fn refer_mutex(&self, memory: &mut Memory, uid: Uid, info_ptr: u32) -> Result<(), u32> {
        let mutex = self.objects.get::<Mutex>(uid).ok_or(error::MUTEX_NOT_FOUND)?;
        if info_ptr == 0 {
            return Err(error::ILLEGAL_ADDR);
        }
        memory.write_u32(info_ptr, MUTEX_INFO_SIZE);
        write_name(memory, info_ptr + 4, &mutex.name);
        memory.write_u32(info_ptr + 36, mutex.attr);
        memory.write_u32(info_ptr + 40, mutex.init_count.cast_unsigned());
        memory.write_u32(info_ptr + 44, mutex.lock_count.cast_unsigned());
        memory.write_u32(info_ptr + 48, mutex.owner.unwrap_or(u32::MAX));
        memory.write_u32(info_ptr + 52, mutex.waiters.len() as u32);
        Ok(())
    }

    /// Unlocks everything `thread` holds, as when it exits.
    pub(super) fn release_mutexes_owned_by(&mut self, memory: &mut Memory, thread: Uid) {
        for uid in self.objects.uids_of::<Mutex>() {
            let Some(mutex) = self.objects.get_mut::<Mutex>(uid) else {
                continue;
            };
            if mutex.owner != Some(thread) {
                continue;
            }
            debug!("releasing mutex {} held by exiting thread {thread:#x}", mutex.name);
            mutex.owner = None;
            mutex.lock_count = 0;
            self.hand_off_mutex(memory, uid);
        }
    }
}
