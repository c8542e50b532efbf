//! # Event Flags
//!
//! A 32-bit pattern threads can wait on:
//!
//! ```text
//!   mode  0x01   OR   any bit of `bits` set
//!         0x00   AND  every bit of `bits` set
//!         0x10   clear the whole pattern once satisfied
//!         0x20   clear only `bits` once satisfied
//! ```

use tracing::debug;

use crate::memory::Memory;

use super::Kernel;
use super::error;
use super::object::Uid;
use super::semaphore::write_name;
use super::thread::WaitType;

pub const EVENT_WAIT_AND: u32 = 0x00;
pub const EVENT_WAIT_OR: u32 = 0x01;
pub const EVENT_WAIT_CLEAR_ALL: u32 = 0x10;
pub const EVENT_WAIT_CLEAR: u32 = 0x20;
const EVENT_WAIT_KNOWN: u32 = EVENT_WAIT_OR | EVENT_WAIT_CLEAR_ALL | EVENT_WAIT_CLEAR;

pub const EVENT_ATTR_PRIORITY: u32 = 0x100;
/// More than one thread may wait at a time.
pub const EVENT_ATTR_MULTI: u32 = 0x200;
const EVENT_INFO_SIZE: u32 = 52;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventFlagWaiter {
    pub thread: Uid,
    pub bits: u32,
    pub mode: u32,
    pub out_bits_ptr: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventFlag {
    pub name: String,
    pub attr: u32,
    pub init_pattern: u32,
    pub pattern: u32,
    pub waiters: Vec<EventFlagWaiter>,
}

impl EventFlag {
    /// Checks `bits` against the pattern and applies the clear mode when
    /// satisfied. The pattern seen before clearing goes to `out_bits_ptr`.
    fn try_match(&mut self, memory: &mut Memory, bits: u32, mode: u32, out_bits_ptr: u32) -> bool {
        let satisfied = if mode & EVENT_WAIT_OR != 0 {
            self.pattern & bits != 0
        } else {
            self.pattern & bits == bits
        };
        if !satisfied {
            return false;
        }
        if out_bits_ptr != 0 {
            memory.write_u32(out_bits_ptr, self.pattern);
        }
        if mode & EVENT_WAIT_CLEAR_ALL != 0 {
            self.pattern = 0;
        } else if mode & EVENT_WAIT_CLEAR != 0 {
            self.pattern &= !bits;
        }
        true
    }
}

pub(super) const fn normalize_timeout(us: u64) -> u64 {
    match us {
        0..=1 => 25,
        2..=209 => 240,
        _ => us,
    }
}

const fn check_request(bits: u32, mode: u32) -> Result<(), u32> {
    if mode & !EVENT_WAIT_KNOWN != 0 {
        return Err(error::ILLEGAL_MODE);
    }
    if bits == 0 {
        return Err(error::EVF_ILPAT);
    }
    Ok(())
}

impl Kernel {
    pub fn create_event_flag(&mut self, name: &str, attr: u32, init_pattern: u32) -> Result<Uid, u32> {
        if attr & !0x2FF != 0 {
            return Err(error::ILLEGAL_ATTR);
        }
        let flag = EventFlag {
            name: name.to_string(),
            attr,
            init_pattern,
            pattern: init_pattern,
            waiters: Vec::new(),
        };
        let uid = self.objects.create(flag).ok_or(error::NO_MEMORY)?;
        debug!("created event flag {name} ({uid:#x}) pattern {init_pattern:#x}");
        Ok(uid)
    }

    pub fn delete_event_flag(&mut self, memory: &mut Memory, uid: Uid) -> Result<(), u32> {
        let flag = self.objects.destroy_as::<EventFlag>(uid).ok_or(error::UNKNOWN_EVFID)?;
        for waiter in flag.waiters {
            self.end_wait(memory, waiter.thread, WaitType::EventFlag, uid, error::WAIT_DELETE);
        }
        self.needs_reschedule = true;
        Ok(())
    }

    /// ORs `bits` into the pattern and wakes every waiter that now matches,
    /// in queue order.
    pub fn set_event_flag(&mut self, memory: &mut Memory, uid: Uid, bits: u32) -> Result<(), u32> {
        let flag = self.objects.get_mut::<EventFlag>(uid).ok_or(error::UNKNOWN_EVFID)?;
        flag.pattern |= bits;
        self.process_event_flag_waiters(memory, uid);
        Ok(())
    }

    /// Keeps only the pattern bits that are also set in `bits`.
    pub fn clear_event_flag(&mut self, uid: Uid, bits: u32) -> Result<(), u32> {
        let flag = self.objects.get_mut::<EventFlag>(uid).ok_or(error::UNKNOWN_EVFID)?;
        flag.pattern &= bits;
        Ok(())
    }

    pub(super) fn process_event_flag_waiters(&mut self, memory: &mut Memory, uid: Uid) {
        let Some(flag) = self.objects.get::<EventFlag>(uid) else {
            return;
        };
        let mut order = flag.waiters.clone();
        if flag.attr & EVENT_ATTR_PRIORITY != 0 {
            order.sort_by_key(|w| self.thread_priority(w.thread));
        }

        let mut woken = Vec::new();
        if let Some(flag) = self.objects.get_mut::<EventFlag>(uid) {
            for waiter in order {
                if flag.try_match(memory, waiter.bits, waiter.mode, waiter.out_bits_ptr) {
                    woken.push(waiter.thread);
                }
            }
            flag.waiters.retain(|w| !woken.contains(&w.thread));
        }
        for thread in woken {
            self.end_wait(memory, thread, WaitType::EventFlag, uid, error::OK);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn wait_event_flag(
        &mut self,
        memory: &mut Memory,
        uid: Uid,
        bits: u32,
        mode: u32,
        out_bits_ptr: u32,
        timeout_ptr: u32,
        allow_callbacks: bool,
    ) -> Result<(), u32> {
        check_request(bits, mode)?;
        let flag = self.objects.get_mut::<EventFlag>(uid).ok_or(error::UNKNOWN_EVFID)?;
        if !flag.waiters.is_empty() && flag.attr & EVENT_ATTR_MULTI == 0 {
            return Err(error::EVF_MULTI);
        }
        if flag.try_match(memory, bits, mode, out_bits_ptr) {
            return Ok(());
        }

        let thread = self.current.ok_or(error::ILLEGAL_CONTEXT)?;
        self.wait_current_thread(WaitType::EventFlag, uid, allow_callbacks)?;
        if let Some(flag) = self.objects.get_mut::<EventFlag>(uid) {
            flag.waiters.push(EventFlagWaiter {
                thread,
                bits,
                mode,
                out_bits_ptr,
            });
        }
        self.arm_timeout(memory, WaitType::EventFlag, uid, timeout_ptr, normalize_timeout);
        Ok(())
    }

    pub fn poll_event_flag(
        &mut self,
        memory: &mut Memory,
        uid: Uid,
        bits: u32,
        mode: u32,
        out_bits_ptr: u32,
    ) -> Result<(), u32> {
        check_request(bits, mode)?;
        let flag = self.objects.get_mut::<EventFlag>(uid).ok_or(error::UNKNOWN_EVFID)?;
        if !flag.waiters.is_empty() && flag.attr & EVENT_ATTR_MULTI == 0 {
            return Err(error::EVF_MULTI);
        }
        if flag.try_match(memory, bits, mode, out_bits_ptr) {
            return Ok(());
        }
        if out_bits_ptr != 0 {
            memory.write_u32(out_bits_ptr, flag.pattern);
        }
        Err(error::EVF_COND)
    }

    /// Sets the pattern and wakes every waiter with `WAIT_CANCEL`.
    pub fn cancel_event_flag(
        &mut self,
        memory: &mut Memory,
        uid: Uid,
        new_pattern: u32,
        num_wait_ptr: u32,
    ) -> Result<(), u32> {
        let flag = self.objects.get_mut::<EventFlag>(uid).ok_or(error::UNKNOWN_EVFID)?;
        if num_wait_ptr != 0 {
            memory.write_u32(num_wait_ptr, flag.waiters.len() as u32);
        }
        flag.pattern = new_pattern;
        let waiters = std::mem::take(&mut flag.waiters);
        for waiter in waiters {
            self.end_wait(memory, waiter.thread, WaitType::EventFlag, uid, error::WAIT_CANCEL);
        }
        self.needs_reschedule = true;
        Ok(())
    }

    /// Fills a `SceKernelEventFlagInfo` at `info_ptr`.
    pub fn refer_event_flag(&self, memory: &mut Memory, uid: Uid, info_ptr: u32) -> Result<(), u32> {
        let flag = self.objects.get::<EventFlag>(uid).ok_or(error::UNKNOWN_EVFID)?;
        if info_ptr == 0 {
            return Err(error::ILLEGAL_ADDR);
        }
        memory.write_u32(info_ptr, EVENT_INFO_SIZE);
        write_name(memory, info_ptr + 4, &flag.name);
        memory.write_u32(info_ptr + 36, flag.attr);
        memory.write_u32(info_ptr + 40, flag.init_pattern);
        memory.write_u32(info_ptr + 44, flag.pattern);
        memory.write_u32(info_ptr + 48, flag.waiters.len() as u32);
        Ok(())
    }
}
