//! # Event Timer
//!
//! A cycle counter plus an ordered queue of future kernel events. Events with
//! the same due time fire in scheduling order.
//!
//! ```text
//!   now ──────────┬─────────────┬──────────────┬────────▶ cycles
//!                 │             │              │
//!            WaitTimeout    DelayWake       VBlank
//! ```

use std::collections::{BTreeMap, HashMap};

use super::object::Uid;
use super::thread::WaitType;

/// Things the kernel schedules for later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelEvent {
    /// A timed wait ran out.
    WaitTimeout { thread: Uid, wait: WaitType, id: Uid },
    /// `sceKernelDelayThread` is over.
    DelayWake { thread: Uid },
    VBlank,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(u64);

pub struct EventTimer {
    now: u64,
    cycles_per_us: u64,
    next_sequence: u64,
    queue: BTreeMap<(u64, u64), KernelEvent>,
    due_times: HashMap<u64, u64>,
}

impl EventTimer {
    #[must_use]
    pub fn new(cpu_hz: u64) -> Self {
        Self {
            now: 0,
            cycles_per_us: (cpu_hz / 1_000_000).max(1),
            next_sequence: 0,
            queue: BTreeMap::new(),
            due_times: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn now(&self) -> u64 {
        self.now
    }

    #[must_use]
    pub const fn us_to_cycles(&self, us: u64) -> u64 {
        us * self.cycles_per_us
    }

    #[must_use]
    pub const fn cycles_to_us(&self, cycles: u64) -> u64 {
        cycles / self.cycles_per_us
    }

    /// Current time in microseconds.
    #[must_use]
    pub const fn now_us(&self) -> u64 {
        self.cycles_to_us(self.now)
    }

    /// Schedules `event` `cycles` from now.
    pub fn schedule(&mut self, cycles: u64, event: KernelEvent) -> EventHandle {
        let due = self.now + cycles;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.insert((due, sequence), event);
        self.due_times.insert(sequence, due);
        EventHandle(sequence)
    }

    /// Cancels a pending event. Returns the cycles that were left.
    pub fn unschedule(&mut self, handle: EventHandle) -> Option<u64> {
        let due = self.due_times.remove(&handle.0)?;
        self.queue.remove(&(due, handle.0));
        Some(due.saturating_sub(self.now))
    }

    #[must_use]
    pub fn remaining(&self, handle: EventHandle) -> Option<u64> {
        self.due_times
            .get(&handle.0)
            .map(|due| due.saturating_sub(self.now))
    }

    pub const fn advance(&mut self, cycles: u64) {
        self.now += cycles;
    }

    /// Moves time forward to `time` if it lies in the future.
    pub fn advance_to(&mut self, time: u64) {
        self.now = self.now.max(time);
    }

    #[must_use]
    pub fn next_event_time(&self) -> Option<u64> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Removes and returns the earliest event that is due.
    pub fn pop_due(&mut self) -> Option<KernelEvent> {
        let (&(due, sequence), _) = self.queue.iter().next()?;
        if due > self.now {
            return None;
        }
        self.due_times.remove(&sequence);
        self.queue.remove(&(due, sequence))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether anything other than the periodic vblank is pending.
    #[must_use]
    pub fn has_non_periodic_events(&self) -> bool {
        self.queue.values().any(|e| *e != KernelEvent::VBlank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn events_fire_in_time_order() {
        let mut timer = EventTimer::new(222_000_000);
        timer.schedule(100, KernelEvent::VBlank);
        timer.schedule(50, KernelEvent::DelayWake { thread: 0x100 });
        assert_eq!(timer.pop_due(), None);
        timer.advance(100);
        assert_eq!(timer.pop_due(), Some(KernelEvent::DelayWake { thread: 0x100 }));
        assert_eq!(timer.pop_due(), Some(KernelEvent::VBlank));
        assert!(timer.is_empty());
    }

    #[test]
    fn unschedule_reports_remaining_cycles() {
        let mut timer = EventTimer::new(222_000_000);
        let handle = timer.schedule(timer.us_to_cycles(10), KernelEvent::VBlank);
        timer.advance(222);
        assert_eq!(timer.remaining(handle), Some(222 * 9));
        assert_eq!(timer.unschedule(handle), Some(222 * 9));
        assert_eq!(timer.unschedule(handle), None);
        assert_eq!(timer.next_event_time(), None);
    }

    #[test]
    fn equal_due_times_keep_scheduling_order() {
        let mut timer = EventTimer::new(1_000_000);
        timer.schedule(5, KernelEvent::DelayWake { thread: 1 });
        timer.schedule(5, KernelEvent::DelayWake { thread: 2 });
        timer.advance_to(5);
        assert_eq!(timer.pop_due(), Some(KernelEvent::DelayWake { thread: 1 }));
        assert_eq!(timer.pop_due(), Some(KernelEvent::DelayWake { thread: 2 }));
    }
}
